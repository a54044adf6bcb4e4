//! Secret redaction for log output
//!
//! Every line written to the log file or stderr passes through `redact`
//! before leaving the process.

use regex::Regex;
use std::sync::OnceLock;

const REPLACEMENT: &str = "[REDACTED]";

fn patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"sk-[A-Za-z0-9_\-]{8,}",
            r"anthropic-[A-Za-z0-9_\-]{8,}",
            r"ghp_[A-Za-z0-9]{8,}",
            r"Bearer\s+[A-Za-z0-9._\-]+",
            r"(?i)api[-_]?key[=:]\s*\S+",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("redaction pattern is valid"))
        .collect()
    })
}

/// Replace API-key-shaped substrings with a placeholder.
pub fn redact(input: &str) -> String {
    let mut out = input.to_string();
    for re in patterns() {
        out = re.replace_all(&out, REPLACEMENT).into_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_known_key_shapes() {
        let cases = [
            "key is sk-abcdef1234567890",
            "token anthropic-zzzzyyyyxxxx",
            "gh token ghp_aaaabbbbccccdddd",
            "Authorization: Bearer eyJhbGciOi.payload",
            "API_KEY=supersecretvalue",
            "api-key: hunter2hunter2",
        ];
        for case in cases {
            let redacted = redact(case);
            assert!(redacted.contains("[REDACTED]"), "not redacted: {}", case);
        }
    }

    #[test]
    fn leaves_plain_text_alone() {
        let line = "task 123 completed in 42ms";
        assert_eq!(redact(line), line);
    }
}
