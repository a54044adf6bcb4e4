//! Teambridge Bus - on-disk messaging, open requests, and agent presence
//!
//! Everything lives under one bridge root directory (0700):
//!
//! ```text
//! agents.json                         # registry
//! messages/<agent>/<ts>-<id8>.json    # one file per inbox message
//! requests/<ts>-<id8>.json            # one file per open request
//! ```
//!
//! One file per message gives natural per-object atomicity; lexicographic
//! filename order reflects creation-time order within an inbox.

pub mod lock;
pub mod messages;
pub mod registry;
pub mod requests;

pub use lock::LockFile;
pub use messages::{InboxFilter, MessageBus, MessageOptions};
pub use registry::{AgentRegistry, DEAD_THRESHOLD_MS, HEARTBEAT_INTERVAL_MS};
pub use requests::{ClaimOutcome, CreateRequestOptions};

use std::path::Path;

/// Create a directory (and parents) with owner-only permissions.
pub(crate) fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Sortable filename prefix: ISO timestamp with `:` and `.` replaced,
/// followed by the first 8 characters of the id.
pub(crate) fn sortable_filename(timestamp: chrono::DateTime<chrono::Utc>, id: &str) -> String {
    let ts = timestamp
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    let id8: String = id.chars().take(8).collect();
    format!("{}-{}.json", ts, id8)
}

/// Write JSON to `path` through a sibling temp file + rename.
pub(crate) fn write_json_atomic(path: &Path, value: &impl serde::Serialize) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
