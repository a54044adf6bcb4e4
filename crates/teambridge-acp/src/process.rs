//! Unix signal plumbing for agent processes
//!
//! These are the only `unsafe` calls in the crate — isolated here so the
//! rest of the code remains safe. The calls are sound because every pid
//! comes from `tokio::process::Child::id()` or a registry entry recorded
//! from one.

use std::time::Duration;

#[cfg(unix)]
#[allow(unsafe_code)]
pub fn sigterm(pid: u32) {
    // SAFETY: plain `kill(pid, SIGTERM)` per POSIX `kill(2)`.
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
pub fn sigkill(pid: u32) {
    // SAFETY: same rationale as `sigterm`.
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence per POSIX `kill(2)`.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn sigterm(_pid: u32) {}

#[cfg(not(unix))]
pub fn sigkill(_pid: u32) {}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// SIGTERM now, SIGKILL after `grace` if the process is still around.
pub async fn terminate_with_grace(pid: u32, grace: Duration) {
    sigterm(pid);
    tokio::time::sleep(grace).await;
    if pid_alive(pid) {
        sigkill(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn unused_pid_is_dead() {
        assert!(!pid_alive(u32::MAX - 3));
    }
}
