//! Exclusive lock file with staleness detection
//!
//! One bridge instance per workspace: the lock file holds the owner's pid.
//! A lock whose recorded pid no longer responds to signal-0 is stale and is
//! reclaimed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use teambridge_core::{Error, Result};
use tracing::{debug, warn};

pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquire the lock at `path`, reclaiming it if the holder is gone.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match Self::try_create(&path) {
            Ok(()) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if Self::is_stale(&path) {
                    warn!("reclaiming stale lock {}", path.display());
                    let _ = std::fs::remove_file(&path);
                    Self::try_create(&path).map_err(Error::Io)?;
                    Ok(Self { path })
                } else {
                    Err(Error::Internal(format!(
                        "bridge already running (lock held at {})",
                        path.display()
                    )))
                }
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn try_create(path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;
        debug!("lock acquired at {}", path.display());
        Ok(())
    }

    /// A lock is stale when its pid is unreadable or no longer alive.
    fn is_stale(path: &Path) -> bool {
        let Ok(content) = std::fs::read_to_string(path) else {
            return true;
        };
        let Ok(pid) = content.trim().parse::<u32>() else {
            return true;
        };
        if pid == std::process::id() {
            return false;
        }
        !pid_alive(pid)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("cannot release lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence per POSIX `kill(2)`.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.lock");
        {
            let _lock = LockFile::acquire(&path).unwrap();
            assert!(path.exists());
            // Same process holds it; a second acquire fails
            assert!(LockFile::acquire(&path).is_err());
        }
        assert!(!path.exists());
    }

    #[test]
    fn stale_lock_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.lock");
        std::fs::write(&path, format!("{}", u32::MAX - 2)).unwrap();
        let lock = LockFile::acquire(&path).unwrap();
        assert_eq!(
            std::fs::read_to_string(lock.path()).unwrap().trim(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn garbage_lock_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.lock");
        std::fs::write(&path, "not-a-pid").unwrap();
        assert!(LockFile::acquire(&path).is_ok());
    }
}
