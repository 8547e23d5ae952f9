//! Single-writer PID-file guard preventing two daemon instances from
//! running against the same working directory at once.

use std::path::{Path, PathBuf};

use crate::error::SentrydError;

pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquire the lock, failing fatally if another process already
    /// holds it.
    pub fn acquire(path: PathBuf) -> Result<Self, SentrydError> {
        if path.exists() {
            if let Ok(raw) = std::fs::read_to_string(&path) {
                if let Ok(pid) = raw.trim().parse::<u32>() {
                    if process_is_alive(pid) {
                        return Err(SentrydError::Fatal(format!(
                            "lock file {} held by running process {pid}",
                            path.display()
                        )));
                    }
                }
            }
            log::warn!("removing stale lock file {}", path.display());
        }
        std::fs::write(&path, std::process::id().to_string())
            .map_err(|e| SentrydError::io(path.display().to_string(), e))?;
        Ok(Self { path })
    }

    pub fn release(self) {
        let _ = std::fs::remove_file(&self.path);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // Signal 0 performs no action but still validates the PID exists
    // and is reachable.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentryd.pid");
        let lock = LockFile::acquire(path.clone()).unwrap();
        assert!(path.exists());
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn stale_lock_from_dead_pid_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentryd.pid");
        // PID 0 never corresponds to a live user process on Linux, so
        // kill(0, 0) returns an error and the lock is treated as stale.
        std::fs::write(&path, "999999999").unwrap();
        let lock = LockFile::acquire(path.clone());
        assert!(lock.is_ok());
    }
}
