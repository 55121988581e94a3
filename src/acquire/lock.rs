//! Advisory per-source lockfile — spec.md §5 "Lockfile": prevents two
//! acquisitions from targeting the same source concurrently. The file
//! carries the owning PID; a stale PID (process no longer alive) is
//! treated as an unlocked file and reclaimed rather than refused.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("acquisition already in progress for this source (lock held by live pid {0})")]
    HeldByLivePid(u32),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// RAII guard: removes the lockfile when the coordinator finishes or is
/// dropped early (interrupt, early return, panic unwind).
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock for `source_key` (typically the source identifier,
    /// sanitized) under `lock_dir`. Refuses if the existing lock's PID is
    /// still alive; otherwise removes the stale file and takes it over.
    pub fn acquire(lock_dir: &Path, source_key: &str) -> Result<Self, LockError> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("{}.lock", sanitize(source_key)));

        if let Ok(existing) = fs::read_to_string(&path) {
            if let Ok(pid) = existing.trim().parse::<u32>() {
                if pid_is_alive(pid) {
                    return Err(LockError::HeldByLivePid(pid));
                }
            }
            fs::remove_file(&path)?;
        }

        let mut file = fs::File::create(&path)?;
        write!(file, "{}", std::process::id())?;
        Ok(Self { path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    // Signal 0 performs no action but still validates the PID; ESRCH
    // means the process is gone.
    unsafe { libc_kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    // Conservative: assume alive so a stale lock on an unsupported
    // platform never gets silently reclaimed.
    true
}

#[cfg(unix)]
extern "C" {
    #[link_name = "kill"]
    fn libc_kill(pid: i32, sig: i32) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_and_release() {
        let dir = tempdir().unwrap();
        {
            let _lock = RunLock::acquire(dir.path(), "dev-sda").unwrap();
            assert!(dir.path().join("dev_sda.lock").exists());
        }
        assert!(!dir.path().join("dev_sda.lock").exists());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev_sda.lock");
        std::fs::write(&path, "999999999").unwrap();
        let _lock = RunLock::acquire(dir.path(), "dev-sda").unwrap();
    }
}
