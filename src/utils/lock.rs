//! Advisory file locks.
//!
//! Two flavors are provided on top of the same PID-file primitive:
//! - [`InstanceLock`]: the process-wide single-instance lock kept for the
//!   whole daemon lifetime.
//! - [`FileLockGuard`]: a short-lived sibling `<file>.lock` protecting an
//!   icon cache file during read and atomic replace.
//!
//! A lock file records the owner PID. A lock whose owner is no longer alive
//! is reclaimed, so a crashed process never leaves a zombie lock behind.

use anyhow::{anyhow, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Check if a process with the given PID is still running.
fn is_pid_alive(pid: u32) -> bool {
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        std::process::Command::new("tasklist")
            .creation_flags(CREATE_NO_WINDOW)
            .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&format!("\"{pid}\"")))
            .unwrap_or(false)
    }
    #[cfg(not(windows))]
    {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// Try to acquire an exclusive lock file. Returns true if acquired.
fn try_acquire(lock_path: &Path) -> bool {
    let my_pid = std::process::id();

    // Atomic creation attempt, succeeds only if the file does not exist yet
    if let Ok(mut file) = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        let _ = write!(file, "{}", my_pid);
        let _ = file.flush();
        return true;
    }

    // Lock file exists: check whether the owning process is still alive
    if let Ok(contents) = std::fs::read_to_string(lock_path) {
        if let Ok(pid) = contents.trim().parse::<u32>() {
            if pid == my_pid {
                return true;
            }
            if is_pid_alive(pid) {
                return false;
            }
        }
    }

    // Stale lock: remove and retry the atomic creation
    let _ = std::fs::remove_file(lock_path);
    if let Ok(mut file) = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        let _ = write!(file, "{}", my_pid);
        let _ = file.flush();
        return true;
    }

    false
}

/// Guard that removes the lock file on drop.
#[derive(Debug)]
pub struct InstanceLock {
    lock_path: PathBuf,
}

impl InstanceLock {
    /// Acquire the single-instance lock, or fail if another live instance
    /// holds it.
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !try_acquire(lock_path) {
            return Err(anyhow!(
                "another instance is already running (lock: {})",
                lock_path.display()
            ));
        }
        Ok(Self {
            lock_path: lock_path.to_path_buf(),
        })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

/// Short-lived advisory lock on a sibling `<file>.lock`.
///
/// Retries briefly if another process holds the lock, since icon cache
/// operations complete in milliseconds.
#[derive(Debug)]
pub struct FileLockGuard {
    lock_path: PathBuf,
}

impl FileLockGuard {
    const RETRIES: u32 = 50;
    const RETRY_DELAY: Duration = Duration::from_millis(20);

    /// Lock the sibling `.lock` of `target`.
    pub fn lock(target: &Path) -> Result<Self> {
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        let lock_path = target.with_file_name(name);

        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        for _ in 0..Self::RETRIES {
            if try_acquire(&lock_path) {
                return Ok(Self { lock_path });
            }
            std::thread::sleep(Self::RETRY_DELAY);
        }

        Err(anyhow!(
            "failed to acquire file lock {}",
            lock_path.display()
        ))
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_lock_exclusive_within_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syf.lock");

        let first = InstanceLock::acquire(&path).unwrap();
        // Same PID re-acquires its own lock.
        assert!(try_acquire(&path));
        drop(first);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syf.lock");

        // Write a PID that cannot be alive.
        std::fs::write(&path, "4294967294").unwrap();
        let lock = InstanceLock::acquire(&path).unwrap();
        drop(lock);
    }

    #[test]
    fn test_file_lock_guard_removes_lock() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("icon.jpg");

        let guard = FileLockGuard::lock(&target).unwrap();
        assert!(dir.path().join("icon.jpg.lock").exists());
        drop(guard);
        assert!(!dir.path().join("icon.jpg.lock").exists());
    }
}
