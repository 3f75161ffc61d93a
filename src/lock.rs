//! Single-instance run lock.
//!
//! At most one conveyor instance may drive a given status store. The lock
//! is a JSON file naming the owner pid, linked into place atomically so
//! two racing acquisitions resolve to exactly one winner. A recorded
//! owner that is no longer alive marks the lock stale; it is removed and
//! the acquisition retried once. A live owner is a hard failure: the
//! caller exits immediately rather than queueing behind the running
//! instance.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::EngineError;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockDocument {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Held for the duration of a run; releases on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self, EngineError> {
        Self::acquire_for_pid(path, std::process::id())
    }

    fn acquire_for_pid(path: &Path, pid: u32) -> Result<Self, EngineError> {
        // second pass exists only to claim a stale lock removed on the first
        for attempt in 0..2 {
            match try_create(path, pid) {
                Ok(()) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                        pid,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match read_owner(path) {
                        Some(owner) if process_alive(owner) => {
                            return Err(EngineError::LockConflict { owner_pid: owner });
                        }
                        _ => {
                            // dead owner or unreadable file: stale
                            if attempt == 0 {
                                eprintln!(
                                    "[lock] removing stale lock at {}",
                                    path.display()
                                );
                                let _ = std::fs::remove_file(path);
                                continue;
                            }
                        }
                    }
                }
                Err(e) => {
                    return Err(EngineError::Other(
                        anyhow::Error::new(e).context(format!(
                            "Failed to create lock file {}",
                            path.display()
                        )),
                    ));
                }
            }
        }
        // lost the reclaim race twice; whoever holds it now owns the run
        Err(EngineError::LockConflict {
            owner_pid: read_owner(path).unwrap_or(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner_pid(&self) -> u32 {
        self.pid
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    /// Remove the lock file only while it still names us. A lock file
    /// rewritten by someone else (stale-reclaim race) is theirs to clean.
    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if read_owner(&self.path) == Some(self.pid) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Stage the full document, then hard-link it into place. Linking fails
/// with `AlreadyExists` when the lock is held, and the lock file never
/// exists in a partially written state, so a racing acquirer can never
/// misread a half-written lock as stale.
fn try_create(path: &Path, pid: u32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let doc = LockDocument {
        pid,
        acquired_at: Utc::now(),
    };
    let json = serde_json::to_string_pretty(&doc).map_err(std::io::Error::other)?;
    let staged = path.with_extension(format!("stage.{pid}"));
    std::fs::write(&staged, json.as_bytes())?;
    let linked = std::fs::hard_link(&staged, path);
    let _ = std::fs::remove_file(&staged);
    linked
}

fn read_owner(path: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(path).ok()?;
    let doc: LockDocument = serde_json::from_str(&raw).ok()?;
    Some(doc.pid)
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Best-effort sweep for `reset`: remove the lock regardless of owner
/// liveness, reporting whether a live owner was evicted.
pub fn force_remove(path: &Path) -> anyhow::Result<Option<u32>> {
    let owner = read_owner(path).filter(|pid| process_alive(*pid));
    match std::fs::remove_file(path) {
        Ok(()) => Ok(owner),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context(format!("Failed to remove lock file {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// A pid that is certainly not a live process.
    const DEAD_PID: u32 = 4_000_000_000;

    #[test]
    fn test_acquire_creates_lock_file_with_own_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json.lock");
        let lock = RunLock::acquire(&path).unwrap();
        assert!(path.exists());
        assert_eq!(read_owner(&path), Some(std::process::id()));
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_acquire_fails_busy_when_owner_is_alive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json.lock");
        // pid 1 is init and always alive
        let _holder = RunLock::acquire_for_pid(&path, 1).unwrap();

        let err = RunLock::acquire(&path).unwrap_err();
        match err {
            EngineError::LockConflict { owner_pid } => assert_eq!(owner_pid, 1),
            other => panic!("Expected LockConflict, got {other:?}"),
        }
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_stale_lock_from_dead_owner_is_reclaimed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json.lock");
        try_create(&path, DEAD_PID).unwrap();

        let lock = RunLock::acquire(&path).unwrap();
        assert_eq!(read_owner(&path), Some(std::process::id()));
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_unparseable_lock_file_is_treated_as_stale() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json.lock");
        std::fs::write(&path, "garbage, not a lock document").unwrap();

        let lock = RunLock::acquire(&path).unwrap();
        assert_eq!(read_owner(&path), Some(std::process::id()));
        drop(lock);
    }

    #[test]
    fn test_release_leaves_foreign_lock_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json.lock");
        let lock = RunLock::acquire(&path).unwrap();

        // someone rewrote the lock under us; releasing must not delete it
        std::fs::remove_file(&path).unwrap();
        try_create(&path, 1).unwrap();
        drop(lock);
        assert!(path.exists());
        assert_eq!(read_owner(&path), Some(1));
    }

    #[test]
    fn test_drop_releases_the_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json.lock");
        {
            let _lock = RunLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_concurrent_acquire_yields_one_winner_one_busy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json.lock");
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));

        let path_a = path.clone();
        let barrier_a = barrier.clone();
        let a = std::thread::spawn(move || {
            barrier_a.wait();
            RunLock::acquire_for_pid(&path_a, 1).map(|l| {
                // keep the file for the loser to observe, clean up after
                std::mem::forget(l);
            })
        });

        let path_b = path.clone();
        let barrier_b = barrier.clone();
        let b = std::thread::spawn(move || {
            barrier_b.wait();
            RunLock::acquire_for_pid(&path_b, std::process::id()).map(|l| {
                std::mem::forget(l);
            })
        });

        let results = [a.join().unwrap(), b.join().unwrap()];
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::LockConflict { .. })))
            .count();
        assert_eq!(winners, 1, "exactly one acquisition must win");
        assert_eq!(busy, 1, "the other must observe busy");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_force_remove_reports_live_owner() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json.lock");
        try_create(&path, 1).unwrap();
        let evicted = force_remove(&path).unwrap();
        assert_eq!(evicted, Some(1));
        assert!(!path.exists());

        // absent or dead-owner locks report nothing
        assert_eq!(force_remove(&path).unwrap(), None);
        try_create(&path, DEAD_PID).unwrap();
        assert_eq!(force_remove(&path).unwrap(), None);
    }
}
