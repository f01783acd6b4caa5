//! Lock Manager (C10, spec §4.10): file-backed exclusive lock per service
//! with a structured JSON record and staleness detection, replacing the
//! starting point's fd-lock-based advisory lock -- the record content
//! (pid, hostname, timestamp) and the stale-replace rule have no `fd-lock`
//! equivalent, so this drops that dependency for plain atomic-rename.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const STALE_AFTER: Duration = Duration::from_secs(3 * 3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub service: String,
    pub backup_name: String,
    pub timestamp_unix: u64,
    pub pid: u32,
    pub hostname: String,
}

impl LockRecord {
    fn new(service: &str, backup_name: &str) -> Self {
        Self {
            service: service.to_string(),
            backup_name: backup_name.to_string(),
            timestamp_unix: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs(),
            pid: std::process::id(),
            hostname: hostname(),
        }
    }

    fn is_stale(&self) -> bool {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let age = now.saturating_sub(self.timestamp_unix);
        age > STALE_AFTER.as_secs() || !pid_alive(self.pid, &self.hostname)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(hostname_from_proc)
        .unwrap_or_else(|| "unknown".to_string())
}

fn hostname_from_proc() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname").ok().map(|s| s.trim().to_string())
}

fn pid_alive(pid: u32, recorded_hostname: &str) -> bool {
    if recorded_hostname != hostname() {
        // Can't check liveness of a pid on another host; assume alive.
        return true;
    }
    Path::new(&format!("/proc/{pid}")).exists()
}

pub struct LockManager {
    lock_dir: PathBuf,
}

/// A held lock; releases on `Drop` (best-effort, idempotent, mirroring the
/// starting point's `BackupLock` drop-based cleanup).
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("failed to remove lock file {:?}: {e}", self.path);
            }
        }
    }
}

impl LockManager {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self { lock_dir: backup_dir.into().join("locks") }
    }

    fn lock_path(&self, service: &str) -> PathBuf {
        self.lock_dir.join(format!("{service}.lock"))
    }

    /// Acquires the lock for `service`, returning `None` (not an error) if
    /// another live process already holds it -- spec §7 `LockHeld`: the
    /// service is skipped with a warning, not treated as a pipeline failure.
    pub fn acquire(&self, service: &str, backup_name: &str) -> Result<Option<LockGuard>> {
        std::fs::create_dir_all(&self.lock_dir).context("failed to create lock directory")?;
        let path = self.lock_path(service);

        if let Some(existing) = self.read_record(&path)? {
            if !existing.is_stale() {
                tracing::warn!("service '{service}' is already being backed up (lock held)");
                return Ok(None);
            }
            tracing::warn!("replacing stale lock for '{service}': {existing:?}");
        }

        let record = LockRecord::new(service, backup_name);
        let body = serde_json::to_vec_pretty(&record).context("failed to serialize lock record")?;

        let tmp_path = tmp_path_for(&path);
        std::fs::write(&tmp_path, &body).context("failed to write lock file")?;
        std::fs::rename(&tmp_path, &path).context("failed to publish lock file")?;

        Ok(Some(LockGuard { path }))
    }

    fn read_record(&self, path: &Path) -> Result<Option<LockRecord>> {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<LockRecord>(&bytes) {
                Ok(record) => Ok(Some(record)),
                Err(_) => {
                    // Malformed content is treated the same as a stale lock.
                    Ok(Some(LockRecord { service: String::new(), backup_name: String::new(), timestamp_unix: 0, pid: 0, hostname: String::new() }))
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("failed to read lock file"),
        }
    }

    /// Lists currently-held, non-stale lock records (used by C11 to never
    /// delete a path that is still in use, and by C12's `status()`).
    pub fn active_locks(&self) -> Result<Vec<LockRecord>> {
        let mut active = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.lock_dir) else { return Ok(active) };
        for entry in entries.flatten() {
            if let Some(record) = self.read_record(&entry.path())? {
                if !record.is_stale() {
                    active.push(record);
                }
            }
        }
        Ok(active)
    }

    /// Removes every stale lock file on disk, returning the count removed.
    pub fn sweep_stale(&self) -> Result<usize> {
        let Ok(entries) = std::fs::read_dir(&self.lock_dir) else { return Ok(0) };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if let Some(record) = self.read_record(&path)? {
                if record.is_stale() {
                    let _ = std::fs::remove_file(&path);
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_contend_refuses_second_caller() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path());
        let first = manager.acquire("foo", "foo_20260101_000000").unwrap();
        assert!(first.is_some());

        let second = manager.acquire("foo", "foo_20260101_000001").unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn release_on_drop_allows_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path());
        let first = manager.acquire("foo", "foo_20260101_000000").unwrap();
        drop(first);

        let second = manager.acquire("foo", "foo_20260101_000001").unwrap();
        assert!(second.is_some());
    }

    #[test]
    fn stale_lock_with_dead_pid_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path());
        let path = manager.lock_path("foo");
        std::fs::create_dir_all(dir.path().join("locks")).unwrap();
        let stale = LockRecord {
            service: "foo".to_string(),
            backup_name: "foo_old".to_string(),
            timestamp_unix: SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs(),
            pid: 999_999_999,
            hostname: hostname(),
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let acquired = manager.acquire("foo", "foo_new").unwrap();
        assert!(acquired.is_some());
    }

    #[test]
    fn lock_with_old_timestamp_is_stale_even_if_pid_alive() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path());
        let path = manager.lock_path("foo");
        std::fs::create_dir_all(dir.path().join("locks")).unwrap();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let stale = LockRecord {
            service: "foo".to_string(),
            backup_name: "foo_old".to_string(),
            timestamp_unix: now - (4 * 3600),
            pid: std::process::id(),
            hostname: hostname(),
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let acquired = manager.acquire("foo", "foo_new").unwrap();
        assert!(acquired.is_some());
    }
}
