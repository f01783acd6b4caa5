//! Retention Engine (C11, spec §4.11): parses archive filenames into
//! `(service, timestamp)`, applies time/count/mixed policies, and never
//! deletes a path in the active-locks set.

use crate::config::RetentionPolicy;
use crate::lock::LockManager;
use anyhow::Result;
use chrono::{Datelike, NaiveDateTime, NaiveTime};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn archive_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+)_(\d{8}_\d{6})\.tar\.gz$").expect("valid regex"))
}

#[derive(Debug, Clone)]
pub struct Backup {
    pub path: PathBuf,
    pub service: String,
    pub backup_name: String,
    pub timestamp: NaiveDateTime,
}

/// Parses an archive filename per the retention contract; returns `None`
/// (never errors) for anything that doesn't match.
pub fn parse_archive_name(path: &Path) -> Option<Backup> {
    let file_name = path.file_name()?.to_str()?;
    let captures = archive_pattern().captures(file_name)?;
    let service = captures.get(1)?.as_str().to_string();
    let ts_str = captures.get(2)?.as_str();
    let timestamp = NaiveDateTime::parse_from_str(ts_str, "%Y%m%d_%H%M%S").ok()?;
    Some(Backup {
        path: path.to_path_buf(),
        service,
        backup_name: file_name.trim_end_matches(".tar.gz").to_string(),
        timestamp,
    })
}

fn list_backups(backup_dir: &Path) -> Vec<Backup> {
    let Ok(entries) = std::fs::read_dir(backup_dir) else { return Vec::new() };
    entries
        .flatten()
        .filter_map(|entry| parse_archive_name(&entry.path()))
        .collect()
}

/// Backups to keep under a time-based policy: newer than `days`.
fn keep_by_days<'a>(backups: &[&'a Backup], days: u32, now: NaiveDateTime) -> HashSet<&'a Path> {
    let cutoff = now - chrono::Duration::days(days as i64);
    backups.iter().filter(|b| b.timestamp >= cutoff).map(|b| b.path.as_path()).collect()
}

/// Backups to keep under a count-based policy: the N most recent.
fn keep_by_count<'a>(backups: &[&'a Backup], count: u32) -> HashSet<&'a Path> {
    let mut sorted: Vec<&&Backup> = backups.iter().collect();
    sorted.sort_by_key(|b| std::cmp::Reverse(b.timestamp));
    sorted.into_iter().take(count as usize).map(|b| b.path.as_path()).collect()
}

fn bucket_key_day(ts: NaiveDateTime) -> NaiveDateTime {
    ts.date().and_time(NaiveTime::MIN)
}

fn bucket_key_week(ts: NaiveDateTime) -> (i32, u32) {
    let iso = ts.iso_week();
    (iso.year(), iso.week())
}

fn bucket_key_month(ts: NaiveDateTime) -> (i32, u32) {
    (ts.year(), ts.month())
}

/// Keeps the newest backup per bucket, taking the `limit` most recent
/// buckets (sorted desc), for a generic bucket key.
fn top_per_bucket<'a, K: Ord + std::hash::Hash + Eq + Clone>(
    backups: &[&'a Backup],
    key_fn: impl Fn(NaiveDateTime) -> K,
    limit: u32,
) -> HashSet<&'a Path> {
    let mut by_bucket: HashMap<K, &'a Backup> = HashMap::new();
    for backup in backups {
        let key = key_fn(backup.timestamp);
        by_bucket
            .entry(key)
            .and_modify(|current| {
                if backup.timestamp > current.timestamp {
                    *current = backup;
                }
            })
            .or_insert(backup);
    }

    let mut buckets: Vec<(K, &'a Backup)> = by_bucket.into_iter().collect();
    buckets.sort_by_key(|b| std::cmp::Reverse(b.1.timestamp));
    buckets.into_iter().take(limit as usize).map(|(_, b)| b.path.as_path()).collect()
}

fn keep_set<'a>(backups: &[&'a Backup], policy: &RetentionPolicy, now: NaiveDateTime) -> HashSet<&'a Path> {
    match policy {
        RetentionPolicy::Days(days) => keep_by_days(backups, *days, now),
        RetentionPolicy::Count(count) => keep_by_count(backups, *count),
        RetentionPolicy::Mixed { daily, weekly, monthly } => {
            let mut keep = top_per_bucket(backups, bucket_key_day, *daily);
            keep.extend(top_per_bucket(backups, bucket_key_week, *weekly));
            keep.extend(top_per_bucket(backups, bucket_key_month, *monthly));
            keep
        }
    }
}

/// Applies `policies` (keyed by service name) to every archive under
/// `backup_dir`, never deleting a path referenced by an active lock.
/// Returns the number of files deleted.
pub fn apply_retention(
    backup_dir: &Path,
    policies: &HashMap<String, RetentionPolicy>,
    default_policy: &RetentionPolicy,
    lock_manager: &LockManager,
) -> Result<usize> {
    let backups = list_backups(backup_dir);
    let active_locks: HashSet<String> =
        lock_manager.active_locks()?.into_iter().map(|l| l.backup_name).collect();

    let now = chrono::DateTime::from_timestamp(
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs() as i64,
        0,
    )
    .map(|dt| dt.naive_utc())
    .unwrap_or_default();

    let mut by_service: HashMap<&str, Vec<&Backup>> = HashMap::new();
    for backup in &backups {
        by_service.entry(backup.service.as_str()).or_default().push(backup);
    }

    let mut deleted = 0usize;
    for (service, service_backups) in by_service {
        let policy = policies.get(service).unwrap_or(default_policy);
        let keep = keep_set(&service_backups, policy, now);

        for backup in service_backups {
            if keep.contains(backup.path.as_path()) {
                continue;
            }
            if active_locks.contains(&backup.backup_name) {
                continue;
            }
            if std::fs::remove_file(&backup.path).is_ok() {
                deleted += 1;
            }
        }
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn touch(dir: &Path, name: &str) {
        File::create(dir.join(name)).unwrap();
    }

    #[test]
    fn parses_well_formed_archive_names() {
        let path = Path::new("/backups/acme_20260115_093000.tar.gz");
        let backup = parse_archive_name(path).unwrap();
        assert_eq!(backup.service, "acme");
        assert_eq!(backup.backup_name, "acme_20260115_093000");
    }

    #[test]
    fn skips_malformed_names_without_error() {
        assert!(parse_archive_name(Path::new("/backups/not-an-archive.txt")).is_none());
        assert!(parse_archive_name(Path::new("/backups/acme.tar.gz")).is_none());
    }

    #[test]
    fn days_policy_keeps_only_recent_backups() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "bar_20200101_000000.tar.gz");
        touch(dir.path(), "bar_20990101_000000.tar.gz");

        let lock_manager = LockManager::new(dir.path());
        let mut policies = HashMap::new();
        policies.insert("bar".to_string(), RetentionPolicy::Days(7));

        let deleted = apply_retention(dir.path(), &policies, &RetentionPolicy::Days(7), &lock_manager).unwrap();
        assert_eq!(deleted, 1);
        assert!(!dir.path().join("bar_20200101_000000.tar.gz").exists());
        assert!(dir.path().join("bar_20990101_000000.tar.gz").exists());
    }

    #[test]
    fn never_deletes_a_path_referenced_by_an_active_lock() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "bar_20200101_000000.tar.gz");

        let lock_manager = LockManager::new(dir.path());
        let guard = lock_manager.acquire("bar", "bar_20200101_000000").unwrap();
        assert!(guard.is_some());

        let mut policies = HashMap::new();
        policies.insert("bar".to_string(), RetentionPolicy::Days(1));
        let deleted = apply_retention(dir.path(), &policies, &RetentionPolicy::Days(1), &lock_manager).unwrap();
        assert_eq!(deleted, 0);
        assert!(dir.path().join("bar_20200101_000000.tar.gz").exists());
    }
}
