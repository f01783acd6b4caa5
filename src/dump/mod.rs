//! Database Dumper (C5, spec §4.5): per-flavor dump protocols, each
//! running inside the target container via the Runtime Adapter and
//! capturing the result to a gzip-compressed file on the host.

pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod redis;
pub mod sqlite;

use crate::config::{Credentials, DatabaseType};
use crate::errors::OrchestratorError;
use crate::runtime::ContainerRuntime;
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Characters that must never appear in a value interpolated into a shell
/// command we build for `exec` (spec §4.5).
const INJECTION_BLACKLIST: &[char] = &[';', '&', '|', '`', '$', '>', '<'];

/// Rejects a credential value that contains shell metacharacters before it
/// is ever used to build a command -- the affected dump must never launch
/// (spec §7 `InvalidCredentialInput`).
pub fn validate_no_injection(value: &str) -> Result<()> {
    if value.chars().any(|c| INJECTION_BLACKLIST.contains(&c)) {
        return Err(OrchestratorError::InvalidCredentialInput(format!("value contains disallowed characters: {value:?}")).into());
    }
    Ok(())
}

pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(OrchestratorError::InvalidCredentialInput("port must be in [1,65535]".to_string()).into());
    }
    Ok(())
}

/// Detects a flavor from an image reference by substring, in the fixed
/// priority order of spec §4.5.
pub fn detect_flavor(image_reference: &str) -> Option<DatabaseType> {
    let image = image_reference.to_lowercase();
    if image.contains("postgres") || image.contains("pgvecto") {
        Some(DatabaseType::Postgres)
    } else if image.contains("mariadb") {
        Some(DatabaseType::Mariadb)
    } else if image.contains("mysql") {
        Some(DatabaseType::Mysql)
    } else if image.contains("mongo") {
        Some(DatabaseType::Mongodb)
    } else if image.contains("redis") {
        Some(DatabaseType::Redis)
    } else if image.contains("sqlite") {
        Some(DatabaseType::Sqlite)
    } else {
        None
    }
}

/// Compresses `bytes` and atomically publishes them at `out_path`
/// (`<out>.tmp` then rename, spec §4.5).
pub(crate) fn write_gzip_atomic(bytes: &[u8], out_path: &Path) -> Result<()> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database dump output directory")?;
    }
    let tmp_path = tmp_path_for(out_path);

    let result = (|| -> Result<()> {
        let file = std::fs::File::create(&tmp_path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(bytes)?;
        encoder.finish()?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            std::fs::rename(&tmp_path, out_path).context("failed to publish database dump")?;
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

/// Publishes already-compressed bytes (e.g. an in-container `tar czf`
/// result streamed back raw) atomically at `out_path`.
pub(crate) fn write_atomic(bytes: &[u8], out_path: &Path) -> Result<()> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database dump output directory")?;
    }
    let tmp_path = tmp_path_for(out_path);
    let result = std::fs::write(&tmp_path, bytes);
    match result {
        Ok(()) => {
            std::fs::rename(&tmp_path, out_path).context("failed to publish database dump")?;
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(e).context("failed to write database dump")
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Builds a per-pipeline-unique in-container scratch path for dump
/// protocols that stage an intermediate file before streaming it back
/// (spec §9 arena pattern) -- avoids collisions between concurrent or
/// retried backups of the same container.
pub(crate) fn arena_path(backup_name: &str, label: &str) -> String {
    format!("/tmp/.orchestrator_{label}_{backup_name}")
}

/// Removes an arena path inside the container, best-effort. Run on both the
/// success and failure paths of a dump so staged artifacts never linger.
pub(crate) fn cleanup_arena(runtime: &dyn ContainerRuntime, container_id: &str, path: &str) {
    if let Err(e) = runtime.exec(container_id, &["rm", "-rf", path], &std::collections::HashMap::new(), Duration::from_secs(30)) {
        tracing::warn!("failed to clean up {path} on {container_id}: {e}");
    }
}

/// Runs the dump protocol for `flavor` against `container_id`, writing the
/// result to `out_path`. Returns `Ok(false)` (no error) when required
/// credentials are missing -- the dump never launches and the artifact is
/// simply absent (spec boundary). Returns `Err` only for an actual command
/// or I/O failure.
pub fn dump_database(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    flavor: DatabaseType,
    credentials: &Credentials,
    out_path: &Path,
    timeout: Duration,
    backup_name: &str,
) -> Result<bool> {
    match flavor {
        DatabaseType::Postgres => postgres::dump(runtime, container_id, credentials, out_path, timeout),
        DatabaseType::Mysql | DatabaseType::Mariadb => mysql::dump(runtime, container_id, credentials, out_path, timeout),
        DatabaseType::Mongodb => mongodb::dump(runtime, container_id, credentials, out_path, timeout, backup_name),
        DatabaseType::Redis => redis::dump(runtime, container_id, credentials, out_path, timeout, backup_name),
        DatabaseType::Sqlite => sqlite::dump(runtime, container_id, out_path, timeout, backup_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_flavor_in_priority_order() {
        assert_eq!(detect_flavor("postgres:16"), Some(DatabaseType::Postgres));
        assert_eq!(detect_flavor("pgvecto-rs:latest"), Some(DatabaseType::Postgres));
        assert_eq!(detect_flavor("mariadb:10"), Some(DatabaseType::Mariadb));
        assert_eq!(detect_flavor("mysql:8"), Some(DatabaseType::Mysql));
        assert_eq!(detect_flavor("mongo:6"), Some(DatabaseType::Mongodb));
        assert_eq!(detect_flavor("redis:7"), Some(DatabaseType::Redis));
        assert_eq!(detect_flavor("nginx:latest"), None);
    }

    #[test]
    fn rejects_injection_characters() {
        assert!(validate_no_injection("plainvalue").is_ok());
        assert!(validate_no_injection("evil; rm -rf /").is_err());
        assert!(validate_no_injection("$(whoami)").is_err());
        assert!(validate_no_injection("a`b`").is_err());
    }

    #[test]
    fn rejects_zero_port() {
        assert!(validate_port(5432).is_ok());
        assert!(validate_port(0).is_err());
    }
}
