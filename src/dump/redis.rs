//! Redis dump protocol (spec §4.5): prefer an existing `/data/dump.rdb`
//! snapshot, else trigger one with `redis-cli --rdb`; password via
//! `REDISCLI_AUTH`. The RDB file is tarred in-container and streamed back.

use super::{arena_path, cleanup_arena, validate_no_injection, validate_port, write_atomic};
use crate::config::Credentials;
use crate::runtime::ContainerRuntime;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const RDB_PATH: &str = "/data/dump.rdb";

pub fn dump(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    credentials: &Credentials,
    out_path: &Path,
    timeout: Duration,
    backup_name: &str,
) -> Result<bool> {
    if let Some(host) = &credentials.host {
        validate_no_injection(host)?;
    }
    if let Some(port) = credentials.port {
        validate_port(port)?;
    }

    let generated_rdb_path = arena_path(backup_name, "redis_rdb");
    let archive_path = arena_path(backup_name, "redis_archive");
    let result = dump_inner(runtime, container_id, credentials, out_path, timeout, &generated_rdb_path, &archive_path);

    cleanup_arena(runtime, container_id, &generated_rdb_path);
    cleanup_arena(runtime, container_id, &archive_path);
    result
}

fn dump_inner(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    credentials: &Credentials,
    out_path: &Path,
    timeout: Duration,
    generated_rdb_path: &str,
    archive_path: &str,
) -> Result<bool> {
    let existing = runtime
        .exec(container_id, &["test", "-f", RDB_PATH], &HashMap::new(), timeout)
        .context("checking for existing dump.rdb failed")?;

    let rdb_path = if existing.exit_code == 0 {
        RDB_PATH.to_string()
    } else {
        let mut command = format!("redis-cli --rdb {generated_rdb_path}");
        if let Some(host) = &credentials.host {
            command.push_str(&format!(" -h {host}"));
        }
        if let Some(port) = credentials.port {
            command.push_str(&format!(" -p {port}"));
        }

        let mut env = HashMap::new();
        if let Some(password) = &credentials.password {
            env.insert("REDISCLI_AUTH".to_string(), password.clone());
        }

        let result = runtime
            .exec(container_id, &["sh", "-c", command.as_str()], &env, timeout)
            .context("redis-cli --rdb exec failed")?;
        if result.exit_code != 0 {
            anyhow::bail!("CommandFailed: redis-cli exited {} for {container_id}", result.exit_code);
        }
        generated_rdb_path.to_string()
    };

    let tar_cmd = [
        "tar",
        "czf",
        archive_path,
        "-C",
        rdb_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("/"),
        rdb_path.rsplit_once('/').map(|(_, file)| file).unwrap_or(rdb_path.as_str()),
    ];
    let tar_result = runtime
        .exec(container_id, &tar_cmd, &HashMap::new(), timeout)
        .context("tar of redis rdb file failed")?;
    if tar_result.exit_code != 0 {
        anyhow::bail!("CommandFailed: tar exited {} for {container_id}", tar_result.exit_code);
    }

    let bytes = runtime
        .stream_archive(container_id, archive_path)
        .context("failed to stream redis rdb archive back")?;
    write_atomic(&bytes, out_path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;

    #[test]
    fn uses_existing_rdb_snapshot_when_present() {
        let runtime = MockRuntime::new()
            .with_exec_response(
                "cache_db:test",
                crate::runtime::mock::ExecResponse { exit_code: 0, output: Vec::new() },
            )
            .with_archive("cache_db", b"rdb-tar-bytes".to_vec());
        let creds = Credentials::default();
        let out = tempfile::tempdir().unwrap().path().join("cache_db.tar.gz");
        let produced = dump(&runtime, "cache_db", &creds, &out, Duration::from_secs(10), "acme_20260115").unwrap();
        assert!(produced);
        assert_eq!(std::fs::read(&out).unwrap(), b"rdb-tar-bytes");
    }

    #[test]
    fn triggers_new_snapshot_when_no_existing_rdb() {
        let runtime = MockRuntime::new()
            .with_exec_response(
                "cache_db:test",
                crate::runtime::mock::ExecResponse { exit_code: 1, output: Vec::new() },
            )
            .with_archive("cache_db", b"fresh-tar-bytes".to_vec());
        let creds = Credentials { password: Some("hunter2".to_string()), ..Default::default() };
        let out = tempfile::tempdir().unwrap().path().join("cache_db.tar.gz");
        let produced = dump(&runtime, "cache_db", &creds, &out, Duration::from_secs(10), "acme_20260115").unwrap();
        assert!(produced);
    }

    #[test]
    fn cleans_up_arena_paths_on_success() {
        let runtime = MockRuntime::new()
            .with_exec_response(
                "cache_db:test",
                crate::runtime::mock::ExecResponse { exit_code: 0, output: Vec::new() },
            )
            .with_archive("cache_db", b"rdb-tar-bytes".to_vec());
        let creds = Credentials::default();
        let out = tempfile::tempdir().unwrap().path().join("cache_db.tar.gz");
        dump(&runtime, "cache_db", &creds, &out, Duration::from_secs(10), "acme_20260115").unwrap();

        let rm_calls: Vec<_> = runtime
            .calls()
            .into_iter()
            .filter(|call| matches!(call, crate::runtime::mock::RuntimeCall::Exec { cmd, .. } if cmd.first().map(String::as_str) == Some("rm")))
            .collect();
        assert_eq!(rm_calls.len(), 2);
    }
}
