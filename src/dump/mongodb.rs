//! MongoDB dump protocol (spec §4.5): `mongodump --out=<tmp>` inside the
//! container, tarred in place, then streamed back over the Runtime
//! Adapter and published raw (already compressed).

use super::write_atomic;
use crate::config::Credentials;
use crate::runtime::ContainerRuntime;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use super::{arena_path, cleanup_arena, validate_no_injection, validate_port};

pub fn dump(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    credentials: &Credentials,
    out_path: &Path,
    timeout: Duration,
    backup_name: &str,
) -> Result<bool> {
    let dump_dir = arena_path(backup_name, "mongodump");
    let archive_path = arena_path(backup_name, "mongodump_archive");
    let result = dump_inner(runtime, container_id, credentials, out_path, timeout, &dump_dir, &archive_path);

    cleanup_arena(runtime, container_id, &dump_dir);
    cleanup_arena(runtime, container_id, &archive_path);
    result
}

fn dump_inner(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    credentials: &Credentials,
    out_path: &Path,
    timeout: Duration,
    dump_dir: &str,
    archive_path: &str,
) -> Result<bool> {
    if let Some(user) = &credentials.user {
        validate_no_injection(user)?;
    }
    if let Some(host) = &credentials.host {
        validate_no_injection(host)?;
    }
    if let Some(database) = &credentials.database {
        validate_no_injection(database)?;
    }
    if let Some(port) = credentials.port {
        validate_port(port)?;
    }

    let mut command = format!("mongodump --out={dump_dir}");
    if let Some(user) = &credentials.user {
        command.push_str(&format!(" --username={user}"));
        if let Some(database) = &credentials.database {
            command.push_str(&format!(" --authenticationDatabase={database}"));
        }
    }
    if let Some(host) = &credentials.host {
        command.push_str(&format!(" --host={host}"));
    }
    if let Some(port) = credentials.port {
        command.push_str(&format!(" --port={port}"));
    }
    if let Some(database) = &credentials.database {
        command.push_str(&format!(" --db={database}"));
    }

    let mut env = HashMap::new();
    if credentials.password.is_some() {
        // The password never appears in argv: mongodump has no dedicated
        // password env var, so it's referenced from the shell instead.
        command.push_str(" --password=\"$MONGO_PASSWORD\"");
        env.insert("MONGO_PASSWORD".to_string(), credentials.password.clone().unwrap());
    }

    let exec_cmd = ["sh", "-c", command.as_str()];
    let result = runtime.exec(container_id, &exec_cmd, &env, timeout).context("mongodump exec failed")?;
    if result.exit_code != 0 {
        anyhow::bail!("CommandFailed: mongodump exited {} for {container_id}", result.exit_code);
    }

    let tar_cmd = ["tar", "czf", archive_path, "-C", dump_dir, "."];
    let tar_result = runtime
        .exec(container_id, &tar_cmd, &HashMap::new(), timeout)
        .context("tar of mongodump output failed")?;
    if tar_result.exit_code != 0 {
        anyhow::bail!("CommandFailed: tar exited {} for {container_id}", tar_result.exit_code);
    }

    let bytes = runtime
        .stream_archive(container_id, archive_path)
        .context("failed to stream mongodump archive back")?;
    write_atomic(&bytes, out_path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;

    #[test]
    fn dumps_and_streams_archive_back() {
        let runtime = MockRuntime::new().with_archive("app_db", b"fake-tar-gz-bytes".to_vec());
        let creds = Credentials {
            user: Some("admin".to_string()),
            password: Some("s3cret".to_string()),
            database: Some("app".to_string()),
            ..Default::default()
        };
        let out = tempfile::tempdir().unwrap().path().join("app_db.tar.gz");
        let produced = dump(&runtime, "app_db", &creds, &out, Duration::from_secs(10), "acme_20260115").unwrap();
        assert!(produced);
        assert_eq!(std::fs::read(&out).unwrap(), b"fake-tar-gz-bytes");
    }

    #[test]
    fn rejects_injection_suspect_database_name() {
        let runtime = MockRuntime::new();
        let creds = Credentials { database: Some("app; rm -rf /".to_string()), ..Default::default() };
        let out = tempfile::tempdir().unwrap().path().join("app_db.tar.gz");
        assert!(dump(&runtime, "app_db", &creds, &out, Duration::from_secs(10), "acme_20260115").is_err());
    }
}
