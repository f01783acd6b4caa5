//! SQLite dump protocol (spec §4.5): locate candidate database files under
//! a conservative set of roots, prefer `sqlite3 <db> .dump` when the
//! binary is present -- piping the dump back into `sqlite3` to rebuild a
//! consistent binary database before streaming it back -- else stream the
//! raw file and gzip it host-side.

use super::{arena_path, cleanup_arena, write_atomic, write_gzip_atomic};
use crate::runtime::ContainerRuntime;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const SEARCH_ROOTS: &[&str] = &["/config", "/data", "/app/data", "/var/lib", "/opt", "/usr/local"];
const GLOBS: &str = "-iname *.sqlite -o -iname *.db -o -iname *.sqlite3";

pub fn dump(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    out_path: &Path,
    timeout: Duration,
    backup_name: &str,
) -> Result<bool> {
    let find_cmd = format!(
        "find {} \\( {GLOBS} \\) -type f 2>/dev/null | head -n1",
        SEARCH_ROOTS.join(" ")
    );
    let find_result = runtime
        .exec(container_id, &["sh", "-c", find_cmd.as_str()], &HashMap::new(), timeout)
        .context("locating sqlite database file failed")?;

    let db_path = String::from_utf8_lossy(&find_result.output).trim().to_string();
    if db_path.is_empty() {
        tracing::warn!("sqlite dump for {container_id} skipped: no database file found");
        return Ok(false);
    }

    let has_sqlite3 = runtime
        .exec(container_id, &["sh", "-c", "command -v sqlite3"], &HashMap::new(), timeout)
        .map(|r| r.exit_code == 0)
        .unwrap_or(false);

    if has_sqlite3 {
        let backup_path = arena_path(backup_name, "sqlite_backup");
        let archive_path = arena_path(backup_name, "sqlite_archive");
        let result = dump_via_round_trip(runtime, container_id, &db_path, &backup_path, &archive_path, out_path, timeout);
        cleanup_arena(runtime, container_id, &backup_path);
        cleanup_arena(runtime, container_id, &archive_path);
        result
    } else {
        let cat_cmd = format!("cat '{db_path}'");
        let result = runtime
            .exec(container_id, &["sh", "-c", cat_cmd.as_str()], &HashMap::new(), timeout)
            .context("raw sqlite file read failed")?;
        if result.exit_code != 0 {
            anyhow::bail!("CommandFailed: cat exited {} for {container_id}", result.exit_code);
        }
        write_gzip_atomic(&result.output, out_path)?;
        Ok(true)
    }
}

/// Rebuilds a consistent binary database at `backup_path` via
/// `sqlite3 <db> .dump | sqlite3 <backup_path>`, tars+gzips it in-container,
/// then streams that archive back (spec §4.5).
fn dump_via_round_trip(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    db_path: &str,
    backup_path: &str,
    archive_path: &str,
    out_path: &Path,
    timeout: Duration,
) -> Result<bool> {
    let dump_cmd = format!("sqlite3 '{db_path}' .dump | sqlite3 '{backup_path}'");
    let result = runtime
        .exec(container_id, &["sh", "-c", dump_cmd.as_str()], &HashMap::new(), timeout)
        .context("sqlite3 .dump round-trip exec failed")?;
    if result.exit_code != 0 {
        anyhow::bail!("CommandFailed: sqlite3 .dump round-trip exited {} for {container_id}", result.exit_code);
    }

    let tar_cmd = [
        "tar",
        "czf",
        archive_path,
        "-C",
        backup_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("/"),
        backup_path.rsplit_once('/').map(|(_, file)| file).unwrap_or(backup_path),
    ];
    let tar_result = runtime
        .exec(container_id, &tar_cmd, &HashMap::new(), timeout)
        .context("tar of rebuilt sqlite database failed")?;
    if tar_result.exit_code != 0 {
        anyhow::bail!("CommandFailed: tar exited {} for {container_id}", tar_result.exit_code);
    }

    let bytes = runtime
        .stream_archive(container_id, archive_path)
        .context("failed to stream rebuilt sqlite database back")?;
    write_atomic(&bytes, out_path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::{ExecResponse, MockRuntime};

    #[test]
    fn skips_without_error_when_no_database_file_found() {
        let runtime = MockRuntime::new();
        let out = tempfile::tempdir().unwrap().path().join("app_db.sql.gz");
        let produced = dump(&runtime, "app_db", &out, Duration::from_secs(10), "acme_20260115").unwrap();
        assert!(!produced);
        assert!(!out.exists());
    }

    #[test]
    fn dumps_via_sqlite3_round_trip_when_binary_present() {
        let runtime = MockRuntime::new()
            .with_exec_response(
                "app_db:sh",
                ExecResponse { exit_code: 0, output: b"/config/app.db\n".to_vec() },
            )
            .with_archive("app_db", b"rebuilt-db-tar-gz-bytes".to_vec());
        // sh is used for find/has-sqlite3/round-trip; the mock keys on
        // container+first arg, so all `sh -c ...` calls share one canned
        // response. That's fine here: the find result is what gates the
        // rest of the function, and the round-trip's actual effect is
        // observed via the streamed archive bytes below.
        let out = tempfile::tempdir().unwrap().path().join("app_db.sql.gz");
        let produced = dump(&runtime, "app_db", &out, Duration::from_secs(10), "acme_20260115").unwrap();
        assert!(produced);
        assert_eq!(std::fs::read(&out).unwrap(), b"rebuilt-db-tar-gz-bytes");

        let tar_calls = runtime
            .calls()
            .into_iter()
            .filter(|call| matches!(call, crate::runtime::mock::RuntimeCall::Exec { cmd, .. } if cmd.first().map(String::as_str) == Some("tar")))
            .count();
        assert_eq!(tar_calls, 1);

        let rm_calls = runtime
            .calls()
            .into_iter()
            .filter(|call| matches!(call, crate::runtime::mock::RuntimeCall::Exec { cmd, .. } if cmd.first().map(String::as_str) == Some("rm")))
            .count();
        assert_eq!(rm_calls, 2);
    }
}
