//! Postgres dump protocol (spec §4.5): `pg_dump -U <user> [-h <host>]
//! [-p <port>] <db>`, password passed via `PGPASSWORD`, never on the
//! command line.

use super::{validate_no_injection, validate_port, write_gzip_atomic};
use crate::config::Credentials;
use crate::runtime::ContainerRuntime;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub fn dump(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    credentials: &Credentials,
    out_path: &Path,
    timeout: Duration,
) -> Result<bool> {
    let (Some(user), Some(database)) = (&credentials.user, &credentials.database) else {
        tracing::warn!("postgres dump for {container_id} skipped: missing user or database");
        return Ok(false);
    };

    validate_no_injection(user)?;
    validate_no_injection(database)?;
    if let Some(host) = &credentials.host {
        validate_no_injection(host)?;
    }
    if let Some(port) = credentials.port {
        validate_port(port)?;
    }

    let mut args: Vec<String> = vec!["pg_dump".to_string(), "-U".to_string(), user.clone()];
    if let Some(host) = &credentials.host {
        args.push("-h".to_string());
        args.push(host.clone());
    }
    if let Some(port) = credentials.port {
        args.push("-p".to_string());
        args.push(port.to_string());
    }
    args.push(database.clone());

    let mut env = HashMap::new();
    if let Some(password) = &credentials.password {
        env.insert("PGPASSWORD".to_string(), password.clone());
    }

    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    let result = runtime.exec(container_id, &arg_refs, &env, timeout).context("pg_dump exec failed")?;

    if result.exit_code != 0 {
        anyhow::bail!(
            "CommandFailed: pg_dump exited {} for {container_id}",
            result.exit_code
        );
    }

    write_gzip_atomic(&result.output, out_path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::{ExecResponse, MockRuntime};

    #[test]
    fn skips_without_launching_when_missing_user_or_database() {
        let runtime = MockRuntime::new();
        let creds = Credentials { database: Some("app".to_string()), ..Default::default() };
        let out = tempfile::tempdir().unwrap().path().join("db.sql.gz");
        let produced = dump(&runtime, "acme_db", &creds, &out, Duration::from_secs(10)).unwrap();
        assert!(!produced);
        assert!(!out.exists());
        assert!(runtime.calls().is_empty());
    }

    #[test]
    fn dumps_successfully_and_writes_gzip_output() {
        let runtime = MockRuntime::new().with_exec_response(
            "acme_db:pg_dump",
            ExecResponse { exit_code: 0, output: b"-- PostgreSQL database dump".to_vec() },
        );
        let creds = Credentials {
            user: Some("app".to_string()),
            password: Some("s3cret".to_string()),
            database: Some("app".to_string()),
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("acme_db.sql.gz");
        let produced = dump(&runtime, "acme_db", &creds, &out, Duration::from_secs(10)).unwrap();
        assert!(produced);
        assert!(out.exists());
    }

    #[test]
    fn rejects_injection_suspect_credential_before_launching() {
        let runtime = MockRuntime::new();
        let creds = Credentials {
            user: Some("app; rm -rf /".to_string()),
            database: Some("app".to_string()),
            ..Default::default()
        };
        let out = tempfile::tempdir().unwrap().path().join("db.sql.gz");
        let result = dump(&runtime, "acme_db", &creds, &out, Duration::from_secs(10));
        assert!(result.is_err());
        assert!(runtime.calls().is_empty());
    }
}
