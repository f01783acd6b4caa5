//! MySQL/MariaDB dump protocol (spec §4.5): `mysqldump -u <user>
//! [-h <host>] [-P <port>] (<db>|--all-databases) --single-transaction
//! --quick --lock-tables=false`, password via `MYSQL_PWD`.

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
    let user = credentials.user.clone().unwrap_or_else(|| "root".to_string());
    validate_no_injection(&user)?;
    if let Some(host) = &credentials.host {
        validate_no_injection(host)?;
    }
    if let Some(database) = &credentials.database {
        validate_no_injection(database)?;
    }
    if let Some(port) = credentials.port {
        validate_port(port)?;
    }

    let mut args: Vec<String> = vec!["mysqldump".to_string(), "-u".to_string(), user];
    if let Some(host) = &credentials.host {
        args.push("-h".to_string());
        args.push(host.clone());
    }
    if let Some(port) = credentials.port {
        args.push("-P".to_string());
        args.push(port.to_string());
    }
    match &credentials.database {
        Some(database) => args.push(database.clone()),
        None => args.push("--all-databases".to_string()),
    }
    args.push("--single-transaction".to_string());
    args.push("--quick".to_string());
    args.push("--lock-tables=false".to_string());

    let mut env = HashMap::new();
    if let Some(password) = &credentials.password {
        env.insert("MYSQL_PWD".to_string(), password.clone());
    }

    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    let result = runtime.exec(container_id, &arg_refs, &env, timeout).context("mysqldump exec failed")?;

    if result.exit_code != 0 {
        anyhow::bail!(
            "CommandFailed: mysqldump exited {} for {container_id}",
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
    fn defaults_to_root_user_and_dumps_all_databases_without_named_db() {
        let runtime = MockRuntime::new().with_exec_response(
            "shop_db:mysqldump",
            ExecResponse { exit_code: 0, output: b"-- MySQL dump".to_vec() },
        );
        let creds = Credentials::default();
        let out = tempfile::tempdir().unwrap().path().join("shop_db.sql.gz");
        let produced = dump(&runtime, "shop_db", &creds, &out, Duration::from_secs(10)).unwrap();
        assert!(produced);
        assert!(out.exists());
        let calls = runtime.calls();
        match &calls[0] {
            crate::runtime::mock::RuntimeCall::Exec { cmd, .. } => {
                assert!(cmd.contains(&"--all-databases".to_string()));
                assert!(cmd.contains(&"root".to_string()));
            }
            other => panic!("expected Exec call, got {other:?}"),
        }
    }

    #[test]
    fn scopes_to_named_database_when_present() {
        let runtime = MockRuntime::new().with_exec_response(
            "shop_db:mysqldump",
            ExecResponse { exit_code: 0, output: b"-- MySQL dump".to_vec() },
        );
        let creds = Credentials { database: Some("shop".to_string()), ..Default::default() };
        let out = tempfile::tempdir().unwrap().path().join("shop_db.sql.gz");
        dump(&runtime, "shop_db", &creds, &out, Duration::from_secs(10)).unwrap();
        let calls = runtime.calls();
        match &calls[0] {
            crate::runtime::mock::RuntimeCall::Exec { cmd, .. } => {
                assert!(cmd.contains(&"shop".to_string()));
                assert!(!cmd.contains(&"--all-databases".to_string()));
            }
            other => panic!("expected Exec call, got {other:?}"),
        }
    }

    #[test]
    fn rejects_injection_suspect_user() {
        let runtime = MockRuntime::new();
        let creds = Credentials { user: Some("root`whoami`".to_string()), ..Default::default() };
        let out = tempfile::tempdir().unwrap().path().join("db.sql.gz");
        assert!(dump(&runtime, "shop_db", &creds, &out, Duration::from_secs(10)).is_err());
    }
}
