//! CLI integration tests (spec §6): exercises the binary end-to-end for
//! the subcommands that don't require a live Docker daemon.

use assert_cmd::Command;
use predicates::prelude::*;

fn cmd(backup_dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("backup-orchestrator").unwrap();
    cmd.env("BACKUP_DIR", backup_dir)
        .env("LOG_LEVEL", "error")
        .env_remove("PORTAINER_URL")
        .env_remove("PORTAINER_API_KEY");
    cmd
}

#[test]
fn help_lists_all_subcommands() {
    let dir = tempfile::tempdir().unwrap();
    cmd(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("backup"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("retention"))
        .stdout(predicate::str::contains("schedule"));
}

#[test]
fn status_on_empty_backup_dir_reports_no_archives() {
    let dir = tempfile::tempdir().unwrap();
    cmd(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("active locks: 0"));
}

#[test]
fn status_json_output_is_well_formed() {
    let dir = tempfile::tempdir().unwrap();
    let output = cmd(dir.path()).args(["status", "--output", "json"]).output().unwrap();
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).expect("status --output json must emit valid JSON");
    assert_eq!(parsed["active_locks"], 0);
}

#[test]
fn retention_on_empty_backup_dir_removes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    cmd(dir.path())
        .arg("retention")
        .assert()
        .success()
        .stdout(predicate::str::contains("retention removed 0 archive(s)"));
}

#[test]
fn schedule_rejects_malformed_interval() {
    let dir = tempfile::tempdir().unwrap();
    cmd(dir.path())
        .args(["schedule", "--interval", "24hours"])
        .assert()
        .failure();
}

#[test]
fn missing_subcommand_exits_1_and_prints_usage() {
    let dir = tempfile::tempdir().unwrap();
    cmd(dir.path())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn unknown_subcommand_exits_1_and_prints_usage() {
    let dir = tempfile::tempdir().unwrap();
    cmd(dir.path())
        .arg("bogus-command")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Usage"));
}
