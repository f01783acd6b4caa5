//! Service Backup Engine (C7, spec §4.7): the per-service state machine --
//! classify, quiesce, dump databases, dump files, assemble, restore.

use crate::archive;
use crate::config::{Credentials, DatabaseType, OrchestratorConfig, ServiceConfig};
use crate::credentials::extract_credentials;
use crate::discovery::Service;
use crate::dump;
use crate::files;
use crate::runtime::{Container, ContainerRuntime, STOP_GRACE};
use anyhow::Result;
use chrono::Local;
use glob::Pattern;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Classify,
    Quiesce,
    DumpDatabases,
    DumpFiles,
    Assemble,
    Restore,
    Done,
    Failed,
}

pub struct PipelineResult {
    pub service_name: String,
    pub state: PipelineState,
    pub archive_path: Option<PathBuf>,
    pub errors: Vec<String>,
}

impl PipelineResult {
    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Done
    }
}

/// Runs the full state machine for one service. `stack_env` is the
/// already-resolved env for this service's stack, if any (C2/C8 output);
/// `backup_name` is the archive's base name, reserved by the caller before
/// the pipeline starts (lock/timestamp ownership lives in the manager).
pub fn run_pipeline(
    runtime: &dyn ContainerRuntime,
    service: &Service,
    config: &ServiceConfig,
    orchestrator_config: &OrchestratorConfig,
    stack_env: Option<&HashMap<String, String>>,
    backup_name: &str,
    scratch_dir: &std::path::Path,
) -> PipelineResult {
    let mut errors = Vec::new();

    // CLASSIFY
    let (db_containers, app_containers) = classify(&service.containers, config);

    let requires_stopping = config.database.requires_stopping || config.files.requires_stopping;
    let mut stopped: Vec<String> = Vec::new();

    // QUIESCE
    if requires_stopping {
        stopped = quiesce(runtime, &service.containers, orchestrator_config);
    }

    // DUMP_DBS
    let mut db_artifact_count = 0usize;
    let databases_dir = scratch_dir.join("databases");
    if let Err(e) = std::fs::create_dir_all(&databases_dir) {
        errors.push(format!("failed to create databases scratch dir: {e}"));
    }
    for container in &db_containers {
        match dump_one_database(runtime, container, config, stack_env, &service.name, &databases_dir, orchestrator_config, backup_name) {
            Ok(true) => db_artifact_count += 1,
            Ok(false) => {}
            Err(e) => errors.push(format!("database dump for {} failed: {e}", container.name)),
        }
    }
    let db_step_ok = db_containers.is_empty() || db_artifact_count > 0;

    // DUMP_FILES
    for container in &app_containers {
        if let Err(e) = dump_one_file_set(runtime, container, config, scratch_dir, &orchestrator_config.exclude_mount_paths) {
            errors.push(format!("file dump for {} failed: {e}", container.name));
        }
    }

    // ASSEMBLE
    let mut archive_path = None;
    let mut assemble_ok = true;
    if let Err(e) = write_metadata(scratch_dir, service, config, backup_name) {
        errors.push(format!("failed to write metadata.json: {e}"));
    }
    let out_path = orchestrator_config.backup_dir.join(format!("{backup_name}.tar.gz"));
    match archive::create_archive(scratch_dir, &out_path, &config.files.exclusions) {
        Ok(()) => archive_path = Some(out_path),
        Err(e) => {
            errors.push(format!("archive assembly failed: {e}"));
            assemble_ok = false;
        }
    }

    // RESTORE (always runs; failures are logged, never regress the result, spec §4.7)
    let _ = restore(runtime, &stopped);

    let success = db_step_ok && assemble_ok;
    let state = if success { PipelineState::Done } else { PipelineState::Failed };

    PipelineResult { service_name: service.name.clone(), state, archive_path, errors }
}

fn classify<'a>(containers: &'a [Container], config: &ServiceConfig) -> (Vec<&'a Container>, Vec<&'a Container>) {
    let patterns: Vec<Pattern> = config.database.container_patterns.iter().filter_map(|p| Pattern::new(p).ok()).collect();
    let mut db = Vec::new();
    let mut app = Vec::new();
    for container in containers {
        let image_matches_family = dump::detect_flavor(&container.image_reference).is_some();
        let name_matches_pattern = patterns.iter().any(|p| p.matches(&container.name.to_lowercase()));
        if image_matches_family || name_matches_pattern {
            db.push(container);
        } else {
            app.push(container);
        }
    }
    (db, app)
}

/// Stops containers in reverse input order, skipping the process's own
/// container and anything that supports hot backup (spec §4.7 QUIESCE).
fn quiesce(runtime: &dyn ContainerRuntime, containers: &[Container], orchestrator_config: &OrchestratorConfig) -> Vec<String> {
    let mut stopped = Vec::new();
    for container in containers.iter().rev() {
        if is_self(container, orchestrator_config) {
            continue;
        }
        if container.has_hot_backup_label() || dump::detect_flavor(&container.image_reference).is_some() {
            continue;
        }
        match runtime.stop(&container.id, STOP_GRACE) {
            Ok(()) => stopped.push(container.id.clone()),
            Err(e) => tracing::warn!("failed to stop {}: {e}", container.name),
        }
    }
    stopped
}

/// True if `container` is this process's own container, per spec §4.7
/// QUIESCE's four signals: container-id-from-cgroup, hostname, env
/// `HOSTNAME`, or a configured `BACKUP_SERVICE_NAMES` match. Any one signal
/// firing is conclusive -- never back up or stop self.
fn is_self(container: &Container, orchestrator_config: &OrchestratorConfig) -> bool {
    if orchestrator_config.is_self(&container.name) {
        return true;
    }
    if let Some(own_id) = own_container_id_from_cgroup() {
        if ids_match(&own_id, &container.id) {
            return true;
        }
    }
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if hostname == container.id || hostname == container.name {
            return true;
        }
    }
    container.env_map().get("HOSTNAME").map(|h| h == &container.id).unwrap_or(false)
}

fn ids_match(a: &str, b: &str) -> bool {
    a == b || a.starts_with(b) || b.starts_with(a)
}

/// Reads this process's own container id out of its cgroup path, the way a
/// container learns its own id when `HOSTNAME` isn't set to it (spec §4.7).
/// Returns `None` outside a container (no `docker`/`.scope`-style cgroup
/// entry, or `/proc/self/cgroup` is absent on this platform).
fn own_container_id_from_cgroup() -> Option<String> {
    let contents = std::fs::read_to_string("/proc/self/cgroup").ok()?;
    contents.lines().find_map(container_id_from_cgroup_line)
}

fn container_id_from_cgroup_line(line: &str) -> Option<String> {
    let path = line.rsplit(':').next()?;
    path.split('/')
        .rev()
        .find_map(|segment| {
            let candidate = segment.strip_suffix(".scope").unwrap_or(segment);
            let candidate = candidate.rsplit_once('-').map(|(_, id)| id).unwrap_or(candidate);
            (candidate.len() >= 12 && candidate.len() <= 64 && candidate.chars().all(|c| c.is_ascii_hexdigit()))
                .then(|| candidate.to_string())
        })
}

#[allow(clippy::too_many_arguments)]
fn dump_one_database(
    runtime: &dyn ContainerRuntime,
    container: &Container,
    config: &ServiceConfig,
    stack_env: Option<&HashMap<String, String>>,
    stack_name: &str,
    databases_dir: &std::path::Path,
    orchestrator_config: &OrchestratorConfig,
    backup_name: &str,
) -> Result<bool> {
    let flavor = config.database.db_type.or_else(|| dump::detect_flavor(&container.image_reference));
    let Some(flavor) = flavor else { return Ok(false) };

    let credentials = resolve_credentials(container, config, stack_env, stack_name, flavor);
    let out_path = databases_dir.join(format!("{}.sql.gz", sanitize(&container.name)));
    dump::dump_database(runtime, &container.id, flavor, &credentials, &out_path, orchestrator_config.docker_exec_timeout, backup_name)
}

fn resolve_credentials(
    container: &Container,
    config: &ServiceConfig,
    stack_env: Option<&HashMap<String, String>>,
    stack_name: &str,
    flavor: DatabaseType,
) -> Credentials {
    if let Some(explicit) = &config.database.credentials {
        return explicit.clone();
    }
    let mut env = container.env_map();
    if let Some(stack_env) = stack_env {
        for (k, v) in stack_env {
            env.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    extract_credentials(&env, flavor, Some(stack_name))
}

fn dump_one_file_set(
    runtime: &dyn ContainerRuntime,
    container: &Container,
    config: &ServiceConfig,
    scratch_dir: &std::path::Path,
    host_exclusions: &[String],
) -> Result<()> {
    let paths = if config.files.data_paths.is_empty() {
        files::detect_paths(runtime, &container.id, &container.mounts, host_exclusions)
    } else {
        config.files.data_paths.clone()
    };
    if paths.is_empty() {
        return Ok(());
    }
    files::backup_paths(runtime, &container.id, &container.name, &paths, &config.files.exclusions, &container.mounts, scratch_dir)?;
    Ok(())
}

fn write_metadata(scratch_dir: &std::path::Path, service: &Service, config: &ServiceConfig, backup_name: &str) -> Result<()> {
    let metadata = serde_json::json!({
        "service": service.name,
        "backup_name": backup_name,
        "timestamp": Local::now().to_rfc3339(),
        "containers": service.containers.iter().map(|c| serde_json::json!({
            "id": c.id,
            "name": c.name,
            "image": c.image_reference,
        })).collect::<Vec<_>>(),
        "config": crate::credentials::mask_sensitive_data(&serde_json::to_value(config)?),
    });
    std::fs::write(scratch_dir.join("metadata.json"), serde_json::to_vec_pretty(&metadata)?)?;
    Ok(())
}

/// Restarts every remembered-stopped container in input order, waiting up
/// to 60s for `running` with one retry on failure (spec §4.7 RESTORE).
/// Always runs; unrecoverable failures are logged, never returned as the
/// pipeline's error (spec §4.7, §7). `stopped` was built by `quiesce`
/// iterating containers in reverse input order, so it is un-reversed here
/// to restart in the original input order.
fn restore(runtime: &dyn ContainerRuntime, stopped: &[String]) -> bool {
    let mut all_ok = true;
    for container_id in stopped.iter().rev() {
        if let Err(e) = start_and_wait(runtime, container_id) {
            tracing::error!("failed to restore container {container_id}: {e}");
            if let Err(e) = start_and_wait(runtime, container_id) {
                tracing::error!("retry also failed to restore container {container_id}: {e}");
                all_ok = false;
            }
        }
    }
    all_ok
}

fn start_and_wait(runtime: &dyn ContainerRuntime, container_id: &str) -> Result<()> {
    runtime.start(container_id)?;
    let deadline = std::time::Instant::now() + crate::runtime::START_WAIT;
    while std::time::Instant::now() < deadline {
        if runtime.is_running_and_healthy(container_id)? {
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
    anyhow::bail!("container {container_id} did not reach running state within the wait window")
}

fn sanitize(name: &str) -> String {
    name.trim_start_matches('/').replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, FilesConfig, GlobalServiceConfig};
    use crate::runtime::mock::{ExecResponse, MockRuntime, RuntimeCall};
    use crate::runtime::ContainerStatus;

    fn container(id: &str, image: &str) -> Container {
        Container {
            id: id.to_string(),
            name: id.to_string(),
            image_reference: image.to_string(),
            status: ContainerStatus::Running,
            labels: HashMap::new(),
            env: vec!["POSTGRES_USER=app".to_string(), "POSTGRES_PASSWORD=s3cret".to_string(), "POSTGRES_DB=app".to_string()],
            mounts: vec![],
        }
    }

    #[test]
    fn hot_postgres_backup_succeeds_without_stopping_containers() {
        let web = container("acme_web", "nginx:latest");
        let db = container("acme_db", "postgres:16");
        let runtime = MockRuntime::new()
            .with_containers(vec![web.clone(), db.clone()])
            .with_exec_response("acme_db:pg_dump", ExecResponse { exit_code: 0, output: b"-- PostgreSQL database dump".to_vec() });

        let service = Service { name: "acme".to_string(), containers: vec![web, db] };
        let config = ServiceConfig {
            database: DatabaseConfig::default(),
            files: FilesConfig::default(),
            global: GlobalServiceConfig::default(),
        };
        let orchestrator_config = OrchestratorConfig {
            backup_dir: tempfile::tempdir().unwrap().keep(),
            max_concurrent_backups: 3,
            default_retention_days: 7,
            backup_service_names: vec![],
            exclude_from_backup: vec![],
            exclude_mount_paths: vec![],
            docker_read_only: true,
            docker_exec_timeout: std::time::Duration::from_secs(30),
            config_file: None,
        };
        let scratch = tempfile::tempdir().unwrap();

        let result = run_pipeline(&runtime, &service, &config, &orchestrator_config, None, "acme_20260115_093000", scratch.path());
        assert!(result.succeeded(), "pipeline errors: {:?}", result.errors);
        assert!(result.archive_path.is_some());
        assert!(!runtime.is_stopped("acme_web"));
        assert!(!runtime.is_stopped("acme_db"));
    }

    #[test]
    fn quiesce_then_restore_restarts_in_original_input_order() {
        let web1 = container("acme_web1", "nginx:latest");
        let web2 = container("acme_web2", "nginx:latest");
        let db = container("acme_db", "postgres:16");
        let runtime = MockRuntime::new()
            .with_containers(vec![web1.clone(), web2.clone(), db.clone()])
            .with_exec_response("acme_db:pg_dump", ExecResponse { exit_code: 0, output: b"-- PostgreSQL database dump".to_vec() });

        let service = Service { name: "acme".to_string(), containers: vec![web1, web2, db] };
        let config = ServiceConfig {
            database: DatabaseConfig::default(),
            files: FilesConfig { requires_stopping: true, ..FilesConfig::default() },
            global: GlobalServiceConfig::default(),
        };
        let orchestrator_config = OrchestratorConfig {
            backup_dir: tempfile::tempdir().unwrap().keep(),
            max_concurrent_backups: 3,
            default_retention_days: 7,
            backup_service_names: vec![],
            exclude_from_backup: vec![],
            exclude_mount_paths: vec![],
            docker_read_only: true,
            docker_exec_timeout: std::time::Duration::from_secs(30),
            config_file: None,
        };
        let scratch = tempfile::tempdir().unwrap();

        let result = run_pipeline(&runtime, &service, &config, &orchestrator_config, None, "acme_20260115_093000", scratch.path());
        assert!(result.succeeded(), "pipeline errors: {:?}", result.errors);

        let starts: Vec<String> = runtime
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Start { container_id } => Some(container_id),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec!["acme_web1".to_string(), "acme_web2".to_string()]);
        assert!(!runtime.is_stopped("acme_web1"));
        assert!(!runtime.is_stopped("acme_web2"));
    }

    #[test]
    fn cgroup_line_extracts_trailing_container_id() {
        let id = "abcdef0123456789abcdef0123456789abcdef0123456789abcdef01234567";
        let line = format!("0::/docker/{id}");
        assert_eq!(container_id_from_cgroup_line(&line), Some(id.to_string()));

        let scope_line = format!("1:name=systemd:/system.slice/docker-{id}.scope");
        assert_eq!(container_id_from_cgroup_line(&scope_line), Some(id.to_string()));

        assert_eq!(container_id_from_cgroup_line("0::/user.slice"), None);
    }
}
