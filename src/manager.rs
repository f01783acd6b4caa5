//! Backup Manager (C12, spec §4.12): discovers services, dispatches each
//! through the pipeline under a bounded worker pool, then applies
//! retention. Adapted from the starting point's `managers/backup.rs`
//! service-iteration shape, replacing its restic-strategy dispatch with
//! the container pipeline and its fixed sequential loop with a
//! backpressure-aware worker pool (spec §5).

use crate::config::{GlobalServiceConfig, OrchestratorConfig, RetentionPolicy, ServiceConfig};
use crate::discovery::{self, Service};
use crate::errors::OrchestratorError;
use crate::lock::LockManager;
use crate::pipeline::{self, PipelineResult};
use crate::registry::StackRegistry;
use crate::retention;
use crate::runtime::ContainerRuntime;
use chrono::Local;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info, warn};

/// Per-service outcome returned to the CLI.
pub struct BackupOutcome {
    pub service_name: String,
    pub succeeded: bool,
    pub archive_path: Option<std::path::PathBuf>,
    pub errors: Vec<String>,
    pub duration: std::time::Duration,
}

pub struct BackupManager {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Option<Arc<dyn StackRegistry>>,
    config: OrchestratorConfig,
    lock_manager: LockManager,
}

impl BackupManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, registry: Option<Arc<dyn StackRegistry>>, config: OrchestratorConfig) -> Self {
        let lock_manager = LockManager::new(&config.backup_dir);
        Self { runtime, registry, config, lock_manager }
    }

    /// Discovers all services, optionally narrowed to `only` (by name),
    /// dropping self and excluded services (spec §4.12).
    fn eligible_services(&self, only: Option<&[String]>) -> Result<Vec<(Service, ServiceConfig)>, anyhow::Error> {
        let containers = self.runtime.list_running_containers()?;
        let known_stacks = self.registry.as_ref().map(|r| r.list_stacks()).transpose()?.unwrap_or_default();
        let known_stack_names: Vec<String> = known_stacks.keys().cloned().collect();

        let services = discovery::discover_services(containers, &known_stack_names);

        let mut result = Vec::new();
        for service in services {
            if self.config.is_self(&service.name) || self.config.is_excluded(&service.name) {
                continue;
            }
            if let Some(only) = only {
                if !only.iter().any(|n| n.eq_ignore_ascii_case(&service.name)) {
                    continue;
                }
            }
            let config = crate::config::resolve_service_config(&service.name, Some(&service.containers), &HashMap::new(), None)?;
            if config.global.exclude_from_backup {
                continue;
            }
            result.push((service, config));
        }

        result.sort_by_key(|(_, config)| config.global.priority);
        Ok(result)
    }

    /// Backs up every eligible service (or only those named in `only`),
    /// dispatching under a CPU/memory-aware worker pool (spec §5), then
    /// applies retention across all services. Returns one outcome per
    /// service that was actually dispatched.
    pub fn run(&self, only: Option<&[String]>) -> Result<Vec<BackupOutcome>, anyhow::Error> {
        let services = self.eligible_services(only)?;
        if services.is_empty() {
            warn!("no eligible services to back up");
            return Ok(Vec::new());
        }
        info!("backing up {} service(s)", services.len());

        let worker_count = effective_worker_count(self.config.max_concurrent_backups);
        info!("dispatching with {worker_count} worker(s)");

        let services = Mutex::new(services.into_iter().collect::<std::collections::VecDeque<_>>());
        let outcomes: Mutex<Vec<BackupOutcome>> = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..worker_count {
                scope.spawn(|| loop {
                    let next = services.lock().unwrap().pop_front();
                    let Some((service, service_config)) = next else { break };
                    let outcome = self.run_one(&service, &service_config);
                    outcomes.lock().unwrap().push(outcome);
                });
            }
        });

        let outcomes = outcomes.into_inner().unwrap();

        if let Err(e) = self.apply_retention(&outcomes) {
            error!("retention pass failed: {e}");
        }

        Ok(outcomes)
    }

    fn run_one(&self, service: &Service, service_config: &ServiceConfig) -> BackupOutcome {
        let backup_name = format!("{}_{}", service.name, Local::now().format("%Y%m%d_%H%M%S"));
        let started = Instant::now();

        let guard = match self.lock_manager.acquire(&service.name, &backup_name) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                let err = OrchestratorError::LockHeld(service.name.clone());
                return BackupOutcome {
                    service_name: service.name.clone(),
                    succeeded: false,
                    archive_path: None,
                    errors: vec![err.to_string()],
                    duration: started.elapsed(),
                }
            }
            Err(e) => {
                return BackupOutcome {
                    service_name: service.name.clone(),
                    succeeded: false,
                    archive_path: None,
                    errors: vec![format!("failed to acquire lock: {e}")],
                    duration: started.elapsed(),
                }
            }
        };

        let stack_env = self
            .registry
            .as_ref()
            .and_then(|r| r.get_stack_env(&service.name).ok().flatten());

        let scratch = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                drop(guard);
                return BackupOutcome {
                    service_name: service.name.clone(),
                    succeeded: false,
                    archive_path: None,
                    errors: vec![format!("failed to create scratch directory: {e}")],
                    duration: started.elapsed(),
                };
            }
        };

        let result: PipelineResult = pipeline::run_pipeline(
            self.runtime.as_ref(),
            service,
            service_config,
            &self.config,
            stack_env.as_ref(),
            &backup_name,
            scratch.path(),
        );

        drop(guard);

        let succeeded = result.succeeded();
        if succeeded {
            info!("backup for '{}' completed in {:.1}s", service.name, started.elapsed().as_secs_f64());
        } else {
            error!("backup for '{}' failed: {:?}", service.name, result.errors);
        }

        BackupOutcome {
            service_name: result.service_name,
            succeeded,
            archive_path: result.archive_path,
            errors: result.errors,
            duration: started.elapsed(),
        }
    }

    fn apply_retention(&self, outcomes: &[BackupOutcome]) -> Result<(), anyhow::Error> {
        let policies: HashMap<String, RetentionPolicy> = outcomes
            .iter()
            .filter_map(|o| {
                let config = crate::config::resolve_service_config(&o.service_name, None, &HashMap::new(), None).ok()?;
                Some((o.service_name.clone(), retention_policy_for(&config.global, self.config.default_retention_days)))
            })
            .collect();
        let default_policy = RetentionPolicy::Days(self.config.default_retention_days);
        let deleted = retention::apply_retention(&self.config.backup_dir, &policies, &default_policy, &self.lock_manager)?;
        if deleted > 0 {
            info!("retention removed {deleted} expired archive(s)");
        }
        Ok(())
    }

    /// Applies retention across every archive on disk, independent of any
    /// backup run (spec §6 `retention` subcommand).
    pub fn run_retention_only(&self) -> Result<usize, anyhow::Error> {
        let services = self.eligible_services(None)?;
        let policies: HashMap<String, RetentionPolicy> = services
            .iter()
            .map(|(service, config)| (service.name.clone(), retention_policy_for(&config.global, self.config.default_retention_days)))
            .collect();
        let default_policy = RetentionPolicy::Days(self.config.default_retention_days);
        retention::apply_retention(&self.config.backup_dir, &policies, &default_policy, &self.lock_manager)
    }

    /// Per-service archive counts/sizes/latest timestamp plus active locks
    /// (spec §6 `status` subcommand).
    pub fn status(&self) -> Result<StatusReport, anyhow::Error> {
        let mut by_service: HashMap<String, ServiceStatus> = HashMap::new();
        if let Ok(entries) = std::fs::read_dir(&self.config.backup_dir) {
            for entry in entries.flatten() {
                let Some(backup) = retention::parse_archive_name(&entry.path()) else { continue };
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                let status = by_service.entry(backup.service.clone()).or_insert_with(|| ServiceStatus {
                    service: backup.service.clone(),
                    archive_count: 0,
                    total_bytes: 0,
                    latest: None,
                });
                status.archive_count += 1;
                status.total_bytes += size;
                status.latest = match status.latest {
                    Some(existing) if existing >= backup.timestamp => Some(existing),
                    _ => Some(backup.timestamp),
                };
            }
        }
        let mut services: Vec<ServiceStatus> = by_service.into_values().collect();
        services.sort_by(|a, b| a.service.cmp(&b.service));

        Ok(StatusReport { services, active_locks: self.lock_manager.active_locks()? })
    }
}

pub struct ServiceStatus {
    pub service: String,
    pub archive_count: usize,
    pub total_bytes: u64,
    pub latest: Option<chrono::NaiveDateTime>,
}

pub struct StatusReport {
    pub services: Vec<ServiceStatus>,
    pub active_locks: Vec<crate::lock::LockRecord>,
}

fn retention_policy_for(global: &GlobalServiceConfig, default_days: u32) -> RetentionPolicy {
    if let Some(mixed) = &global.mixed_retention {
        RetentionPolicy::Mixed { daily: mixed.daily, weekly: mixed.weekly, monthly: mixed.monthly }
    } else {
        RetentionPolicy::Days(global.backup_retention_days.unwrap_or(default_days))
    }
}

/// Scales `configured` down under memory pressure and caps it to 75% of
/// logical CPUs, per spec §5's backpressure formula.
fn effective_worker_count(configured: usize) -> usize {
    use sysinfo::System;
    let mut system = System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let cpu_cap = ((system.cpus().len() as f64 * 0.75).ceil() as usize).max(1);
    let mut workers = configured.min(cpu_cap).max(1);

    let total_mem = system.total_memory();
    if total_mem > 0 {
        let used_pct = (system.used_memory() as f64 / total_mem as f64) * 100.0;
        if used_pct > 80.0 {
            let scale = (1.0 - (used_pct - 80.0) / 20.0).clamp(0.2, 1.0);
            workers = ((workers as f64) * scale).floor().max(1.0) as usize;
        }
    }
    workers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MixedRetention;

    #[test]
    fn retention_policy_prefers_mixed_over_days() {
        let global = GlobalServiceConfig {
            priority: 50,
            exclude_from_backup: false,
            backup_retention_days: Some(7),
            mixed_retention: Some(MixedRetention { daily: 7, weekly: 4, monthly: 6 }),
        };
        assert_eq!(retention_policy_for(&global, 7), RetentionPolicy::Mixed { daily: 7, weekly: 4, monthly: 6 });
    }

    #[test]
    fn retention_policy_falls_back_to_default_days() {
        let global = GlobalServiceConfig::default();
        assert_eq!(retention_policy_for(&global, 10), RetentionPolicy::Days(10));
    }

    #[test]
    fn effective_worker_count_never_reaches_zero() {
        assert!(effective_worker_count(3) >= 1);
        assert!(effective_worker_count(0) >= 1);
    }
}
