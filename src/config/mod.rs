//! Configuration for the backup orchestrator.
//!
//! Two layers:
//! - [`OrchestratorConfig`]: process-wide settings sourced from environment
//!   variables (spec §6), e.g. `BACKUP_DIR`, `MAX_CONCURRENT_BACKUPS`.
//! - Per-service [`types::ServiceConfig`], resolved by [`loader`]'s merge
//!   pipeline (spec §4.9).

mod loader;
mod types;

pub use loader::{load_config_file, resolve_service_config, ConfigError};
pub use types::*;

use std::path::PathBuf;
use std::time::Duration;

/// Process-wide settings read from environment (spec §6).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub backup_dir: PathBuf,
    pub max_concurrent_backups: usize,
    pub default_retention_days: u32,
    pub backup_service_names: Vec<String>,
    pub exclude_from_backup: Vec<String>,
    pub exclude_mount_paths: Vec<String>,
    pub docker_read_only: bool,
    pub docker_exec_timeout: Duration,
    pub config_file: Option<PathBuf>,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self {
            backup_dir: env_path("BACKUP_DIR", "/backups"),
            max_concurrent_backups: env_usize("MAX_CONCURRENT_BACKUPS", 3),
            default_retention_days: env_u32("BACKUP_RETENTION_DAYS", 7),
            backup_service_names: env_csv("BACKUP_SERVICE_NAMES"),
            exclude_from_backup: env_csv_or_space("EXCLUDE_FROM_BACKUP"),
            exclude_mount_paths: env_csv("EXCLUDE_MOUNT_PATHS"),
            docker_read_only: env_bool("DOCKER_READ_ONLY", true),
            docker_exec_timeout: Duration::from_secs(env_u32("DOCKER_EXEC_TIMEOUT", 300) as u64),
            config_file: std::env::var("CONFIG_FILE").ok().map(PathBuf::from),
        }
    }

    /// True if `service_name` matches any of this process's own names
    /// (case-insensitive), per the self-exclusion rule of spec §4.12.
    pub fn is_self(&self, service_name: &str) -> bool {
        self.backup_service_names
            .iter()
            .any(|n| n.eq_ignore_ascii_case(service_name))
    }

    pub fn is_excluded(&self, service_name: &str) -> bool {
        self.exclude_from_backup
            .iter()
            .any(|n| n.eq_ignore_ascii_case(service_name))
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_csv(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

/// Parses a comma-or-space separated list (spec: `EXCLUDE_FROM_BACKUP`),
/// matching the original's two-stage split (comma first, then whitespace
/// within each comma segment).
fn env_csv_or_space(key: &str) -> Vec<String> {
    let Ok(raw) = std::env::var(key) else {
        return Vec::new();
    };
    raw.split(',')
        .flat_map(|segment| segment.split_whitespace())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &std::path::Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_from_backup_parses_commas_and_spaces() {
        std::env::set_var("EXCLUDE_FROM_BACKUP", "Foo, bar baz,  Qux");
        let parsed = env_csv_or_space("EXCLUDE_FROM_BACKUP");
        assert_eq!(parsed, vec!["foo", "bar", "baz", "qux"]);
        std::env::remove_var("EXCLUDE_FROM_BACKUP");
    }

    #[test]
    fn expand_tilde_resolves_home() {
        let expanded = expand_tilde(std::path::Path::new("~/data"));
        assert!(!expanded.starts_with("~"));
    }
}
