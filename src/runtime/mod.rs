//! Runtime Adapter (C1, spec §4.1): a least-privilege capability over the
//! container runtime. Trait-based so the rest of the pipeline never pokes
//! into SDK-specific container objects (spec §9 "Duck-typed container
//! objects -> a Runtime capability").

pub mod docker;
pub mod mock;

use anyhow::Result;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(300);
pub const STOP_GRACE: Duration = Duration::from_secs(30);
pub const START_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountType {
    Bind,
    Volume,
    Tmpfs,
    Other(String),
}

#[derive(Debug, Clone)]
pub struct Mount {
    pub mount_type: MountType,
    pub source: String,
    pub destination: String,
    pub mode: String,
    pub rw: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited,
    Other(String),
}

/// Read-only view of a container (spec §3).
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image_reference: String,
    pub status: ContainerStatus,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
}

impl Container {
    /// Env as a `K=V` lookup map, first occurrence wins.
    pub fn env_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for entry in &self.env {
            if let Some((k, v)) = entry.split_once('=') {
                map.entry(k.to_string()).or_insert_with(|| v.to_string());
            }
        }
        map
    }

    pub fn has_hot_backup_label(&self) -> bool {
        self.labels.get("backup.hot").map(|v| v == "true").unwrap_or(false)
    }
}

fn id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([a-zA-Z0-9][\w.-]{1,63}|[a-f0-9]{12,64})$").expect("valid regex")
    })
}

/// Validates a container identifier (name or id) against spec §4.1's pattern
/// before any runtime call is made.
pub fn validate_container_id(id: &str) -> Result<()> {
    if id_pattern().is_match(id) {
        Ok(())
    } else {
        anyhow::bail!("invalid container identifier: {:?}", id)
    }
}

/// Outcome of `exec`: exit code plus combined/selected output bytes.
pub struct ExecResult {
    pub exit_code: i32,
    pub output: Vec<u8>,
}

/// The capability the core consumes to interact with running containers.
/// All operations validate the container id first; mutation operations
/// additionally respect read-only mode (spec §4.1).
pub trait ContainerRuntime: Send + Sync {
    fn list_running_containers(&self) -> Result<Vec<Container>>;

    fn inspect(&self, container_id: &str) -> Result<Container>;

    fn exec(
        &self,
        container_id: &str,
        cmd: &[&str],
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<ExecResult>;

    /// Stops the container, waiting up to `grace` before force-killing.
    fn stop(&self, container_id: &str, grace: Duration) -> Result<()>;

    fn start(&self, container_id: &str) -> Result<()>;

    /// True once the container reports `running` (and non-`unhealthy` if it
    /// declares a healthcheck).
    fn is_running_and_healthy(&self, container_id: &str) -> Result<bool>;

    /// Streams a tar archive of `path` from inside the container.
    fn stream_archive(&self, container_id: &str, path: &str) -> Result<Vec<u8>>;

    /// Whether this adapter is in read-only mode (mutation calls rejected).
    fn read_only(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_compose_style_names() {
        assert!(validate_container_id("acme_db_1").is_ok());
        assert!(validate_container_id("acme-db.1").is_ok());
    }

    #[test]
    fn accepts_hex_ids() {
        assert!(validate_container_id("a1b2c3d4e5f6").is_ok());
        assert!(validate_container_id(&"f".repeat(64)).is_ok());
    }

    #[test]
    fn rejects_shell_metacharacters() {
        assert!(validate_container_id("acme; rm -rf /").is_err());
        assert!(validate_container_id("$(whoami)").is_err());
        assert!(validate_container_id("a").is_err());
    }
}
