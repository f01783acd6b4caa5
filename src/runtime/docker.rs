//! Real `ContainerRuntime` backed by the `docker` CLI.
//!
//! Follows the starting point's thread+channel timeout pattern (see its
//! `utils/docker.rs::archive_volume`) rather than nesting a tokio runtime
//! inside these synchronous trait methods, since callers may already be
//! running inside a tokio worker task.

use super::{validate_container_id, Container, ContainerStatus, ContainerRuntime, ExecResult, Mount, MountType};
use crate::errors::OrchestratorError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::process::{Command, Output, Stdio};
use std::sync::mpsc;
use std::time::Duration;

pub struct DockerRuntime {
    read_only: bool,
}

impl DockerRuntime {
    pub fn new(read_only: bool) -> Self {
        Self { read_only }
    }

    fn require_write_access(&self, action: &str) -> Result<()> {
        if self.read_only {
            return Err(OrchestratorError::PermissionDenied(format!("refusing to {action}: runtime adapter is in read-only mode")).into());
        }
        Ok(())
    }

    fn run(program: &str, args: &[&str], timeout: Duration) -> Result<Output> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let result = cmd.output();
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout) {
            Ok(result) => result.map_err(|e| OrchestratorError::RuntimeUnavailable(format!("failed to execute {program}: {e}")).into()),
            Err(_) => Err(OrchestratorError::TimeoutExceeded(timeout).into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InspectConfig {
    #[serde(default)]
    #[serde(rename = "Env")]
    env: Vec<String>,
    #[serde(default)]
    #[serde(rename = "Image")]
    image: String,
    #[serde(default)]
    #[serde(rename = "Labels")]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InspectHealth {
    #[serde(default)]
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(default)]
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Deserialize)]
struct InspectMount {
    #[serde(rename = "Type")]
    mount_type: String,
    #[serde(rename = "Source")]
    source: String,
    #[serde(rename = "Destination")]
    destination: String,
    #[serde(default)]
    #[serde(rename = "RW")]
    rw: bool,
    #[serde(default)]
    #[serde(rename = "Mode")]
    mode: String,
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Config")]
    config: InspectConfig,
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(default)]
    #[serde(rename = "Mounts")]
    mounts: Vec<InspectMount>,
}

fn command_failed(description: &str, output: &Output) -> anyhow::Error {
    OrchestratorError::CommandFailed {
        exit_code: output.status.code(),
        output: format!("{description}: {}", String::from_utf8_lossy(&output.stderr)),
    }
    .into()
}

fn to_mount_type(s: &str) -> MountType {
    match s {
        "bind" => MountType::Bind,
        "volume" => MountType::Volume,
        "tmpfs" => MountType::Tmpfs,
        other => MountType::Other(other.to_string()),
    }
}

fn to_container(entry: InspectEntry) -> Container {
    let status = match entry.state.status.as_str() {
        "running" => ContainerStatus::Running,
        "exited" => ContainerStatus::Exited,
        other => ContainerStatus::Other(other.to_string()),
    };

    Container {
        id: entry.id,
        name: entry.name.trim_start_matches('/').to_string(),
        image_reference: entry.config.image,
        status,
        labels: entry.config.labels,
        env: entry.config.env,
        mounts: entry
            .mounts
            .into_iter()
            .map(|m| Mount {
                mount_type: to_mount_type(&m.mount_type),
                source: m.source,
                destination: m.destination,
                mode: m.mode,
                rw: m.rw,
            })
            .collect(),
    }
}

impl ContainerRuntime for DockerRuntime {
    fn list_running_containers(&self) -> Result<Vec<Container>> {
        let output = Self::run("docker", &["ps", "-q"], Duration::from_secs(30))?;
        let ids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        ids.iter().map(|id| self.inspect(id)).collect()
    }

    fn inspect(&self, container_id: &str) -> Result<Container> {
        validate_container_id(container_id)?;
        let output = Self::run("docker", &["inspect", container_id], Duration::from_secs(30))?;
        if !output.status.success() {
            return Err(command_failed(&format!("docker inspect {container_id}"), &output));
        }
        let mut entries: Vec<InspectEntry> = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("failed to parse docker inspect output for {container_id}"))?;
        let entry = entries.pop().context("docker inspect returned no entries")?;
        Ok(to_container(entry))
    }

    fn exec(
        &self,
        container_id: &str,
        cmd: &[&str],
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<ExecResult> {
        validate_container_id(container_id)?;

        let mut args: Vec<String> = vec!["exec".to_string()];
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(container_id.to_string());
        args.extend(cmd.iter().map(|s| s.to_string()));

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = Self::run("docker", &arg_refs, timeout)?;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            output: output.stdout,
        })
    }

    fn stop(&self, container_id: &str, grace: Duration) -> Result<()> {
        validate_container_id(container_id)?;
        self.require_write_access("stop a container")?;

        let secs = grace.as_secs().to_string();
        let output = Self::run(
            "docker",
            &["stop", "-t", &secs, container_id],
            grace + Duration::from_secs(10),
        )?;
        if !output.status.success() {
            return Err(command_failed(&format!("docker stop {container_id}"), &output));
        }
        Ok(())
    }

    fn start(&self, container_id: &str) -> Result<()> {
        validate_container_id(container_id)?;
        self.require_write_access("start a container")?;

        let output = Self::run("docker", &["start", container_id], Duration::from_secs(30))?;
        if !output.status.success() {
            return Err(command_failed(&format!("docker start {container_id}"), &output));
        }
        Ok(())
    }

    fn is_running_and_healthy(&self, container_id: &str) -> Result<bool> {
        validate_container_id(container_id)?;
        let container = self.inspect(container_id)?;
        if container.status != ContainerStatus::Running {
            return Ok(false);
        }

        let output = Self::run(
            "docker",
            &["inspect", "--format", "{{json .State.Health}}", container_id],
            Duration::from_secs(15),
        )?;
        let text = String::from_utf8_lossy(&output.stdout);
        let text = text.trim();
        if text.is_empty() || text == "null" {
            return Ok(true);
        }
        let health: InspectHealth = serde_json::from_str(text).unwrap_or(InspectHealth { status: String::new() });
        Ok(health.status != "unhealthy")
    }

    fn stream_archive(&self, container_id: &str, path: &str) -> Result<Vec<u8>> {
        validate_container_id(container_id)?;
        let source = format!("{container_id}:{path}");
        let output = Self::run("docker", &["cp", &source, "-"], Duration::from_secs(600))?;
        if !output.status.success() {
            return Err(command_failed(&format!("docker cp {source}"), &output));
        }
        Ok(output.stdout)
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}
