//! In-memory mock `ContainerRuntime` for tests, following the starting
//! point's `utils/docker_ops::mock` pattern: record calls, return
//! pre-configured responses.

use super::{Container, ContainerRuntime, ExecResult};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug)]
pub enum RuntimeCall {
    Exec { container_id: String, cmd: Vec<String> },
    Stop { container_id: String },
    Start { container_id: String },
    StreamArchive { container_id: String, path: String },
}

#[derive(Clone, Default)]
pub struct MockRuntime {
    pub containers: Arc<Mutex<Vec<Container>>>,
    pub calls: Arc<Mutex<Vec<RuntimeCall>>>,
    pub exec_responses: Arc<Mutex<HashMap<String, ExecResponse>>>,
    pub archive_responses: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    pub stopped: Arc<Mutex<Vec<String>>>,
    pub running: Arc<Mutex<std::collections::HashSet<String>>>,
    pub read_only: Arc<Mutex<bool>>,
}

#[derive(Clone, Debug)]
pub struct ExecResponse {
    pub exit_code: i32,
    pub output: Vec<u8>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_containers(self, containers: Vec<Container>) -> Self {
        for c in &containers {
            self.running.lock().unwrap().insert(c.id.clone());
        }
        *self.containers.lock().unwrap() = containers;
        self
    }

    pub fn with_exec_response(self, key: &str, response: ExecResponse) -> Self {
        self.exec_responses.lock().unwrap().insert(key.to_string(), response);
        self
    }

    pub fn with_archive(self, container_id: &str, bytes: Vec<u8>) -> Self {
        self.archive_responses.lock().unwrap().insert(container_id.to_string(), bytes);
        self
    }

    pub fn with_read_only(self, ro: bool) -> Self {
        *self.read_only.lock().unwrap() = ro;
        self
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_stopped(&self, container_id: &str) -> bool {
        !self.running.lock().unwrap().contains(container_id)
    }
}

impl ContainerRuntime for MockRuntime {
    fn list_running_containers(&self) -> Result<Vec<Container>> {
        let running = self.running.lock().unwrap();
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|c| running.contains(&c.id))
            .cloned()
            .collect())
    }

    fn inspect(&self, container_id: &str) -> Result<Container> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == container_id || c.name == container_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown container: {container_id}"))
    }

    fn exec(
        &self,
        container_id: &str,
        cmd: &[&str],
        _env: &HashMap<String, String>,
        _timeout: Duration,
    ) -> Result<ExecResult> {
        self.calls.lock().unwrap().push(RuntimeCall::Exec {
            container_id: container_id.to_string(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
        });

        let key = format!("{container_id}:{}", cmd.first().unwrap_or(&""));
        let responses = self.exec_responses.lock().unwrap();
        let response = responses
            .get(&key)
            .or_else(|| responses.get(container_id))
            .cloned()
            .unwrap_or(ExecResponse { exit_code: 0, output: Vec::new() });

        Ok(ExecResult { exit_code: response.exit_code, output: response.output })
    }

    fn stop(&self, container_id: &str, _grace: Duration) -> Result<()> {
        self.calls.lock().unwrap().push(RuntimeCall::Stop { container_id: container_id.to_string() });
        self.running.lock().unwrap().remove(container_id);
        self.stopped.lock().unwrap().push(container_id.to_string());
        Ok(())
    }

    fn start(&self, container_id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(RuntimeCall::Start { container_id: container_id.to_string() });
        self.running.lock().unwrap().insert(container_id.to_string());
        Ok(())
    }

    fn is_running_and_healthy(&self, container_id: &str) -> Result<bool> {
        Ok(self.running.lock().unwrap().contains(container_id))
    }

    fn stream_archive(&self, container_id: &str, path: &str) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(RuntimeCall::StreamArchive {
            container_id: container_id.to_string(),
            path: path.to_string(),
        });
        Ok(self.archive_responses.lock().unwrap().get(container_id).cloned().unwrap_or_default())
    }

    fn read_only(&self) -> bool {
        *self.read_only.lock().unwrap()
    }
}
