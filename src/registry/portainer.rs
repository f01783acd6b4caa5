//! HTTP-backed `StackRegistry` talking to a Portainer-style stack API, with
//! bounded retries and a TTL cache (spec §4.2).

use super::{resolve_stack_env, RawEnvEntry, StackRegistry, TtlCache};
use crate::errors::OrchestratorError;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub retry_total: u32,
    pub retry_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(15),
            retry_total: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct StackSummary {
    #[serde(rename = "Id")]
    id: serde_json::Value,
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, serde::Deserialize)]
struct StackDetail {
    #[serde(default)]
    #[serde(rename = "Env")]
    env: Vec<RawEnvEntry>,
}

pub struct PortainerRegistry {
    base_url: String,
    api_key: String,
    retry: RetryConfig,
    client: reqwest::blocking::Client,
    stacks_cache: TtlCache<HashMap<String, String>>,
}

impl PortainerRegistry {
    pub fn new(base_url: String, api_key: String, insecure: bool, retry: RetryConfig, cache_ttl: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(retry.connect_timeout)
            .timeout(retry.read_timeout)
            .danger_accept_invalid_certs(insecure)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base_url,
            api_key,
            retry,
            client,
            stacks_cache: TtlCache::new(cache_ttl),
        })
    }

    /// Runs `request` up to `retry_total + 1` times, backing off
    /// exponentially on connect/read timeout and 5xx/429 responses.
    fn with_retries<F>(&self, mut request: F) -> Result<reqwest::blocking::Response>
    where
        F: FnMut() -> reqwest::Result<reqwest::blocking::Response>,
    {
        let mut attempt = 0;
        let mut backoff = self.retry.retry_backoff;
        loop {
            match request() {
                Ok(response) if response.status().is_server_error() || response.status().as_u16() == 429 => {
                    if attempt >= self.retry.retry_total {
                        return Err(OrchestratorError::RegistryUnavailable(format!(
                            "status {} after {} attempt(s)",
                            response.status(),
                            attempt + 1
                        ))
                        .into());
                    }
                }
                Ok(response) => return Ok(response),
                Err(e) if e.is_timeout() || e.is_connect() => {
                    if attempt >= self.retry.retry_total {
                        return Err(OrchestratorError::RegistryUnavailable(format!("{e} after {} attempt(s)", attempt + 1)).into());
                    }
                }
                Err(e) => return Err(e).context("registry request failed"),
            }
            attempt += 1;
            std::thread::sleep(backoff);
            backoff *= 2;
        }
    }

    fn fetch_stacks(&self) -> Result<HashMap<String, String>> {
        let url = format!("{}/api/stacks", self.base_url);
        let response = self
            .with_retries(|| {
                self.client
                    .get(&url)
                    .header("X-API-Key", &self.api_key)
                    .send()
            })
            .context("RegistryUnavailable")?;

        let summaries: Vec<StackSummary> = response.json().context("failed to parse stack list")?;
        Ok(summaries
            .into_iter()
            .map(|s| (s.name, s.id.to_string().trim_matches('"').to_string()))
            .collect())
    }

    fn fetch_stack_detail(&self, stack_id: &str) -> Result<StackDetail> {
        let url = format!("{}/api/stacks/{}", self.base_url, stack_id);
        let response = self
            .with_retries(|| {
                self.client
                    .get(&url)
                    .header("X-API-Key", &self.api_key)
                    .send()
            })
            .context("RegistryUnavailable")?;
        response.json().context("failed to parse stack detail")
    }
}

impl StackRegistry for PortainerRegistry {
    fn list_stacks(&self) -> Result<HashMap<String, String>> {
        self.stacks_cache.get_or_fetch("stacks", || self.fetch_stacks())
    }

    fn get_stack_env(&self, stack_name: &str) -> Result<Option<HashMap<String, String>>> {
        let stacks = self.list_stacks()?;
        let Some(stack_id) = stacks.get(stack_name) else {
            return Ok(None);
        };
        let detail = self.fetch_stack_detail(stack_id)?;
        Ok(Some(resolve_stack_env(&detail.env)))
    }
}
