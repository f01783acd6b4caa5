//! Config Resolver (C9, spec §4.9).
//!
//! Merges, in increasing precedence: built-in templates (by lowercased
//! service name) -> config file (JSON or YAML) -> env
//! (`SERVICE_CONFIG_<NAME>`) -> explicit programmatic override. Merging is
//! field-wise over the known `ServiceConfig` schema: each source is
//! represented as a JSON value and folded with a recursive object merge,
//! then the result is deserialized into the typed config. If no source
//! matched a service but containers were supplied, a heuristic discovery
//! pass synthesizes a config from what's observed on the containers.

use super::types::*;
use crate::runtime::Container;
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("failed to parse config file: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("unsupported config file extension: {0}")]
    UnsupportedFormat(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level config file: `service_name -> ServiceConfig` fragment (spec §6).
/// Unknown fields are ignored (serde's default behavior for untagged structs
/// without `deny_unknown_fields`).
pub fn load_config_file<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Value>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let parsed: HashMap<String, Value> = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&contents)?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
        other => {
            // Best effort: try JSON first, then YAML, before giving up.
            if let Ok(v) = serde_json::from_str(&contents) {
                v
            } else {
                match serde_yaml::from_str(&contents) {
                    Ok(v) => v,
                    Err(_) => {
                        return Err(ConfigError::UnsupportedFormat(
                            other.unwrap_or("<none>").to_string(),
                        ))
                    }
                }
            }
        }
    };

    Ok(parsed)
}

/// Recursive merge: `patch`'s keys win, nested objects merge field-wise,
/// everything else (scalars, arrays) is replaced wholesale.
fn deep_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(base_value) => deep_merge(base_value, patch_value),
                    None => {
                        base_map.insert(key, patch_value);
                    }
                }
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value;
        }
    }
}

/// Parse the `SERVICE_CONFIG_<NAME>` env fragment for one service, if present.
fn env_override(service_name: &str) -> Option<Value> {
    let key = format!("SERVICE_CONFIG_{}", service_name.to_uppercase());
    let raw = env::var(&key).ok()?;
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("ignoring malformed {}: {}", key, e);
            None
        }
    }
}

/// Heuristic discovery: synthesize a config from what's observed on the
/// service's containers when no explicit source provided one (spec §4.9).
fn heuristic_config(containers: &[Container]) -> ServiceConfig {
    let mut database = DatabaseConfig::default();
    for container in containers {
        if let Some(db_type) = crate::dump::detect_flavor(&container.image_reference) {
            database.db_type = Some(db_type);
            break;
        }
    }

    let mut data_paths = Vec::new();
    for container in containers {
        for mount in &container.mounts {
            if !crate::files::is_system_path(&mount.destination) {
                data_paths.push(mount.destination.clone());
            }
        }
    }
    data_paths.sort();
    data_paths.dedup();

    ServiceConfig {
        database,
        files: FilesConfig {
            data_paths,
            requires_stopping: false,
            exclusions: vec![],
        },
        global: GlobalServiceConfig::default(),
    }
}

/// Resolve the effective configuration for one service, applying the full
/// precedence chain. `containers` is only consulted for heuristic discovery
/// when no other source matched.
pub fn resolve_service_config(
    service_name: &str,
    containers: Option<&[Container]>,
    file_configs: &HashMap<String, Value>,
    explicit: Option<Value>,
) -> std::result::Result<ServiceConfig, ConfigError> {
    let mut merged = Value::Object(serde_json::Map::new());
    let mut matched = false;

    if let Some(template) = builtin_templates().get(service_name.to_lowercase().as_str()) {
        deep_merge(&mut merged, serde_json::to_value(template).expect("ServiceConfig serializes"));
        matched = true;
    }

    if let Some(file_value) = file_configs.get(service_name) {
        deep_merge(&mut merged, file_value.clone());
        matched = true;
    }

    if let Some(env_value) = env_override(service_name) {
        deep_merge(&mut merged, env_value);
        matched = true;
    }

    if let Some(explicit_value) = explicit {
        deep_merge(&mut merged, explicit_value);
        matched = true;
    }

    if !matched {
        if let Some(containers) = containers {
            if !containers.is_empty() {
                return Ok(heuristic_config(containers));
            }
        }
    }

    let config: ServiceConfig = serde_json::from_value(merged).unwrap_or_default();
    Ok(config)
}
