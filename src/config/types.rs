//! Effective configuration types for a service (spec §3 ServiceConfig).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Postgres,
    Mysql,
    Mariadb,
    Sqlite,
    Mongodb,
    Redis,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Postgres => "postgres",
            DatabaseType::Mysql => "mysql",
            DatabaseType::Mariadb => "mariadb",
            DatabaseType::Sqlite => "sqlite",
            DatabaseType::Mongodb => "mongodb",
            DatabaseType::Redis => "redis",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub db_type: Option<DatabaseType>,
    #[serde(default)]
    pub requires_stopping: bool,
    #[serde(default)]
    pub container_patterns: Vec<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilesConfig {
    #[serde(default)]
    pub data_paths: Vec<String>,
    #[serde(default)]
    pub requires_stopping: bool,
    #[serde(default)]
    pub exclusions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MixedRetention {
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalServiceConfig {
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub exclude_from_backup: bool,
    #[serde(default)]
    pub backup_retention_days: Option<u32>,
    #[serde(default)]
    pub mixed_retention: Option<MixedRetention>,
}

impl Default for GlobalServiceConfig {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            exclude_from_backup: false,
            backup_retention_days: None,
            mixed_retention: None,
        }
    }
}

fn default_priority() -> i32 {
    50
}

/// Effective per-service configuration, after the merge pipeline of §4.9.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub global: GlobalServiceConfig,
}

/// Database credentials (spec §3). All fields optional except validated port range.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Retention policy derived from `ServiceConfig.global` (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub enum RetentionPolicy {
    Days(u32),
    Count(u32),
    Mixed { daily: u32, weekly: u32, monthly: u32 },
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::Days(7)
    }
}

/// Built-in service template keyed by lowercased service name (spec §4.9).
pub fn builtin_templates() -> HashMap<&'static str, ServiceConfig> {
    let mut templates = HashMap::new();

    templates.insert(
        "wordpress",
        ServiceConfig {
            database: DatabaseConfig {
                db_type: Some(DatabaseType::Mysql),
                requires_stopping: false,
                container_patterns: vec!["*db*".into(), "*mysql*".into(), "*mariadb*".into()],
                credentials: None,
            },
            files: FilesConfig {
                data_paths: vec!["/var/www/html/wp-content".into()],
                requires_stopping: false,
                exclusions: vec!["*/cache/*".into()],
            },
            global: GlobalServiceConfig {
                priority: 50,
                exclude_from_backup: false,
                backup_retention_days: Some(14),
                mixed_retention: None,
            },
        },
    );

    templates.insert(
        "nextcloud",
        ServiceConfig {
            database: DatabaseConfig {
                db_type: Some(DatabaseType::Postgres),
                requires_stopping: false,
                container_patterns: vec!["*db*".into(), "*postgres*".into()],
                credentials: None,
            },
            files: FilesConfig {
                data_paths: vec!["/var/www/html/data".into(), "/var/www/html/config".into()],
                requires_stopping: false,
                exclusions: vec!["*/cache/*".into(), "*.part".into()],
            },
            global: GlobalServiceConfig {
                priority: 40,
                exclude_from_backup: false,
                backup_retention_days: None,
                mixed_retention: Some(MixedRetention { daily: 7, weekly: 4, monthly: 6 }),
            },
        },
    );

    templates.insert(
        "homeassistant",
        ServiceConfig {
            database: DatabaseConfig {
                db_type: Some(DatabaseType::Sqlite),
                requires_stopping: true,
                container_patterns: vec![],
                credentials: None,
            },
            files: FilesConfig {
                data_paths: vec!["/config".into()],
                requires_stopping: true,
                exclusions: vec!["*/tts/*".into(), "*.db-shm".into(), "*.db-wal".into()],
            },
            global: GlobalServiceConfig {
                priority: 30,
                exclude_from_backup: false,
                backup_retention_days: Some(30),
                mixed_retention: None,
            },
        },
    );

    templates
}
