use anyhow::Result;
use backup_orchestrator::config::OrchestratorConfig;
use backup_orchestrator::logging::{self, LoggingConfig};
use backup_orchestrator::manager::BackupManager;
use backup_orchestrator::registry::portainer::{PortainerRegistry, RetryConfig};
use backup_orchestrator::registry::StackRegistry;
use backup_orchestrator::runtime::docker::DockerRuntime;
use backup_orchestrator::runtime::ContainerRuntime;
use backup_orchestrator::scheduler::{self, ScheduleOptions};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "backup-orchestrator")]
#[command(about = "Container-aware backup orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (trace|debug|info|warn|error); overrides LOG_LEVEL.
    #[arg(long)]
    log_level: Option<String>,

    /// Path to a JSON/YAML config fragment file; overrides CONFIG_FILE.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run backups for all eligible services, or just the ones named.
    Backup {
        /// Comma-separated service names; defaults to all eligible services.
        #[arg(long, value_delimiter = ',')]
        services: Vec<String>,
    },

    /// Report archive counts/sizes and active locks per service.
    Status {
        #[arg(long, default_value = "text")]
        output: StatusFormat,
    },

    /// Apply retention policies once across every service.
    Retention,

    /// Run backup and retention on independent intervals until a shutdown signal.
    Schedule {
        /// Backup interval, e.g. "24h".
        #[arg(long, default_value = "24h")]
        interval: String,

        /// Retention interval, e.g. "24h".
        #[arg(long, default_value = "24h")]
        retention_interval: String,

        /// Skip running a backup wave immediately on startup.
        #[arg(long)]
        no_initial_backup: bool,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum StatusFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::try_parse().unwrap_or_else(|e| {
        // --help/--version exit 0 as usual; a missing/unknown subcommand is
        // a usage error (spec §6) and exits 1, not clap's default of 2.
        use clap::error::ErrorKind;
        if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
            e.exit();
        }
        let _ = e.print();
        std::process::exit(1);
    });

    let log_level = cli.log_level.clone().or_else(|| std::env::var("LOG_LEVEL").ok()).unwrap_or_else(|| "info".to_string());
    let log_directory = dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join("logs");
    let logging_config = LoggingConfig::from_level_str(&log_directory, &log_level, 10);
    let _log_guard = logging::init_logging(&logging_config)?;

    if let Some(config_path) = &cli.config {
        std::env::set_var("CONFIG_FILE", config_path);
    }

    let orchestrator_config = OrchestratorConfig::from_env();
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::new(orchestrator_config.docker_read_only));
    let registry = build_registry()?;

    let manager = BackupManager::new(runtime, registry, orchestrator_config);

    match cli.command {
        Commands::Backup { services } => {
            let only = if services.is_empty() { None } else { Some(services.as_slice()) };
            let outcomes = manager.run(only)?;
            let mut any_failed = false;
            for outcome in &outcomes {
                if outcome.succeeded {
                    println!("{}: ok ({:.1}s)", outcome.service_name, outcome.duration.as_secs_f64());
                } else {
                    any_failed = true;
                    println!("{}: FAILED -- {}", outcome.service_name, outcome.errors.join("; "));
                }
            }
            if any_failed {
                std::process::exit(1);
            }
        }

        Commands::Status { output } => {
            let report = manager.status()?;
            match output {
                StatusFormat::Text => {
                    for service in &report.services {
                        println!(
                            "{}: {} archive(s), {} bytes, latest {}",
                            service.service,
                            service.archive_count,
                            service.total_bytes,
                            service.latest.map(|t| t.to_string()).unwrap_or_else(|| "never".to_string())
                        );
                    }
                    println!("active locks: {}", report.active_locks.len());
                }
                StatusFormat::Json => {
                    let json = serde_json::json!({
                        "services": report.services.iter().map(|s| serde_json::json!({
                            "service": s.service,
                            "archive_count": s.archive_count,
                            "total_bytes": s.total_bytes,
                            "latest": s.latest.map(|t| t.to_string()),
                        })).collect::<Vec<_>>(),
                        "active_locks": report.active_locks.len(),
                    });
                    println!("{}", serde_json::to_string_pretty(&json)?);
                }
            }
        }

        Commands::Retention => {
            let deleted = manager.run_retention_only()?;
            println!("retention removed {deleted} archive(s)");
        }

        Commands::Schedule { interval, retention_interval, no_initial_backup } => {
            let options = ScheduleOptions {
                backup_interval: parse_hours(&interval)?,
                retention_interval: parse_hours(&retention_interval)?,
                run_initial_backup: !no_initial_backup,
            };
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(scheduler::run(&manager, options))?;
        }
    }

    Ok(())
}

/// Parses an interval of the form `"<int>h"` (spec §4.13).
fn parse_hours(value: &str) -> Result<Duration> {
    let hours: u64 = value
        .strip_suffix('h')
        .ok_or_else(|| anyhow::anyhow!("invalid interval {value:?}: expected format <int>h"))?
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid interval {value:?}: expected format <int>h"))?;
    Ok(Duration::from_secs(hours * 3600))
}

/// Builds the registry adapter from `PORTAINER_*` env vars; returns `None`
/// when unconfigured (credential extraction then relies on container env
/// alone, spec §4.2/§4.3).
fn build_registry() -> Result<Option<Arc<dyn StackRegistry>>> {
    let (Ok(base_url), Ok(api_key)) = (std::env::var("PORTAINER_URL"), std::env::var("PORTAINER_API_KEY")) else {
        return Ok(None);
    };

    let retry = RetryConfig {
        connect_timeout: env_duration_secs("PORTAINER_CONNECT_TIMEOUT", 5),
        read_timeout: env_duration_secs("PORTAINER_READ_TIMEOUT", 15),
        retry_total: env_u32("PORTAINER_RETRY_TOTAL", 3),
        retry_backoff: Duration::from_millis(env_u32("PORTAINER_RETRY_BACKOFF", 500) as u64),
    };
    let insecure = env_bool("PORTAINER_INSECURE");
    let cache_ttl = env_duration_secs("PORTAINER_CACHE_TTL", 300);

    let registry = PortainerRegistry::new(base_url, api_key, insecure, retry, cache_ttl)?;
    Ok(Some(Arc::new(registry)))
}

fn env_duration_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default))
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str) -> bool {
    std::env::var(key).ok().map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on")).unwrap_or(false)
}
