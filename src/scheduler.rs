//! Scheduler (C13, spec §4.13): long-running daemon loop that runs backups
//! and retention on independent intervals until shut down.

use crate::manager::BackupManager;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

pub struct ScheduleOptions {
    pub backup_interval: Duration,
    pub retention_interval: Duration,
    pub run_initial_backup: bool,
}

/// Runs backups every `backup_interval` and retention every
/// `retention_interval`, each on its own clock, until SIGINT/SIGTERM
/// (spec §4.13: "intervals are independent; a slow backup run must not
/// delay the retention clock or vice versa").
pub async fn run(manager: &BackupManager, options: ScheduleOptions) -> anyhow::Result<()> {
    info!(
        "scheduler starting: backup every {:?}, retention every {:?}",
        options.backup_interval, options.retention_interval
    );

    if let Err(e) = manager.run_retention_only() {
        error!("initial retention pass failed: {e}");
    }

    if options.run_initial_backup {
        run_backup_wave(manager);
    }

    let mut backup_tick = tokio::time::interval(options.backup_interval);
    let mut retention_tick = tokio::time::interval(options.retention_interval);
    backup_tick.tick().await;
    retention_tick.tick().await;

    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = backup_tick.tick() => run_backup_wave(manager),
            _ = retention_tick.tick() => {
                if let Err(e) = manager.run_retention_only() {
                    error!("retention pass failed: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down scheduler");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down scheduler");
                return Ok(());
            }
        }
    }
}

fn run_backup_wave(manager: &BackupManager) {
    match manager.run(None) {
        Ok(outcomes) => {
            let failed = outcomes.iter().filter(|o| !o.succeeded).count();
            info!("scheduled backup wave: {} succeeded, {} failed", outcomes.len() - failed, failed);
        }
        Err(e) => error!("scheduled backup wave failed: {e}"),
    }
}
