//! Error kinds distinguished by the core (spec §7).
//!
//! Most call sites still return `anyhow::Result` for convenience, but
//! anything that needs to branch on *what kind* of failure happened
//! (the pipeline's per-step recovery logic, the CLI's exit code) matches
//! on this enum instead of string-sniffing an `anyhow::Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("stack registry unavailable after retries: {0}")]
    RegistryUnavailable(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("command failed (exit {exit_code:?}): {output}")]
    CommandFailed { exit_code: Option<i32>, output: String },

    #[error("invalid credential input: {0}")]
    InvalidCredentialInput(String),

    #[error("lock held for service '{0}'")]
    LockHeld(String),

    #[error("archive write failed: {0}")]
    ArchiveWriteError(String),

    #[error("operation timed out after {0:?}")]
    TimeoutExceeded(std::time::Duration),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl OrchestratorError {
    /// Per spec §7: only these two kinds are fatal to a service; everything
    /// else is recovered locally (artifact/container skipped, reported).
    pub fn is_fatal_to_service(&self) -> bool {
        matches!(
            self,
            OrchestratorError::RuntimeUnavailable(_) | OrchestratorError::ArchiveWriteError(_)
        )
    }
}
