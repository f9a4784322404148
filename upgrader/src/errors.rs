//! Error types for the upgrade orchestrator

use thiserror::Error;

/// Errors returned by device sessions, vendor adapters and backup stores.
///
/// None of these escape a run: the orchestrator maps every one of them into
/// an [`UpgradeOutcome`](crate::upgrade::outcome::UpgradeOutcome).
#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    #[error("Rollback error: {0}")]
    Rollback(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upgrade cancelled {0}")]
    Cancelled(String),
}
