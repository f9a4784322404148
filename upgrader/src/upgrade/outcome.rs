//! Terminal results of an upgrade run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backup::BackupRef;
use crate::models::device::DeviceSummary;
use crate::upgrade::events::TransitionRecord;

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpgradeOutcome {
    /// Device verified on the target version
    Success { version: String },

    /// Device was already on the target version; nothing was changed
    AlreadyCurrent { version: String },

    /// Run stopped before the device was changed
    FailedNoChange { reason: String },

    /// Upgrade failed and the device was restored
    FailedRolledBack { reason: String },

    /// Upgrade failed and so did the rollback. Needs an operator.
    FailedRollbackFailed {
        reason: String,
        rollback_error: String,
    },
}

/// How loudly an outcome should be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warning,
    Error,
    Critical,
}

impl UpgradeOutcome {
    /// Automation can no longer recover the device
    pub fn is_fatal(&self) -> bool {
        matches!(self, UpgradeOutcome::FailedRollbackFailed { .. })
    }

    pub fn severity(&self) -> Severity {
        match self {
            UpgradeOutcome::Success { .. } | UpgradeOutcome::AlreadyCurrent { .. } => Severity::Ok,
            UpgradeOutcome::FailedNoChange { .. } => Severity::Warning,
            UpgradeOutcome::FailedRolledBack { .. } => Severity::Error,
            UpgradeOutcome::FailedRollbackFailed { .. } => Severity::Critical,
        }
    }

    /// Process exit code, one per variant
    pub fn exit_code(&self) -> i32 {
        match self {
            UpgradeOutcome::Success { .. } => 0,
            UpgradeOutcome::AlreadyCurrent { .. } => 2,
            UpgradeOutcome::FailedNoChange { .. } => 3,
            UpgradeOutcome::FailedRolledBack { .. } => 4,
            UpgradeOutcome::FailedRollbackFailed { .. } => 5,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpgradeOutcome::Success { .. } => "success",
            UpgradeOutcome::AlreadyCurrent { .. } => "already_current",
            UpgradeOutcome::FailedNoChange { .. } => "failed_no_change",
            UpgradeOutcome::FailedRolledBack { .. } => "failed_rolled_back",
            UpgradeOutcome::FailedRollbackFailed { .. } => "failed_rollback_failed",
        }
    }
}

impl std::fmt::Display for UpgradeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradeOutcome::Success { version } => {
                write!(f, "upgrade successful, device is running {}", version)
            }
            UpgradeOutcome::AlreadyCurrent { version } => {
                write!(f, "device already running target version {}", version)
            }
            UpgradeOutcome::FailedNoChange { reason } => {
                write!(f, "upgrade failed, device unchanged: {}", reason)
            }
            UpgradeOutcome::FailedRolledBack { reason } => {
                write!(f, "upgrade failed, device rolled back: {}", reason)
            }
            UpgradeOutcome::FailedRollbackFailed {
                reason,
                rollback_error,
            } => write!(
                f,
                "upgrade failed ({}) and rollback failed ({}); manual intervention required",
                reason, rollback_error
            ),
        }
    }
}

/// Immutable record of a completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeReport {
    pub run_id: String,
    pub device: DeviceSummary,
    pub target_version: String,
    pub outcome: UpgradeOutcome,
    pub verification_attempts: u32,
    pub rollback_attempted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupRef>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub transitions: Vec<TransitionRecord>,
}
