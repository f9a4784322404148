//! Finite state machine for a single firmware upgrade run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backup::BackupRef;
use crate::session::RemoteFile;
use crate::upgrade::events::TransitionRecord;
use crate::upgrade::outcome::UpgradeOutcome;

/// Upgrade state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeState {
    /// Nothing done yet
    Idle,

    /// Running version is known
    VersionChecked,

    /// Device already runs the target version
    AlreadyCurrent,

    /// Configuration snapshot stored
    BackedUp,

    /// Firmware image uploaded
    Transferred,

    /// Install accepted, device rebooting into the new image
    Installed,

    /// Verification failed, rollback not yet resolved
    RollbackPending,

    /// Device verified on the target version
    Success,

    /// Device reverted to the previous image and configuration
    RolledBack,

    /// Rollback did not complete; operator action required
    RollbackFailed,

    /// Run stopped before the device was changed
    Aborted,
}

impl UpgradeState {
    pub fn name(&self) -> &'static str {
        match self {
            UpgradeState::Idle => "idle",
            UpgradeState::VersionChecked => "version_checked",
            UpgradeState::AlreadyCurrent => "already_current",
            UpgradeState::BackedUp => "backed_up",
            UpgradeState::Transferred => "transferred",
            UpgradeState::Installed => "installed",
            UpgradeState::RollbackPending => "rollback_pending",
            UpgradeState::Success => "success",
            UpgradeState::RolledBack => "rolled_back",
            UpgradeState::RollbackFailed => "rollback_failed",
            UpgradeState::Aborted => "aborted",
        }
    }

    /// No transition leaves this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpgradeState::AlreadyCurrent
                | UpgradeState::Success
                | UpgradeState::RolledBack
                | UpgradeState::RollbackFailed
                | UpgradeState::Aborted
        )
    }

    /// The device has been told to install new firmware
    pub fn is_post_install(&self) -> bool {
        matches!(
            self,
            UpgradeState::Installed
                | UpgradeState::RollbackPending
                | UpgradeState::Success
                | UpgradeState::RolledBack
                | UpgradeState::RollbackFailed
        )
    }
}

impl std::fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Upgrade event
#[derive(Debug, Clone)]
pub enum UpgradeEvent {
    /// Connected and read the running version
    VersionRead(String),

    /// Running version equals the target
    VersionMatches,

    /// Snapshot stored
    BackupSaved(BackupRef),

    /// Snapshot could not be taken or stored
    BackupFailed(String),

    /// Image uploaded
    TransferSucceeded(RemoteFile),

    /// Image upload failed
    TransferFailed(String),

    /// Device accepted the install command
    InstallAccepted(String),

    /// Install command failed or timed out
    InstallFailed(String),

    /// Stop before any change is made (connect failure, invalid request, cancellation)
    Abort(String),

    /// Device reports the target version
    Verified(String),

    /// Verification budget spent without a match
    VerificationExhausted(String),

    /// Unexpected failure after install
    Fault(String),

    /// Image revert and config restore done
    RollbackCompleted,

    /// Rollback could not be completed
    RollbackError(String),
}

impl UpgradeEvent {
    /// Human-readable detail recorded with the transition
    pub fn detail(&self) -> String {
        match self {
            UpgradeEvent::VersionRead(v) => format!("running version {}", v),
            UpgradeEvent::VersionMatches => "already running the target version".to_string(),
            UpgradeEvent::BackupSaved(r) => format!("configuration saved as {}", r),
            UpgradeEvent::TransferSucceeded(f) => format!("firmware uploaded to {}", f.path),
            UpgradeEvent::InstallAccepted(out) => out.trim().to_string(),
            UpgradeEvent::Verified(v) => format!("device reports {}", v),
            UpgradeEvent::RollbackCompleted => "previous image and configuration restored".to_string(),
            UpgradeEvent::BackupFailed(e)
            | UpgradeEvent::TransferFailed(e)
            | UpgradeEvent::InstallFailed(e)
            | UpgradeEvent::Abort(e)
            | UpgradeEvent::VerificationExhausted(e)
            | UpgradeEvent::Fault(e)
            | UpgradeEvent::RollbackError(e) => e.clone(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            UpgradeEvent::BackupFailed(_)
                | UpgradeEvent::TransferFailed(_)
                | UpgradeEvent::InstallFailed(_)
                | UpgradeEvent::Abort(_)
                | UpgradeEvent::VerificationExhausted(_)
                | UpgradeEvent::Fault(_)
                | UpgradeEvent::RollbackError(_)
        )
    }
}

/// Mutable state of one run, owned by the orchestrator
#[derive(Debug, Clone)]
pub struct UpgradeSession {
    state: UpgradeState,
    target_version: String,
    current_version: Option<String>,
    backup_reference: Option<BackupRef>,
    remote_file: Option<RemoteFile>,
    failure: Option<String>,
    rollback_error: Option<String>,
    verification_attempts: u32,
    last_transition: DateTime<Utc>,
    log: Vec<TransitionRecord>,
}

impl UpgradeSession {
    /// Create a session in idle state
    pub fn new(target_version: impl Into<String>) -> Self {
        Self {
            state: UpgradeState::Idle,
            target_version: target_version.into(),
            current_version: None,
            backup_reference: None,
            remote_file: None,
            failure: None,
            rollback_error: None,
            verification_attempts: 0,
            last_transition: Utc::now(),
            log: Vec::new(),
        }
    }

    pub fn state(&self) -> UpgradeState {
        self.state
    }

    pub fn target_version(&self) -> &str {
        &self.target_version
    }

    /// Last version read from the device
    pub fn current_version(&self) -> Option<&str> {
        self.current_version.as_deref()
    }

    pub fn backup_reference(&self) -> Option<&BackupRef> {
        self.backup_reference.as_ref()
    }

    pub fn remote_file(&self) -> Option<&RemoteFile> {
        self.remote_file.as_ref()
    }

    /// Cause of the failure that ended or escalated the run
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn rollback_error(&self) -> Option<&str> {
        self.rollback_error.as_deref()
    }

    pub fn verification_attempts(&self) -> u32 {
        self.verification_attempts
    }

    pub fn last_transition(&self) -> DateTime<Utc> {
        self.last_transition
    }

    /// Transition log, one record per transition
    pub fn log(&self) -> &[TransitionRecord] {
        &self.log
    }

    /// Count a verification attempt. Only valid while installed.
    pub fn record_verification_attempt(&mut self) -> Result<u32, String> {
        if self.state != UpgradeState::Installed {
            return Err(format!(
                "Verification attempt outside installed state: {:?}",
                self.state
            ));
        }
        self.verification_attempts += 1;
        Ok(self.verification_attempts)
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: UpgradeEvent) -> Result<&TransitionRecord, String> {
        let new_state = match (&self.state, &event) {
            // From Idle
            (UpgradeState::Idle, UpgradeEvent::VersionRead(version)) => {
                self.current_version = Some(version.clone());
                UpgradeState::VersionChecked
            }

            // From VersionChecked
            (UpgradeState::VersionChecked, UpgradeEvent::VersionMatches) => {
                UpgradeState::AlreadyCurrent
            }
            (UpgradeState::VersionChecked, UpgradeEvent::BackupSaved(reference)) => {
                self.backup_reference = Some(reference.clone());
                UpgradeState::BackedUp
            }
            (UpgradeState::VersionChecked, UpgradeEvent::BackupFailed(err)) => {
                self.failure = Some(format!("backup failed: {}", err));
                UpgradeState::Aborted
            }

            // From BackedUp
            (UpgradeState::BackedUp, UpgradeEvent::TransferSucceeded(file)) => {
                self.remote_file = Some(file.clone());
                UpgradeState::Transferred
            }
            (UpgradeState::BackedUp, UpgradeEvent::TransferFailed(err)) => {
                self.failure = Some(format!("firmware transfer failed: {}", err));
                UpgradeState::Aborted
            }

            // From Transferred
            (UpgradeState::Transferred, UpgradeEvent::InstallAccepted(_)) => UpgradeState::Installed,
            (UpgradeState::Transferred, UpgradeEvent::InstallFailed(err)) => {
                self.failure = Some(format!("install failed: {}", err));
                UpgradeState::Aborted
            }

            // Any state before install can stop without touching the device
            (
                UpgradeState::Idle
                | UpgradeState::VersionChecked
                | UpgradeState::BackedUp
                | UpgradeState::Transferred,
                UpgradeEvent::Abort(reason),
            ) => {
                self.failure = Some(reason.clone());
                UpgradeState::Aborted
            }

            // From Installed
            (UpgradeState::Installed, UpgradeEvent::Verified(version)) => {
                self.current_version = Some(version.clone());
                UpgradeState::Success
            }
            (
                UpgradeState::Installed,
                UpgradeEvent::VerificationExhausted(err) | UpgradeEvent::Fault(err),
            ) => {
                self.failure = Some(err.clone());
                UpgradeState::RollbackPending
            }

            // From RollbackPending
            (UpgradeState::RollbackPending, UpgradeEvent::RollbackCompleted) => {
                UpgradeState::RolledBack
            }
            (UpgradeState::RollbackPending, UpgradeEvent::RollbackError(err)) => {
                self.rollback_error = Some(err.clone());
                UpgradeState::RollbackFailed
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        let from = self.state;
        self.state = new_state;
        self.last_transition = Utc::now();
        self.log.push(TransitionRecord {
            from,
            state: new_state,
            success: !event.is_failure(),
            detail: event.detail(),
            at: self.last_transition,
        });

        self.log
            .last()
            .ok_or_else(|| "Transition log is empty".to_string())
    }

    /// Final outcome, once the session is in a terminal state
    pub fn outcome(&self) -> Option<UpgradeOutcome> {
        let reason = || {
            self.failure
                .clone()
                .unwrap_or_else(|| "unknown failure".to_string())
        };

        match self.state {
            UpgradeState::AlreadyCurrent => Some(UpgradeOutcome::AlreadyCurrent {
                version: self.current_version.clone().unwrap_or_default(),
            }),
            UpgradeState::Success => Some(UpgradeOutcome::Success {
                version: self.current_version.clone().unwrap_or_default(),
            }),
            UpgradeState::Aborted => Some(UpgradeOutcome::FailedNoChange { reason: reason() }),
            UpgradeState::RolledBack => Some(UpgradeOutcome::FailedRolledBack { reason: reason() }),
            UpgradeState::RollbackFailed => Some(UpgradeOutcome::FailedRollbackFailed {
                reason: reason(),
                rollback_error: self
                    .rollback_error
                    .clone()
                    .unwrap_or_else(|| "unknown rollback failure".to_string()),
            }),
            _ => None,
        }
    }
}
