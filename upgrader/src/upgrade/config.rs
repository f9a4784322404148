//! Orchestrator timing policy

use std::time::Duration;

use crate::errors::UpgradeError;
use crate::models::request::UpgradeRequest;

/// Wait after a reboot-inducing command before reconnecting
pub const DEFAULT_REBOOT_GRACE: Duration = Duration::from_secs(300);

/// Verification attempts after the grace interval
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Delay between verification attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Timeout for opening a session
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the install command
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(1800);

/// Timing policy shared by every run of an orchestrator.
///
/// Retry count, retry delay and install timeout come from each
/// [`UpgradeRequest`]; this only holds what is fixed per deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeConfig {
    /// Grace interval after install and after the rollback reload
    pub reboot_grace: Duration,

    /// Timeout for every connect
    pub connect_timeout: Duration,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            reboot_grace: DEFAULT_REBOOT_GRACE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl UpgradeConfig {
    pub fn validate(&self) -> Result<(), UpgradeError> {
        if self.connect_timeout.is_zero() {
            return Err(UpgradeError::Config(
                "connect timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Check the per-request policy before anything touches the device
pub fn validate_request(request: &UpgradeRequest) -> Result<(), UpgradeError> {
    if request.target_version.trim().is_empty() {
        return Err(UpgradeError::Config("target version is empty".to_string()));
    }
    if request.max_retries == 0 {
        return Err(UpgradeError::Config(
            "retry count must be at least 1".to_string(),
        ));
    }
    if request.install_timeout.is_zero() {
        return Err(UpgradeError::Config(
            "install timeout must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
