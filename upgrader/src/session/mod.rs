//! Device sessions
//!
//! A session is an authenticated channel to one switch. The orchestrator owns
//! at most one open session at a time and always closes it with
//! [`DeviceSession::disconnect`] before waiting on the device.

pub mod ssh;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::UpgradeError;
use crate::models::device::Device;

/// Result of a command executed on a device.
///
/// Failures are values: a command that could not be run at all is reported
/// with `success == false` and `error` set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Command completed and the device accepted it
    pub success: bool,

    /// Raw output
    pub output: String,

    /// Error detail when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: Some(error.into()),
        }
    }

    /// Convert to a `Result`, treating an unsuccessful result as a command error
    pub fn into_result(self, command: &str) -> Result<String, UpgradeError> {
        if self.success {
            Ok(self.output)
        } else {
            let detail = self
                .error
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "command failed".to_string());
            Err(UpgradeError::Command(format!("`{}`: {}", command, detail)))
        }
    }
}

/// Reference to a file uploaded to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub path: String,
}

/// An open, authenticated session to a device
#[async_trait]
pub trait DeviceSession: Send {
    /// Run a single command
    async fn run(&mut self, command: &str) -> CommandResult;

    /// Upload a local file into `remote_path` on the device
    async fn upload(&mut self, local: &Path, remote_path: &str) -> Result<RemoteFile, UpgradeError>;

    /// Feed a script to an interactive shell, line by line
    async fn apply_config(&mut self, script: &str) -> CommandResult;

    /// Close the session. Never fails; errors are only logged.
    async fn disconnect(&mut self);
}

/// Opens device sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        device: &Device,
        timeout: Duration,
    ) -> Result<Box<dyn DeviceSession>, UpgradeError>;
}
