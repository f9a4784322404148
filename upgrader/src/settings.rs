//! Settings file management

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::UpgradeError;
use crate::logs::LogLevel;
use crate::session::ssh::SshOptions;
use crate::upgrade::config::{
    UpgradeConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_INSTALL_TIMEOUT, DEFAULT_MAX_RETRIES,
    DEFAULT_REBOOT_GRACE, DEFAULT_RETRY_DELAY,
};

/// Tool settings, read from an optional JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Directory for per-run log files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// JSON log lines on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Directory for configuration backups
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Upgrade timing
    #[serde(default)]
    pub upgrade: UpgradeSettings,

    /// SSH transport
    #[serde(default)]
    pub ssh: SshSettings,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: default_log_dir(),
            log_json: false,
            backup_dir: default_backup_dir(),
            upgrade: UpgradeSettings::default(),
            ssh: SshSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file
    pub async fn load(path: &Path) -> Result<Self, UpgradeError> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            UpgradeError::Config(format!("unable to read {}: {}", path.display(), e))
        })?;
        let settings: Settings = serde_json::from_str(&contents)?;
        settings.upgrade_config().validate()?;
        Ok(settings)
    }

    pub fn upgrade_config(&self) -> UpgradeConfig {
        UpgradeConfig {
            reboot_grace: Duration::from_secs(self.upgrade.reboot_grace_secs),
            connect_timeout: Duration::from_secs(self.upgrade.connect_timeout_secs),
        }
    }

    pub fn ssh_options(&self) -> SshOptions {
        let defaults = SshOptions::default();
        SshOptions {
            ssh_program: self.ssh.program.clone(),
            port: self.ssh.port,
            identity_file: self.ssh.identity_file.clone(),
            strict_host_key_checking: self.ssh.strict_host_key_checking.clone(),
            control_dir: self.ssh.control_dir.clone().unwrap_or(defaults.control_dir),
            command_timeout: Duration::from_secs(self.ssh.command_timeout_secs),
        }
    }
}

/// Upgrade timing settings, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeSettings {
    #[serde(default = "default_reboot_grace")]
    pub reboot_grace_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
}

fn default_reboot_grace() -> u64 {
    DEFAULT_REBOOT_GRACE.as_secs()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY.as_secs()
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_install_timeout() -> u64 {
    DEFAULT_INSTALL_TIMEOUT.as_secs()
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            reboot_grace_secs: default_reboot_grace(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            connect_timeout_secs: default_connect_timeout(),
            install_timeout_secs: default_install_timeout(),
        }
    }
}

/// SSH transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    /// `ssh` binary, resolved through `PATH` unless absolute
    #[serde(default = "default_ssh_program")]
    pub program: PathBuf,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Private key for key-based authentication
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    #[serde(default = "default_host_key_checking")]
    pub strict_host_key_checking: String,

    /// Where control sockets live. Defaults to a directory under the system temp dir.
    #[serde(default)]
    pub control_dir: Option<PathBuf>,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_ssh_program() -> PathBuf {
    PathBuf::from("ssh")
}

fn default_ssh_port() -> u16 {
    22
}

fn default_host_key_checking() -> String {
    "accept-new".to_string()
}

fn default_command_timeout() -> u64 {
    DEFAULT_INSTALL_TIMEOUT.as_secs()
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            program: default_ssh_program(),
            port: default_ssh_port(),
            identity_file: None,
            strict_host_key_checking: default_host_key_checking(),
            control_dir: None,
            command_timeout_secs: default_command_timeout(),
        }
    }
}
