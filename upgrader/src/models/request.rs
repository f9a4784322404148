//! Upgrade request

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::device::Device;
use crate::upgrade::config::{DEFAULT_INSTALL_TIMEOUT, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};

/// Default directory on the switch where firmware images are uploaded
pub const DEFAULT_REMOTE_PATH: &str = "/flash/";

/// Immutable input to a single upgrade run
#[derive(Debug)]
pub struct UpgradeRequest {
    /// Target device
    pub device: Device,

    /// Local firmware image
    pub firmware: PathBuf,

    /// Version the device must report after the upgrade
    pub target_version: String,

    /// Directory on the device the image is uploaded to
    pub remote_path: String,

    /// Verification attempts after the reboot grace interval
    pub max_retries: u32,

    /// Delay between verification attempts
    pub retry_delay: Duration,

    /// Upper bound for the install command
    pub install_timeout: Duration,
}

impl UpgradeRequest {
    /// Build a request using the default remote path and retry policy
    pub fn new(device: Device, firmware: impl Into<PathBuf>, target_version: impl Into<String>) -> Self {
        Self {
            device,
            firmware: firmware.into(),
            target_version: target_version.into(),
            remote_path: DEFAULT_REMOTE_PATH.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
        }
    }
}

/// Join a remote directory with the basename of a local artifact
pub fn remote_file_path(remote_dir: &str, local: &Path) -> String {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if remote_dir.is_empty() || remote_dir.ends_with('/') || remote_dir.ends_with(':') {
        format!("{}{}", remote_dir, name)
    } else {
        format!("{}/{}", remote_dir, name)
    }
}
