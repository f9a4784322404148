//! Configuration backups

pub mod file_store;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::UpgradeError;
use crate::models::device::Device;

pub use file_store::FileBackupStore;

/// Opaque handle to a stored configuration snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupRef(String);

impl BackupRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stores configuration snapshots.
///
/// Implementations must accept concurrent `save` calls for different devices
/// without external locking.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Persist a snapshot of `device`'s configuration
    async fn save(&self, device: &Device, content: &str) -> Result<BackupRef, UpgradeError>;

    /// Load a snapshot saved earlier
    async fn read(&self, reference: &BackupRef) -> Result<String, UpgradeError>;
}
