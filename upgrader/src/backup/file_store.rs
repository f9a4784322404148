//! Directory-backed backup store

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::backup::{BackupRef, BackupStore};
use crate::errors::UpgradeError;
use crate::models::device::Device;
use crate::utils::{sanitize_file_component, sha256_hash, timestamp_slug};

/// Sidecar written next to every snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub hostname: String,
    pub address: String,
    pub created_at: DateTime<Local>,
    pub sha256: String,
    pub size: usize,
}

/// Stores snapshots as `backup_<hostname>_<timestamp>_<suffix>.txt` files.
///
/// The random suffix keeps names unique, so concurrent runs never contend
/// for the same path.
#[derive(Debug, Clone)]
pub struct FileBackupStore {
    dir: PathBuf,
}

impl FileBackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the snapshot behind a reference
    pub fn snapshot_path(&self, reference: &BackupRef) -> PathBuf {
        self.dir.join(format!("{}.txt", reference.as_str()))
    }

    fn metadata_path(&self, reference: &BackupRef) -> PathBuf {
        self.dir.join(format!("{}.json", reference.as_str()))
    }

    async fn write_new(path: &Path, contents: &[u8]) -> Result<(), UpgradeError> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl BackupStore for FileBackupStore {
    async fn save(&self, device: &Device, content: &str) -> Result<BackupRef, UpgradeError> {
        let created_at = Local::now();
        let reference = BackupRef::new(format!(
            "backup_{}_{}_{}",
            sanitize_file_component(&device.hostname),
            timestamp_slug(created_at),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        ));

        let metadata = BackupMetadata {
            hostname: device.hostname.clone(),
            address: device.address.clone(),
            created_at,
            sha256: sha256_hash(content.as_bytes()),
            size: content.len(),
        };

        let stored: Result<(), UpgradeError> = async {
            fs::create_dir_all(&self.dir).await?;
            Self::write_new(&self.snapshot_path(&reference), content.as_bytes()).await?;
            let meta = serde_json::to_vec_pretty(&metadata)?;
            Self::write_new(&self.metadata_path(&reference), &meta).await
        }
        .await;

        stored.map_err(|e| UpgradeError::Store(format!("failed to save backup: {}", e)))?;

        info!(
            "Configuration backed up to {}",
            self.snapshot_path(&reference).display()
        );
        Ok(reference)
    }

    async fn read(&self, reference: &BackupRef) -> Result<String, UpgradeError> {
        let path = self.snapshot_path(reference);
        let content = fs::read_to_string(&path).await.map_err(|e| {
            UpgradeError::Store(format!("failed to read {}: {}", path.display(), e))
        })?;

        let meta_path = self.metadata_path(reference);
        let raw = fs::read(&meta_path).await.map_err(|e| {
            UpgradeError::Store(format!("failed to read {}: {}", meta_path.display(), e))
        })?;
        let metadata: BackupMetadata = serde_json::from_slice(&raw)
            .map_err(|e| UpgradeError::Store(format!("corrupt backup metadata: {}", e)))?;

        let digest = sha256_hash(content.as_bytes());
        if digest != metadata.sha256 {
            return Err(UpgradeError::Store(format!(
                "backup {} failed integrity check (expected {}, got {})",
                reference, metadata.sha256, digest
            )));
        }

        Ok(content)
    }
}
