//! File backup store tests

use std::path::PathBuf;

use switch_upgrade::backup::{BackupRef, BackupStore, FileBackupStore};
use switch_upgrade::errors::UpgradeError;
use switch_upgrade::models::device::{Credentials, Device};

use crate::support::RUNNING_CONFIG;

struct TempDir(PathBuf);

impl TempDir {
    fn new() -> Self {
        Self(std::env::temp_dir().join(format!("switch-upgrade-test-{}", uuid::Uuid::new_v4())))
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn device() -> Device {
    Device::new("core/sw1", "10.0.0.1", "c9300", Credentials::key_based("admin"))
}

#[tokio::test]
async fn test_save_then_read() {
    let dir = TempDir::new();
    let store = FileBackupStore::new(&dir.0);

    let reference = store.save(&device(), RUNNING_CONFIG).await.unwrap();

    assert!(reference.as_str().starts_with("backup_core_sw1_"));
    assert!(store.snapshot_path(&reference).starts_with(&dir.0));
    assert_eq!(store.read(&reference).await.unwrap(), RUNNING_CONFIG);
}

#[tokio::test]
async fn test_saves_never_overwrite() {
    let dir = TempDir::new();
    let store = FileBackupStore::new(&dir.0);

    let first = store.save(&device(), "config one").await.unwrap();
    let second = store.save(&device(), "config two").await.unwrap();

    assert_ne!(first, second);
    assert_eq!(store.read(&first).await.unwrap(), "config one");
    assert_eq!(store.read(&second).await.unwrap(), "config two");
}

#[tokio::test]
async fn test_tampered_snapshot_is_rejected() {
    let dir = TempDir::new();
    let store = FileBackupStore::new(&dir.0);
    let reference = store.save(&device(), RUNNING_CONFIG).await.unwrap();

    tokio::fs::write(store.snapshot_path(&reference), "hostname evil\n")
        .await
        .unwrap();

    match store.read(&reference).await {
        Err(UpgradeError::Store(message)) => assert!(message.contains("integrity")),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_snapshot() {
    let dir = TempDir::new();
    let store = FileBackupStore::new(&dir.0);

    let result = store.read(&BackupRef::new("backup_nowhere")).await;
    assert!(matches!(result, Err(UpgradeError::Store(_))));
}
