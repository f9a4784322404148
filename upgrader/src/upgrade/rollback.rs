//! Rollback to the previous image and configuration

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::{info, warn};

use crate::errors::UpgradeError;
use crate::upgrade::orchestrator::{resume_after_close, Orchestrator, RunContext};

impl Orchestrator {
    /// Boot the previous image, then replay the saved configuration if a
    /// backup exists. Any failure is a rollback failure.
    pub(super) async fn rollback<S, F>(
        &self,
        run: &mut RunContext<'_>,
        sleep_fn: &S,
    ) -> Result<(), UpgradeError>
    where
        S: Fn(Duration) -> F + Send + Sync,
        F: Future<Output = ()> + Send,
    {
        let device = &run.request.device;
        let backup = run.session.backup_reference().cloned();

        if backup.is_none() && !self.adapter.supports_previous_image() {
            return Err(UpgradeError::Rollback(
                "no configuration backup and no previous image to boot".to_string(),
            ));
        }

        warn!("Rolling back {} to its previous firmware", device.hostname);

        let mut session = self
            .connector
            .connect(device, self.config.connect_timeout)
            .await
            .map_err(|e| UpgradeError::Rollback(format!("could not connect to start rollback: {}", e)))?;
        let reverted = AssertUnwindSafe(self.adapter.reboot_previous(session.as_mut()))
            .catch_unwind()
            .await;
        session.disconnect().await;
        resume_after_close(reverted)
            .map_err(|e| UpgradeError::Rollback(format!("image revert failed: {}", e)))?;
        info!("Reboot into previous image initiated on {}", device.hostname);

        let Some(reference) = backup else {
            return Ok(());
        };

        info!(
            "Waiting {:?} for {} to reboot before restoring configuration...",
            self.config.reboot_grace, device.hostname
        );
        sleep_fn(self.config.reboot_grace).await;

        let config = self.backups.read(&reference).await.map_err(|e| {
            UpgradeError::Rollback(format!("could not load backup {}: {}", reference, e))
        })?;

        let mut session = self
            .connector
            .connect(device, self.config.connect_timeout)
            .await
            .map_err(|e| {
                UpgradeError::Rollback(format!(
                    "could not connect after reboot to restore configuration: {}",
                    e
                ))
            })?;
        let restored = AssertUnwindSafe(self.adapter.restore_config(session.as_mut(), &config))
            .catch_unwind()
            .await;
        session.disconnect().await;
        resume_after_close(restored).map_err(|e| {
            UpgradeError::Rollback(format!("configuration restore failed: {}", e))
        })?;

        info!("Configuration restored on {}", device.hostname);
        Ok(())
    }
}
