//! Post-install verification

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::{error, info, warn};

use crate::errors::UpgradeError;
use crate::models::request::UpgradeRequest;
use crate::upgrade::orchestrator::{resume_after_close, Orchestrator, RunContext};

impl Orchestrator {
    /// Wait for the reboot, then poll the running version.
    ///
    /// Returns the verified version, or the reason verification gave up.
    /// Every attempt closes its session before the retry delay.
    pub(super) async fn verify<S, F>(
        &self,
        run: &mut RunContext<'_>,
        sleep_fn: &S,
    ) -> Result<String, String>
    where
        S: Fn(Duration) -> F + Send + Sync,
        F: Future<Output = ()> + Send,
    {
        let request = run.request;
        let max_retries = request.max_retries;

        info!(
            "Waiting {:?} for {} to reboot...",
            self.config.reboot_grace,
            run.hostname()
        );
        sleep_fn(self.config.reboot_grace).await;

        let mut last_failure = String::from("no verification attempt was made");
        for attempt in 1..=max_retries {
            run.session.record_verification_attempt()?;

            match self.read_version(request).await {
                Ok(version) if version == request.target_version => {
                    info!(
                        "Upgrade successful: {} is now running {} (attempt {}/{})",
                        run.hostname(),
                        version,
                        attempt,
                        max_retries
                    );
                    return Ok(version);
                }
                Ok(version) => {
                    let mismatch = UpgradeError::VersionMismatch {
                        expected: request.target_version.clone(),
                        found: version,
                    };
                    warn!("{} (attempt {}/{})", mismatch, attempt, max_retries);
                    last_failure = mismatch.to_string();
                }
                Err(e) => {
                    warn!(
                        "Verification attempt {}/{} on {} failed: {}",
                        attempt,
                        max_retries,
                        run.hostname(),
                        e
                    );
                    last_failure = e.to_string();
                }
            }

            if attempt < max_retries {
                info!(
                    "Retry {}/{}. Waiting {:?}...",
                    attempt, max_retries, request.retry_delay
                );
                sleep_fn(request.retry_delay).await;
            }
        }

        error!(
            "Failed to verify upgrade on {} after {} attempts",
            run.hostname(),
            max_retries
        );
        Err(format!(
            "verification failed after {} attempts: {}",
            max_retries, last_failure
        ))
    }

    /// Connect, read the version and disconnect, whatever the result
    async fn read_version(&self, request: &UpgradeRequest) -> Result<String, UpgradeError> {
        let mut session = self
            .connector
            .connect(&request.device, self.config.connect_timeout)
            .await?;
        let version = AssertUnwindSafe(self.adapter.get_version(session.as_mut()))
            .catch_unwind()
            .await;
        session.disconnect().await;
        resume_after_close(version)
    }
}
