//! Upgrade orchestrator
//!
//! Drives one device through the upgrade state machine. Everything before
//! `Installed` aborts cleanly on the first failure; everything after it ends
//! in either a verified upgrade or an attempted rollback.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backup::BackupStore;
use crate::errors::UpgradeError;
use crate::models::request::UpgradeRequest;
use crate::session::{Connector, DeviceSession};
use crate::upgrade::config::{validate_request, UpgradeConfig};
use crate::upgrade::events::{DiagnosticsSink, TracingSink, TransitionEvent};
use crate::upgrade::fsm::{UpgradeEvent, UpgradeSession, UpgradeState};
use crate::upgrade::outcome::{UpgradeOutcome, UpgradeReport};
use crate::vendor::VendorAdapter;

/// Drives upgrade runs against one kind of device.
///
/// An orchestrator holds no per-run state, so one instance can serve many
/// concurrent runs (one per device), each in its own task.
pub struct Orchestrator {
    pub(super) connector: Arc<dyn Connector>,
    pub(super) adapter: Arc<dyn VendorAdapter>,
    pub(super) backups: Arc<dyn BackupStore>,
    pub(super) sink: Arc<dyn DiagnosticsSink>,
    pub(super) config: UpgradeConfig,
    cancel: Option<watch::Receiver<bool>>,
}

/// State of one run in progress
pub(super) struct RunContext<'a> {
    pub(super) id: String,
    pub(super) request: &'a UpgradeRequest,
    pub(super) session: UpgradeSession,
    pub(super) rollback_attempted: bool,
    started_at: DateTime<Utc>,
    sink: &'a dyn DiagnosticsSink,
}

impl<'a> RunContext<'a> {
    fn new(request: &'a UpgradeRequest, sink: &'a dyn DiagnosticsSink) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request,
            session: UpgradeSession::new(request.target_version.clone()),
            rollback_attempted: false,
            started_at: Utc::now(),
            sink,
        }
    }

    pub(super) fn hostname(&self) -> &str {
        &self.request.device.hostname
    }

    /// Apply an event and publish the resulting transition
    pub(super) fn apply(&mut self, event: UpgradeEvent) {
        match self.session.process(event) {
            Ok(record) => {
                let event = TransitionEvent {
                    run_id: self.id.clone(),
                    hostname: self.request.device.hostname.clone(),
                    record: record.clone(),
                };
                self.sink.record(&event);
            }
            Err(e) => error!("[{}] {}", self.request.device.hostname, e),
        }
    }

    fn into_report(self) -> UpgradeReport {
        let outcome = self.session.outcome().unwrap_or_else(|| UpgradeOutcome::FailedNoChange {
            reason: format!("run ended in non-terminal state {}", self.session.state()),
        });

        UpgradeReport {
            run_id: self.id,
            device: self.request.device.summary(),
            target_version: self.request.target_version.clone(),
            outcome,
            verification_attempts: self.session.verification_attempts(),
            rollback_attempted: self.rollback_attempted,
            backup: self.session.backup_reference().cloned(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            transitions: self.session.log().to_vec(),
        }
    }
}

impl Orchestrator {
    pub fn new(
        connector: Arc<dyn Connector>,
        adapter: Arc<dyn VendorAdapter>,
        backups: Arc<dyn BackupStore>,
        config: UpgradeConfig,
    ) -> Self {
        Self {
            connector,
            adapter,
            backups,
            sink: Arc::new(TracingSink),
            config,
            cancel: None,
        }
    }

    /// Send transitions to `sink` instead of the tracing log
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Stop runs at the next step boundary once `cancel` turns true
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Run an upgrade, waiting with `tokio::time::sleep`
    pub async fn run_upgrade(&self, request: &UpgradeRequest) -> UpgradeReport {
        self.run_upgrade_with(request, tokio::time::sleep).await
    }

    /// Run an upgrade, using `sleep_fn` for every reboot and retry wait
    pub async fn run_upgrade_with<S, F>(&self, request: &UpgradeRequest, sleep_fn: S) -> UpgradeReport
    where
        S: Fn(Duration) -> F + Send + Sync,
        F: Future<Output = ()> + Send,
    {
        let mut run = RunContext::new(request, self.sink.as_ref());
        info!(
            "Starting firmware upgrade on {} ({}) to {} [run {}]",
            run.hostname(),
            request.device.address,
            request.target_version,
            run.id
        );

        match validate_request(request).and_then(|_| self.config.validate()) {
            Ok(()) => self.pre_install(&mut run).await,
            Err(e) => run.apply(UpgradeEvent::Abort(format!("invalid request: {}", e))),
        }

        if run.session.state() == UpgradeState::Installed {
            self.post_install(&mut run, &sleep_fn).await;
        }

        let report = run.into_report();
        if report.outcome.is_fatal() {
            error!(
                outcome = report.outcome.kind(),
                "{}: {}",
                report.device.hostname,
                report.outcome
            );
        } else {
            info!(
                outcome = report.outcome.kind(),
                "{}: {}",
                report.device.hostname,
                report.outcome
            );
        }
        report
    }

    /// Version check, backup, transfer and install over a single session
    async fn pre_install(&self, run: &mut RunContext<'_>) {
        if self.abort_if_cancelled(run, "connecting") {
            return;
        }

        let mut session = match self
            .connector
            .connect(&run.request.device, self.config.connect_timeout)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                run.apply(UpgradeEvent::Abort(format!(
                    "could not connect to {}: {}",
                    run.hostname(),
                    e
                )));
                return;
            }
        };

        let stepped = AssertUnwindSafe(self.pre_install_steps(run, session.as_mut()))
            .catch_unwind()
            .await;
        session.disconnect().await;
        if let Err(panic) = stepped {
            run.apply(UpgradeEvent::Abort(format!(
                "upgrade aborted unexpectedly: {}",
                panic_message(panic.as_ref())
            )));
        }
    }

    async fn pre_install_steps(&self, run: &mut RunContext<'_>, session: &mut dyn DeviceSession) {
        let request = run.request;

        let current = match self.adapter.get_version(session).await {
            Ok(version) => version,
            Err(e) => {
                run.apply(UpgradeEvent::Abort(format!(
                    "could not determine current version: {}",
                    e
                )));
                return;
            }
        };
        info!("Current version on {}: {}", run.hostname(), current);
        run.apply(UpgradeEvent::VersionRead(current.clone()));

        if current == request.target_version {
            run.apply(UpgradeEvent::VersionMatches);
            return;
        }

        if self.abort_if_cancelled(run, "backup") {
            return;
        }
        let config = match self.adapter.backup_config(session).await {
            Ok(config) => config,
            Err(e) => {
                run.apply(UpgradeEvent::BackupFailed(e.to_string()));
                return;
            }
        };
        match self.backups.save(&request.device, &config).await {
            Ok(reference) => run.apply(UpgradeEvent::BackupSaved(reference)),
            Err(e) => {
                run.apply(UpgradeEvent::BackupFailed(e.to_string()));
                return;
            }
        }

        if self.abort_if_cancelled(run, "transfer") {
            return;
        }
        let image = match self
            .adapter
            .upload_firmware(session, &request.firmware, &request.remote_path)
            .await
        {
            Ok(image) => image,
            Err(e) => {
                run.apply(UpgradeEvent::TransferFailed(e.to_string()));
                return;
            }
        };
        info!("Firmware transferred to {}:{}", run.hostname(), image.path);
        run.apply(UpgradeEvent::TransferSucceeded(image.clone()));

        if self.abort_if_cancelled(run, "install") {
            return;
        }
        let installed =
            tokio::time::timeout(request.install_timeout, self.adapter.install(session, &image)).await;
        match installed {
            Ok(Ok(output)) => run.apply(UpgradeEvent::InstallAccepted(output)),
            Ok(Err(e)) => run.apply(UpgradeEvent::InstallFailed(e.to_string())),
            Err(_) => run.apply(UpgradeEvent::InstallFailed(format!(
                "install command did not return within {:?}",
                request.install_timeout
            ))),
        }
    }

    fn abort_if_cancelled(&self, run: &mut RunContext<'_>, step: &str) -> bool {
        if self.cancel_requested() {
            let reason = UpgradeError::Cancelled(format!("before {}", step));
            run.apply(UpgradeEvent::Abort(reason.to_string()));
            true
        } else {
            false
        }
    }

    /// Verification, then rollback if the device never reports the target.
    /// Panics in either phase are contained and routed like any other failure.
    async fn post_install<S, F>(&self, run: &mut RunContext<'_>, sleep_fn: &S)
    where
        S: Fn(Duration) -> F + Send + Sync,
        F: Future<Output = ()> + Send,
    {
        if self.cancel_requested() {
            warn!(
                "Cancellation requested after install on {}; continuing until the upgrade is verified or rolled back",
                run.hostname()
            );
        }

        let verified = AssertUnwindSafe(self.verify(run, sleep_fn))
            .catch_unwind()
            .await;
        match verified {
            Ok(Ok(version)) => run.apply(UpgradeEvent::Verified(version)),
            Ok(Err(reason)) => run.apply(UpgradeEvent::VerificationExhausted(reason)),
            Err(panic) => run.apply(UpgradeEvent::Fault(format!(
                "verification aborted unexpectedly: {}",
                panic_message(panic.as_ref())
            ))),
        }

        if run.session.state() != UpgradeState::RollbackPending {
            return;
        }

        run.rollback_attempted = true;
        let rolled_back = AssertUnwindSafe(self.rollback(run, sleep_fn))
            .catch_unwind()
            .await;
        match rolled_back {
            Ok(Ok(())) => run.apply(UpgradeEvent::RollbackCompleted),
            Ok(Err(e)) => run.apply(UpgradeEvent::RollbackError(e.to_string())),
            Err(panic) => run.apply(UpgradeEvent::RollbackError(format!(
                "rollback aborted unexpectedly: {}",
                panic_message(panic.as_ref())
            ))),
        }
        debug!("Rollback finished on {} in state {}", run.hostname(), run.session.state());
    }
}

/// Unwrap the result of a session call guarded with `catch_unwind`,
/// re-raising the panic once the caller has closed the session
pub(super) fn resume_after_close<T>(result: std::thread::Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
