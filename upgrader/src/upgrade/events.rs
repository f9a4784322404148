//! Transition records and diagnostics sinks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::upgrade::fsm::UpgradeState;

/// One state transition of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: UpgradeState,
    pub state: UpgradeState,
    pub success: bool,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// A transition tagged with the run and device it belongs to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub run_id: String,
    pub hostname: String,
    pub record: TransitionRecord,
}

/// Receives every transition as it happens
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, event: &TransitionEvent);
}

/// Emits transitions as structured tracing events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn record(&self, event: &TransitionEvent) {
        let record = &event.record;
        match (record.state, record.success) {
            (UpgradeState::RollbackFailed, _) => error!(
                run_id = %event.run_id,
                hostname = %event.hostname,
                state = record.state.name(),
                success = record.success,
                "ROLLBACK FAILED, operator intervention required: {}",
                record.detail
            ),
            (_, true) => info!(
                run_id = %event.run_id,
                hostname = %event.hostname,
                state = record.state.name(),
                success = record.success,
                "{} -> {}: {}",
                record.from,
                record.state,
                record.detail
            ),
            (_, false) => warn!(
                run_id = %event.run_id,
                hostname = %event.hostname,
                state = record.state.name(),
                success = record.success,
                "{} -> {}: {}",
                record.from,
                record.state,
                record.detail
            ),
        }
    }
}

/// Forwards transitions to a channel, e.g. for a status API or UI
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TransitionEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its stream
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransitionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DiagnosticsSink for ChannelSink {
    fn record(&self, event: &TransitionEvent) {
        // A dropped receiver only means nobody is listening any more
        let _ = self.tx.send(event.clone());
    }
}

/// Sends every transition to several sinks
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn DiagnosticsSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl DiagnosticsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl DiagnosticsSink for FanoutSink {
    fn record(&self, event: &TransitionEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}
