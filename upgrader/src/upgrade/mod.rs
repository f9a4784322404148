//! Firmware upgrade orchestration

pub mod config;
pub mod events;
pub mod fsm;
pub mod orchestrator;
pub mod outcome;
mod rollback;
mod verify;

pub use config::UpgradeConfig;
pub use orchestrator::Orchestrator;
pub use outcome::{UpgradeOutcome, UpgradeReport};
