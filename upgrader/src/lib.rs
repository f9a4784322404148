//! Switch firmware upgrade library
//!
//! Orchestrates a single-device firmware upgrade: version check, config
//! backup, image transfer, install, post-reboot verification and automatic
//! rollback.

pub mod backup;
pub mod errors;
pub mod logs;
pub mod models;
pub mod session;
pub mod settings;
pub mod upgrade;
pub mod utils;
pub mod vendor;
