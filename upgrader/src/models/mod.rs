//! Data models

pub mod device;
pub mod request;
