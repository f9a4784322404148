//! Device identity and credentials

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Credentials used to open a device session
#[derive(Debug)]
pub struct Credentials {
    /// Login user
    pub username: String,

    /// Password, when not using key-based authentication
    pub password: Option<SecretString>,
}

impl Credentials {
    /// Credentials relying on an SSH key or agent
    pub fn key_based(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: None,
        }
    }

    /// Credentials with a password
    pub fn with_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(SecretString::from(password.into())),
        }
    }
}

/// A switch targeted by an upgrade run. Immutable for the duration of the run.
#[derive(Debug)]
pub struct Device {
    /// Hostname, used for naming and logs
    pub hostname: String,

    /// Management address to connect to
    pub address: String,

    /// Model tag used to select the vendor adapter (e.g. "c9300", "ex4300")
    pub model: String,

    /// Login credentials
    pub credentials: Credentials,
}

impl Device {
    pub fn new(
        hostname: impl Into<String>,
        address: impl Into<String>,
        model: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            address: address.into(),
            model: model.into(),
            credentials,
        }
    }

    /// Identity without credentials, safe to log or serialize
    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            hostname: self.hostname.clone(),
            address: self.address.clone(),
            model: self.model.clone(),
        }
    }
}

/// Serializable device identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub hostname: String,
    pub address: String,
    pub model: String,
}
