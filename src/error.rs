//! Error types for the MQTT TLS client
//!
//! Each concern has its own error enum; [`ClientError`] composes them for the
//! setup phase so the CLI entry point can decide how to terminate.

use crate::config::ConfigError;
use crate::tls::TlsError;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Errors surfaced to the CLI entry point
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS setup error: {0}")]
    Tls(#[from] TlsError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// True for failures that happen before any connection is attempted
    pub fn is_setup_error(&self) -> bool {
        matches!(self, ClientError::Config(_) | ClientError::Tls(_))
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
