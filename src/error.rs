//! # Error Types
//!
//! Custom error types for the solar gateway using `thiserror`.

use std::path::PathBuf;
use thiserror::Error;

use crate::sink::SinkError;

/// Main error type for the solar gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A log line that could not be decoded into a record
    #[error("Malformed log line: {0}")]
    MalformedLine(String),

    /// An expected partition file is missing
    #[error("Log file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// The last uploaded path does not match `<data>/YYYY/MM/DD/<topic>`
    #[error("Cannot parse upload cursor from {}: {reason}", path.display())]
    CursorParse { path: PathBuf, reason: String },

    /// Metadata file could not be read or written
    #[error("Metadata I/O error on {}: {source}", path.display())]
    MetadataIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The sink did not confirm delivery
    #[error("Sink delivery failed: {0}")]
    SinkDelivery(#[from] SinkError),

    /// A partition directory could not be created
    #[error("Failed to create directory {}: {source}", path.display())]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// MQTT client errors
    #[error("MQTT error: {0}")]
    Mqtt(String),
}

impl GatewayError {
    /// Whether the forwarder should wait and retry on the next cycle.
    ///
    /// Structural errors (cursor drift, unusable directories, bad config)
    /// return `false` and are surfaced to the process supervisor.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            GatewayError::CursorParse { .. }
                | GatewayError::DirectoryCreation { .. }
                | GatewayError::Config(_)
        )
    }
}

impl From<rumqttc::ClientError> for GatewayError {
    fn from(e: rumqttc::ClientError) -> Self {
        GatewayError::Mqtt(e.to_string())
    }
}

/// Result type alias for the solar gateway
pub type Result<T> = std::result::Result<T, GatewayError>;
