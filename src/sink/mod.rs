//! # Sink Module
//!
//! Remote destinations for forwarded records.
//!
//! This module handles:
//! - The `Sink` capability shared by every destination
//! - Publishing to an IoT message broker over MQTT (`mqtt`)
//! - Pushing to a spreadsheet-style HTTP endpoint (`http`)
//! - Building the configured sink at startup
//!
//! Sinks never retry internally; the forwarding engine owns retry policy.

pub mod http;
pub mod mqtt;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::SinkConfig;
use crate::error::Result;
use crate::record::Record;

/// Delivery failure reported by a sink
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The destination could not be reached or did not answer in time
    #[error("connectivity failure: {0}")]
    Connectivity(String),

    /// The destination answered and refused the record
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Trait for remote record destinations
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Deliver one record, returning only once delivery is confirmed
    async fn send(&self, record: &Record) -> std::result::Result<(), SinkError>;
}

/// Build the sink selected by configuration
pub fn from_config(config: &SinkConfig) -> Result<Box<dyn Sink>> {
    match config {
        SinkConfig::Mqtt(mqtt_config) => Ok(Box::new(mqtt::MqttSink::connect(mqtt_config)?)),
        SinkConfig::Http(http_config) => Ok(Box::new(http::HttpSink::new(http_config)?)),
    }
}
