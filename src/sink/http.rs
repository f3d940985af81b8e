//! HTTP push sink for spreadsheet-style endpoints

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use super::{Sink, SinkError};
use crate::config::HttpSinkConfig;
use crate::error::Result;
use crate::record::Record;

/// POSTs each record as a JSON object to a fixed URL
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(config: &HttpSinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Map a response status to a delivery outcome
///
/// 2xx is success, 4xx means the endpoint refused the record, anything else
/// is treated as the endpoint being unavailable.
fn classify_status(status: StatusCode) -> std::result::Result<(), SinkError> {
    if status.is_success() {
        Ok(())
    } else if status.is_client_error() {
        Err(SinkError::Rejected(format!("HTTP {}", status)))
    } else {
        Err(SinkError::Connectivity(format!("HTTP {}", status)))
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, record: &Record) -> std::result::Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .json(&record.to_json())
            .send()
            .await
            .map_err(|e| SinkError::Connectivity(e.to_string()))?;

        classify_status(response.status())?;
        debug!("Pushed record to {}", self.url);
        Ok(())
    }
}
