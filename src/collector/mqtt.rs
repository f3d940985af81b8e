//! MQTT subscriber collector
//!
//! Every message received on a subscribed topic is appended to that topic's
//! partition for today. Payloads may be a flat JSON object or a log line.

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::MqttCollectorConfig;
use crate::error::{GatewayError, Result};
use crate::record::{codec, is_valid_field_name, Record, Value};
use crate::storage::LogStore;

/// Requests buffered between the client handle and the event loop
const CLIENT_CAPACITY: usize = 32;

/// Pause after an event loop error before polling again
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Local broker subscriber
pub struct MqttCollector {
    options: MqttOptions,
    topics: Vec<String>,
    store: LogStore,
}

impl MqttCollector {
    pub fn new(config: &MqttCollectorConfig, store: LogStore) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        Self {
            options,
            topics: config.topics.clone(),
            store,
        }
    }

    /// Receive messages until `shutdown` flips to `true`.
    ///
    /// Subscriptions are (re)issued on every CONNACK so a broker restart does
    /// not silently stop collection.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Mqtt` if a subscribe request cannot be queued
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), CLIENT_CAPACITY);
        let (host, port) = self.options.broker_address();
        info!("MQTT collector connecting to {}:{}", host, port);

        while !*shutdown.borrow() {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        for topic in &self.topics {
                            client.subscribe(topic, QoS::AtLeastOnce).await?;
                            info!("Subscribed to {}", topic);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_message(&publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT collector connection error: {}", e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = client.try_disconnect() {
            debug!("MQTT collector disconnect: {}", e);
        }
        info!("MQTT collector stopped");
        Ok(())
    }

    fn handle_message(&self, topic: &str, payload: &Bytes) {
        if topic.split('/').any(|part| part == "..") {
            warn!("Ignoring message on unsafe topic {:?}", topic);
            return;
        }

        match record_from_payload(payload) {
            Ok(record) => match self.store.append(topic, &record) {
                Ok(path) => debug!("Stored {} field(s) in {}", record.len(), path.display()),
                Err(e) => error!("Failed to store message from {}: {}", topic, e),
            },
            Err(e) => warn!("Dropping message on {}: {}", topic, e),
        }
    }
}

/// Turn a message payload into a record.
///
/// A payload starting with `{` must be a JSON object whose scalar members
/// become fields; nested members are dropped. Anything else is decoded as a
/// log line.
///
/// # Errors
///
/// Returns `GatewayError::MalformedLine` for empty, non-UTF-8 or otherwise
/// undecodable payloads
pub fn record_from_payload(payload: &[u8]) -> Result<Record> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| GatewayError::MalformedLine(format!("payload is not UTF-8: {}", e)))?
        .trim();

    if text.is_empty() {
        return Err(GatewayError::MalformedLine("empty payload".into()));
    }

    let record = if text.starts_with('{') {
        let json: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| GatewayError::MalformedLine(format!("invalid JSON: {}", e)))?;
        let serde_json::Value::Object(map) = json else {
            return Err(GatewayError::MalformedLine("JSON payload is not an object".into()));
        };

        let mut record = Record::new();
        for (key, value) in &map {
            if !is_valid_field_name(key) {
                warn!("Skipping field with unusable name {:?}", key);
                continue;
            }
            match Value::from_json(value) {
                Some(value) => record.insert(key.as_str(), value),
                None => debug!("Skipping non-scalar field {}", key),
            }
        }
        record
    } else {
        codec::decode(text)?
    };

    if record.is_empty() {
        return Err(GatewayError::MalformedLine("payload has no fields".into()));
    }
    Ok(record)
}
