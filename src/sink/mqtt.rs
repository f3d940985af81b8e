//! MQTT broker sink
//!
//! Publishes each record as a JSON object at QoS 1. Delivery counts as
//! confirmed only once the broker's PUBACK for that very publish comes back.
//! The event loop runs in a background task and reports the packet id of
//! every fresh publish and every PUBACK to `send` over a channel.
//!
//! Publish requests reach the event loop in order, so the n-th fresh publish
//! it reports belongs to the n-th `publish` call. Retransmissions reuse a
//! packet id that is still awaiting its PUBACK and are not reported again.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::collections::HashSet;
use std::fs;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Sink, SinkError};
use crate::config::MqttSinkConfig;
use crate::error::Result;
use crate::record::Record;

/// Requests buffered between the client handle and the event loop
const CLIENT_CAPACITY: usize = 16;

/// Pause after an event loop error before polling again
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Delivery progress reported by the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// A new publish left with this packet id
    Published(u16),
    /// The broker acknowledged this packet id
    Acked(u16),
}

/// Packet ids published but not yet acknowledged
#[derive(Debug, Default)]
struct InFlight {
    outstanding: HashSet<u16>,
}

impl InFlight {
    fn observe(&mut self, event: &Event) -> Option<Delivery> {
        match event {
            Event::Outgoing(Outgoing::Publish(pkid)) if self.outstanding.insert(*pkid) => {
                Some(Delivery::Published(*pkid))
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                self.outstanding.remove(&ack.pkid);
                Some(Delivery::Acked(ack.pkid))
            }
            _ => None,
        }
    }
}

/// Receiving end of the delivery channel, matched against publish calls
#[derive(Debug)]
struct Inbox {
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    /// `publish` calls accepted by the client
    issued: u64,
    /// Fresh publishes reported by the event loop
    published: u64,
    /// Packet id of the latest publish call, once reported
    current: Option<u16>,
}

impl Inbox {
    fn new(deliveries: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            deliveries,
            issued: 0,
            published: 0,
            current: None,
        }
    }

    /// Note a publish call accepted by the client
    fn issue(&mut self) {
        self.issued += 1;
        self.current = None;
    }

    /// Wait for the PUBACK of the most recent publish call
    ///
    /// Acknowledgements for earlier, abandoned publishes are consumed and
    /// ignored. Cancel safe: all progress lives in `self`.
    async fn wait_for_ack(&mut self) -> std::result::Result<u16, SinkError> {
        loop {
            match self.deliveries.recv().await {
                Some(Delivery::Published(pkid)) => {
                    self.published += 1;
                    if self.published == self.issued {
                        self.current = Some(pkid);
                    }
                }
                Some(Delivery::Acked(pkid)) if self.current == Some(pkid) => return Ok(pkid),
                Some(Delivery::Acked(pkid)) => {
                    debug!("Ignoring PUBACK for earlier publish (pkid {})", pkid);
                }
                None => {
                    return Err(SinkError::Connectivity("MQTT event loop stopped".to_string()));
                }
            }
        }
    }
}

/// IoT broker publisher
pub struct MqttSink {
    client: AsyncClient,
    topic: String,
    inbox: Mutex<Inbox>,
    event_loop: JoinHandle<()>,
}

impl std::fmt::Debug for MqttSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSink")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl MqttSink {
    /// Start a broker session and its event loop
    ///
    /// The connection itself is established lazily by the event loop and
    /// retried on failure; this only fails on unreadable TLS material.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Io` if a CA, certificate or key file cannot
    /// be read
    pub fn connect(config: &MqttSinkConfig) -> Result<Self> {
        let options = mqtt_options(config)?;
        let (client, mut eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        let endpoint = format!("{}:{}", config.endpoint, config.port);
        info!("MQTT sink connecting to {}", endpoint);

        let event_loop = tokio::spawn(async move {
            let mut in_flight = InFlight::default();
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        info!("MQTT sink connected to {} ({:?})", endpoint, ack.code);
                    }
                    Ok(event) => {
                        if let Some(delivery) = in_flight.observe(&event) {
                            // Receiver only goes away with the sink itself
                            let _ = delivery_tx.send(delivery);
                        }
                    }
                    Err(e) => {
                        warn!("MQTT sink connection error: {}", e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            topic: config.topic.clone(),
            inbox: Mutex::new(Inbox::new(delivery_rx)),
            event_loop,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

fn mqtt_options(config: &MqttSinkConfig) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(&config.client_id, &config.endpoint, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_s));
    options.set_clean_session(false);

    if let (Some(ca), Some(cert), Some(key)) = (&config.ca_path, &config.cert_path, &config.key_path) {
        let ca = fs::read(ca)?;
        let cert = fs::read(cert)?;
        let key = fs::read(key)?;
        options.set_transport(Transport::tls(ca, Some((cert, key)), None));
        debug!("MQTT sink using mutual TLS");
    }

    Ok(options)
}

#[async_trait]
impl Sink for MqttSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn send(&self, record: &Record) -> std::result::Result<(), SinkError> {
        let payload = serde_json::to_vec(&record.to_json())
            .map_err(|e| SinkError::Rejected(format!("cannot serialize record: {}", e)))?;

        // One publish in flight at a time; the lock spans publish and ack
        let mut inbox = self.inbox.lock().await;

        self.client
            .publish(&self.topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| SinkError::Connectivity(e.to_string()))?;
        inbox.issue();

        let pkid = inbox.wait_for_ack().await?;
        debug!("Record published to {} (pkid {})", self.topic, pkid);
        Ok(())
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}
