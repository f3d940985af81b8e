//! # Collector Module
//!
//! Producers that turn inverter readings into records and append them to the
//! local log. Collectors never talk to the forwarding engine directly; the log
//! on disk is the only thing they share.
//!
//! This module handles:
//! - Subscribing to inverter topics on a local MQTT broker (`mqtt`)
//! - Polling inverter HTTP endpoints on a wall-clock schedule (`http`)

pub mod http;
pub mod mqtt;
