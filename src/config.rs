//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Base directory holding `data/`, `config/meta.txt` and `logs/`
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
}

/// Forwarding engine configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ForwarderConfig {
    /// Topic whose partitions are forwarded; last uploaded paths must be
    /// `<base>/data/YYYY/MM/DD/<topic>`
    #[serde(default = "default_forward_topic")]
    pub topic: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
}

/// Connectivity probe configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    /// `host:port` reached over TCP to decide whether the network is up
    #[serde(default = "default_probe_address")]
    pub address: String,

    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

/// Remote sink selection
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    Mqtt(MqttSinkConfig),
    Http(HttpSinkConfig),
}

/// IoT broker sink configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MqttSinkConfig {
    pub endpoint: String,

    #[serde(default = "default_mqtt_tls_port")]
    pub port: u16,

    #[serde(default = "default_sink_client_id")]
    pub client_id: String,

    /// Topic records are published to
    #[serde(default = "default_publish_topic")]
    pub topic: String,

    #[serde(default)]
    pub ca_path: Option<PathBuf>,

    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    #[serde(default)]
    pub key_path: Option<PathBuf>,

    #[serde(default = "default_keep_alive_s")]
    pub keep_alive_s: u64,
}

/// Spreadsheet endpoint sink configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HttpSinkConfig {
    pub url: String,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Local collectors; a collector runs when its section is present
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CollectorConfig {
    #[serde(default)]
    pub mqtt: Option<MqttCollectorConfig>,

    #[serde(default)]
    pub http: Option<HttpCollectorConfig>,
}

/// Local MQTT broker subscription
#[derive(Debug, Deserialize, Clone)]
pub struct MqttCollectorConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_collector_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub topics: Vec<String>,
}

/// Device status polling
#[derive(Debug, Deserialize, Clone)]
pub struct HttpCollectorConfig {
    pub device_urls: Vec<String>,

    #[serde(default = "default_forward_topic")]
    pub topic: String,

    #[serde(default)]
    pub hour: Option<u32>,

    #[serde(default)]
    pub minute: Option<u32>,

    #[serde(default)]
    pub second: Option<u32>,

    /// Status fields kept in the record; empty keeps everything
    #[serde(default)]
    pub save_keys: Vec<String>,

    /// Fields shared by all devices, recorded once without an index suffix
    #[serde(default)]
    pub duplicate_keys: Vec<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write daily-rolled files under `<base>/logs`
    #[serde(default = "default_file_enabled")]
    pub file_enabled: bool,
}

// Default value functions
fn default_base_dir() -> PathBuf { PathBuf::from(".") }

fn default_forward_topic() -> String { "inverter/all".to_string() }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_forward_timeout_ms() -> u64 { 2000 }

fn default_probe_address() -> String { "8.8.8.8:53".to_string() }
fn default_probe_timeout_ms() -> u64 { 1000 }

fn default_mqtt_tls_port() -> u16 { 8883 }
fn default_sink_client_id() -> String { "solar-gateway".to_string() }
fn default_publish_topic() -> String { "inverter/data".to_string() }
fn default_keep_alive_s() -> u64 { 30 }
fn default_request_timeout_ms() -> u64 { 5000 }

fn default_mqtt_host() -> String { "localhost".to_string() }
fn default_mqtt_port() -> u16 { 1883 }
fn default_collector_client_id() -> String { "solar-gateway-collector".to_string() }

fn default_log_level() -> String { "info".to_string() }
fn default_file_enabled() -> bool { true }

impl Default for StorageConfig {
    fn default() -> Self {
        Self { base_dir: default_base_dir() }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            address: default_probe_address(),
            timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_enabled: default_file_enabled(),
        }
    }
}

fn invalid(msg: impl std::fmt::Display) -> GatewayError {
    GatewayError::Config(toml::de::Error::custom(msg))
}

impl ForwarderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use solar_gateway::config::Config;
    ///
    /// let config = Config::load("config/gateway.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        // Forwarder
        if self.forwarder.topic.trim_start_matches('/').is_empty() {
            return Err(invalid("forwarder topic cannot be empty"));
        }

        if self.forwarder.poll_interval_ms == 0 || self.forwarder.poll_interval_ms > 3_600_000 {
            return Err(invalid("poll_interval_ms must be between 1 and 3600000"));
        }

        if self.forwarder.forward_timeout_ms == 0 || self.forwarder.forward_timeout_ms > 60000 {
            return Err(invalid("forward_timeout_ms must be between 1 and 60000"));
        }

        // Probe
        if self.probe.address.is_empty() {
            return Err(invalid("probe address cannot be empty"));
        }

        if self.probe.timeout_ms == 0 || self.probe.timeout_ms > 10000 {
            return Err(invalid("probe timeout_ms must be between 1 and 10000"));
        }

        // Sink
        match &self.sink {
            SinkConfig::Mqtt(mqtt) => {
                if mqtt.endpoint.is_empty() {
                    return Err(invalid("mqtt sink endpoint cannot be empty"));
                }
                if mqtt.port == 0 {
                    return Err(invalid("mqtt sink port cannot be 0"));
                }
                if mqtt.topic.is_empty() {
                    return Err(invalid("mqtt sink topic cannot be empty"));
                }
                let tls = [&mqtt.ca_path, &mqtt.cert_path, &mqtt.key_path];
                let set = tls.iter().filter(|p| p.is_some()).count();
                if set != 0 && set != tls.len() {
                    return Err(invalid("ca_path, cert_path and key_path must be set together"));
                }
                if mqtt.keep_alive_s < 5 || mqtt.keep_alive_s > 1200 {
                    return Err(invalid("keep_alive_s must be between 5 and 1200"));
                }
            }
            SinkConfig::Http(http) => {
                if !(http.url.starts_with("http://") || http.url.starts_with("https://")) {
                    return Err(invalid("http sink url must start with http:// or https://"));
                }
                if http.request_timeout_ms == 0 || http.request_timeout_ms > 60000 {
                    return Err(invalid("request_timeout_ms must be between 1 and 60000"));
                }
            }
        }

        // Collectors
        if let Some(mqtt) = &self.collector.mqtt {
            if mqtt.topics.is_empty() {
                return Err(invalid("mqtt collector needs at least one topic"));
            }
            if mqtt.username.is_some() != mqtt.password.is_some() {
                return Err(invalid("mqtt collector username and password must be set together"));
            }
        }

        if let Some(http) = &self.collector.http {
            if http.device_urls.is_empty() {
                return Err(invalid("http collector needs at least one device url"));
            }
            for (name, value, max) in [
                ("hour", http.hour, 24),
                ("minute", http.minute, 60),
                ("second", http.second, 60),
            ] {
                if let Some(v) = value {
                    if v == 0 || v > max {
                        return Err(invalid(format!("{} interval must be between 1 and {}", name, max)));
                    }
                }
            }
            if http.hour.is_none() && http.minute.is_none() && http.second.is_none() {
                return Err(invalid("http collector needs an hour, minute or second interval"));
            }
            if http.request_timeout_ms == 0 || http.request_timeout_ms > 60000 {
                return Err(invalid("request_timeout_ms must be between 1 and 60000"));
            }
        }

        // Logging
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("logging level must be one of: trace, debug, info, warn, error"));
        }

        Ok(())
    }
}
