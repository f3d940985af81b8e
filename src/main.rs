//! # Solar Gateway
//!
//! Collect solar inverter telemetry into a local log and forward it to the
//! cloud whenever the network allows.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use solar_gateway::collector::http::HttpPoller;
use solar_gateway::collector::mqtt::MqttCollector;
use solar_gateway::config::{Config, LoggingConfig};
use solar_gateway::forwarder::probe::TcpProbe;
use solar_gateway::forwarder::ForwardingEngine;
use solar_gateway::metadata::{MetadataStore, LAST_UPLOADED_FILE, LAST_UPLOADED_FILE_OFFSET};
use solar_gateway::sink;
use solar_gateway::storage::LogStore;

/// Configuration file used when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

/// Log directory under the base directory
const LOG_DIR: &str = "logs";

/// Log file name prefix; the daily appender adds the date
const LOG_FILE: &str = "gateway.log";

/// Main entry point for the solar gateway
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (first argument, or `config/gateway.toml`)
///    - Resolve the base directory and set up logging
///    - Start the configured collectors
///    - Connect the sink
///
/// 2. **Forwarding**
///    - Run the forwarding engine until Ctrl+C or SIGTERM
///
/// 3. **Graceful Shutdown**
///    - Signal collectors and the engine, wait for them to finish
///    - Log the persisted resume point
///
/// # Errors
///
/// Returns error if:
/// - The configuration cannot be read or is invalid
/// - The base directory cannot be created
/// - The sink cannot be set up (e.g. unreadable TLS material)
/// - The forwarding engine halts on a structural error
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    fs::create_dir_all(&config.storage.base_dir).with_context(|| {
        format!("Failed to create base directory {}", config.storage.base_dir.display())
    })?;
    let base_dir = config.storage.base_dir.canonicalize()?;

    let _log_guard = init_tracing(&config.logging, &base_dir)?;

    info!("Solar Gateway v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Base directory: {}", base_dir.display());

    let store = LogStore::new(&base_dir);
    let metadata = Arc::new(Mutex::new(MetadataStore::new(&base_dir)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut collectors: Vec<JoinHandle<()>> = Vec::new();

    if let Some(mqtt_config) = &config.collector.mqtt {
        let collector = MqttCollector::new(mqtt_config, store.clone());
        let shutdown = shutdown_rx.clone();
        collectors.push(tokio::spawn(async move {
            if let Err(e) = collector.run(shutdown).await {
                error!("MQTT collector failed: {}", e);
            }
        }));
    }

    if let Some(http_config) = &config.collector.http {
        let poller = HttpPoller::new(http_config, store.clone())?;
        collectors.push(tokio::spawn(poller.run(shutdown_rx.clone())));
    }

    if collectors.is_empty() {
        warn!("No collectors configured, only forwarding existing logs");
    }

    let sink = sink::from_config(&config.sink)?;
    let probe = TcpProbe::new(config.probe.address.clone(), config.probe.timeout());
    let mut engine = ForwardingEngine::new(
        store,
        Arc::clone(&metadata),
        sink,
        Box::new(probe),
        &config.forwarder,
        shutdown_rx,
    );

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown requested, finishing current record...");
        signal_tx.send_replace(true);
    });

    let outcome = engine.run().await;

    shutdown_tx.send_replace(true);
    for handle in collectors {
        if let Err(e) = handle.await {
            error!("Collector task failed: {}", e);
        }
    }

    let mut metadata = metadata.lock().await;
    match (
        metadata.get(LAST_UPLOADED_FILE),
        metadata.get(LAST_UPLOADED_FILE_OFFSET),
    ) {
        (Ok(Some(file)), Ok(offset)) => {
            info!("Resume point: {} @ {}", file, offset.unwrap_or_default());
        }
        (Ok(None), _) => info!("Nothing uploaded yet"),
        (Err(e), _) | (_, Err(e)) => warn!("Could not read resume point: {}", e),
    }

    outcome?;
    info!("Solar Gateway stopped");
    Ok(())
}

/// Set up console logging plus an optional daily log file
///
/// `RUST_LOG` overrides the configured level. The returned guard flushes the
/// file writer and must live until exit.
fn init_tracing(config: &LoggingConfig, base_dir: &Path) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log level")?;

    let (file_layer, guard) = if config.file_enabled {
        let log_dir = base_dir.join(LOG_DIR);
        fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Resolve on Ctrl+C, or SIGTERM on unix
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
