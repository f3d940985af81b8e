//! # Forwarder Module
//!
//! Drains the local log to the configured sink whenever the network allows.
//!
//! ## Cycle
//!
//! ```text
//! Idle -> CheckingConnectivity -> Draining -> Idle -> ...
//!                 |  (offline)
//!                 +-> sleep, probe again
//! Stopped is reachable from any state once shutdown is signalled.
//! ```
//!
//! ## Resumability
//!
//! Progress (`LastUploadedFile`, `LastUploadedFileOffset`) is persisted after
//! every confirmed line. A failed or timed-out delivery aborts the pass
//! without touching the metadata, so the same line is retried next cycle and
//! a crash re-sends at most the one record that was in flight.

pub mod probe;

use chrono::{Local, NaiveDate};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::ForwarderConfig;
use crate::error::{GatewayError, Result};
use crate::metadata::{MetadataStore, LAST_UPLOADED_FILE, LAST_UPLOADED_FILE_OFFSET};
use crate::record::codec::decode;
use crate::record::Record;
use crate::sink::{Sink, SinkError};
use crate::storage::cursor::UploadCursor;
use crate::storage::LogStore;

use probe::ConnectivityProbe;

/// Forwarding engine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    CheckingConnectivity,
    Draining,
    Stopped,
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Partition files opened
    pub files: usize,
    /// Records confirmed by the sink
    pub forwarded: usize,
    /// Malformed or empty lines stepped over
    pub skipped: usize,
    /// Shutdown was observed before the pass finished
    pub interrupted: bool,
}

enum FileOutcome {
    Drained,
    Interrupted,
}

/// Log-and-forward control loop
pub struct ForwardingEngine {
    store: LogStore,
    metadata: Arc<Mutex<MetadataStore>>,
    cursor: UploadCursor,
    topic: String,
    sink: Box<dyn Sink>,
    probe: Box<dyn ConnectivityProbe>,
    poll_interval: Duration,
    forward_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    shutdown_closed: bool,
    state: EngineState,
}

impl ForwardingEngine {
    /// Create an engine
    ///
    /// # Arguments
    ///
    /// * `store` - Log store the collectors append to
    /// * `metadata` - Progress ledger, shared with anything else saving to it
    /// * `sink` - Destination for forwarded records
    /// * `probe` - Network reachability check
    /// * `config` - Topic, cadence and per-forward timeout
    /// * `shutdown` - Flips to `true` to stop the engine
    pub fn new(
        store: LogStore,
        metadata: Arc<Mutex<MetadataStore>>,
        sink: Box<dyn Sink>,
        probe: Box<dyn ConnectivityProbe>,
        config: &ForwarderConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let topic = config.topic.trim_start_matches('/').to_string();
        Self {
            cursor: UploadCursor::new(store.data_dir(), topic.clone()),
            store,
            metadata,
            topic,
            sink,
            probe,
            poll_interval: config.poll_interval(),
            forward_timeout: config.forward_timeout(),
            shutdown,
            shutdown_closed: false,
            state: EngineState::Idle,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    fn is_running(&self) -> bool {
        !self.shutdown_closed && !*self.shutdown.borrow()
    }

    /// Run cycles until shutdown
    ///
    /// Transient failures (sink, metadata, file I/O) are logged and retried
    /// on the next cycle.
    ///
    /// # Errors
    ///
    /// Returns structural errors such as `GatewayError::CursorParse`, which
    /// indicate configuration or layout drift and need investigation
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Forwarding engine started (topic {}, sink {}, every {:?})",
            self.topic,
            self.sink.name(),
            self.poll_interval
        );

        while self.is_running() {
            self.state = EngineState::CheckingConnectivity;
            if !self.probe.is_connected().await {
                debug!("Network unreachable, upload deferred");
                self.pause().await;
                continue;
            }

            self.state = EngineState::Draining;
            match self.drain_pass().await {
                Ok(report) => {
                    if report.forwarded > 0 || report.skipped > 0 {
                        info!(
                            "Drain pass complete: {} record(s) forwarded, {} skipped across {} file(s)",
                            report.forwarded, report.skipped, report.files
                        );
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!("Drain pass aborted, retrying next cycle: {}", e);
                }
                Err(e) => {
                    error!("Forwarding engine halted: {}", e);
                    self.state = EngineState::Stopped;
                    return Err(e);
                }
            }

            self.state = EngineState::Idle;
            self.pause().await;
        }

        self.state = EngineState::Stopped;
        info!("Forwarding engine stopped");
        Ok(())
    }

    /// Sleep one poll interval, waking early on shutdown
    async fn pause(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            changed = self.shutdown.changed() => {
                if changed.is_err() {
                    self.shutdown_closed = true;
                }
            }
        }
    }

    /// Drain everything available up to today
    pub async fn drain_pass(&mut self) -> Result<DrainReport> {
        self.drain_pass_on(Local::now().date_naive()).await
    }

    /// Drain everything available up to `today`
    ///
    /// # Errors
    ///
    /// Stops at the first sink, metadata or read failure, leaving progress
    /// at the last confirmed line
    pub async fn drain_pass_on(&mut self, today: NaiveDate) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        let (recorded, recorded_offset) = self.resume_point().await?;
        let start = match &recorded {
            Some(path) => path.clone(),
            None => match self.store.earliest_partition(&self.topic)? {
                Some(path) => {
                    info!("No upload progress recorded, starting at {}", path.display());
                    path
                }
                None => return Ok(report),
            },
        };

        let live = self.store.path_for(&self.topic, today);
        for path in self.cursor.pending_files(&start, today)? {
            if !self.is_running() {
                report.interrupted = true;
                break;
            }

            let offset = if recorded.as_ref() == Some(&path) { recorded_offset } else { 0 };
            report.files += 1;

            let is_live = path == live;
            match self.drain_file(&path, offset, is_live, &mut report).await? {
                FileOutcome::Drained => {}
                FileOutcome::Interrupted => {
                    report.interrupted = true;
                    break;
                }
            }
        }

        Ok(report)
    }

    async fn resume_point(&self) -> Result<(Option<PathBuf>, u64)> {
        let mut metadata = self.metadata.lock().await;
        let file = metadata
            .get(LAST_UPLOADED_FILE)?
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        let offset = match metadata.get(LAST_UPLOADED_FILE_OFFSET)?.filter(|v| !v.is_empty()) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("Unreadable {} {:?}, restarting file from offset 0", LAST_UPLOADED_FILE_OFFSET, raw);
                0
            }),
            None => 0,
        };
        Ok((file, offset))
    }

    async fn drain_file(
        &self,
        path: &Path,
        offset: u64,
        is_live: bool,
        report: &mut DrainReport,
    ) -> Result<FileOutcome> {
        let mut reader = match self.store.open_for_read(path) {
            Ok(reader) => reader,
            Err(GatewayError::FileNotFound(missing)) => {
                debug!("{} disappeared, nothing to drain", missing.display());
                return Ok(FileOutcome::Drained);
            }
            Err(e) => return Err(e),
        };
        reader.seek_to(offset)?;
        debug!("Draining {} from offset {}", path.display(), offset);

        loop {
            if !self.is_running() {
                return Ok(FileOutcome::Interrupted);
            }

            let line_offset = reader.offset();
            let Some(line) = reader.next_line()? else {
                return Ok(FileOutcome::Drained);
            };

            if !line.complete {
                // Today's writer may still be mid-line
                if is_live {
                    debug!("Unfinished line in {} at offset {}, retrying later", path.display(), line_offset);
                    return Ok(FileOutcome::Drained);
                }
                warn!("Skipping torn line in {} at offset {}", path.display(), line_offset);
                report.skipped += 1;
                self.persist(path, line.next_offset).await?;
                continue;
            }

            match decode(&line.text) {
                Ok(record) if record.is_empty() => {
                    debug!("Empty line in {} at offset {}", path.display(), line_offset);
                    report.skipped += 1;
                }
                Ok(record) => {
                    self.forward(&record).await?;
                    report.forwarded += 1;
                }
                Err(e) => {
                    warn!("Skipping line in {} at offset {}: {}", path.display(), line_offset, e);
                    report.skipped += 1;
                }
            }

            self.persist(path, line.next_offset).await?;
        }
    }

    async fn forward(&self, record: &Record) -> Result<()> {
        match tokio::time::timeout(self.forward_timeout, self.sink.send(record)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SinkError::Connectivity(format!(
                "no confirmation within {:?}",
                self.forward_timeout
            ))
            .into()),
        }
    }

    async fn persist(&self, path: &Path, offset: u64) -> Result<()> {
        let mut metadata = self.metadata.lock().await;
        metadata.save(&[
            (LAST_UPLOADED_FILE, path.to_string_lossy().into_owned()),
            (LAST_UPLOADED_FILE_OFFSET, offset.to_string()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::codec::encode;
    use crate::sink::mocks::MockSink;
    use probe::MockConnectivityProbe;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::TempDir;

    const TOPIC: &str = "inverter/all";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    struct Harness {
        tmp: TempDir,
        store: LogStore,
        metadata: Arc<Mutex<MetadataStore>>,
        sink: MockSink,
        shutdown_tx: Arc<watch::Sender<bool>>,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let (shutdown_tx, _) = watch::channel(false);
            Self {
                store: LogStore::new(tmp.path()),
                metadata: Arc::new(Mutex::new(MetadataStore::new(tmp.path()))),
                sink: MockSink::new(),
                shutdown_tx: Arc::new(shutdown_tx),
                tmp,
            }
        }

        fn engine_with_probe(&self, probe: MockConnectivityProbe) -> ForwardingEngine {
            let config = ForwarderConfig {
                topic: TOPIC.to_string(),
                poll_interval_ms: 10,
                forward_timeout_ms: 200,
            };
            ForwardingEngine::new(
                self.store.clone(),
                Arc::clone(&self.metadata),
                Box::new(self.sink.clone()),
                Box::new(probe),
                &config,
                self.shutdown_tx.subscribe(),
            )
        }

        fn engine(&self) -> ForwardingEngine {
            let mut probe = MockConnectivityProbe::new();
            probe.expect_is_connected().returning(|| true);
            self.engine_with_probe(probe)
        }

        fn write_lines(&self, day: NaiveDate, records: &[Record]) -> PathBuf {
            let mut path = self.store.path_for(TOPIC, day);
            for record in records {
                path = self.store.append_on(TOPIC, day, record).unwrap();
            }
            path
        }

        fn write_metadata(&self, contents: &str) {
            let dir = self.tmp.path().join("config");
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("meta.txt"), contents).unwrap();
        }

        /// Progress as persisted on disk, bypassing the shared overlay
        fn persisted(&self) -> (Option<String>, Option<u64>) {
            let mut fresh = MetadataStore::new(self.tmp.path());
            (
                fresh.get(LAST_UPLOADED_FILE).unwrap(),
                fresh.get_u64(LAST_UPLOADED_FILE_OFFSET).unwrap(),
            )
        }
    }

    fn seq(n: i64) -> Record {
        Record::new().with("seq", n).with("v", 12345)
    }

    #[tokio::test]
    async fn test_resume_from_offset_across_days() {
        let h = Harness::new();
        // Each line is "seq=N,v=12345\n", 14 bytes
        let day3 = h.write_lines(date(2024, 6, 3), &[seq(1), seq(2), seq(3), seq(4), seq(5)]);
        let day4 = h.write_lines(date(2024, 6, 4), &[seq(6), seq(7), seq(8)]);
        h.write_metadata(&format!(
            "# progress\nLastUploadedFile={}\nLastUploadedFileOffset=42\n",
            day3.display()
        ));

        let mut engine = h.engine();
        let report = engine.drain_pass_on(date(2024, 6, 4)).await.unwrap();

        assert_eq!(report.files, 2);
        assert_eq!(report.forwarded, 5);
        assert!(!report.interrupted);

        let delivered = h.sink.get_delivered();
        let expected: Vec<Record> = (4..=8).map(seq).collect();
        assert_eq!(delivered, expected);

        let (file, offset) = h.persisted();
        assert_eq!(file, Some(day4.to_string_lossy().into_owned()));
        assert_eq!(offset, Some(fs::metadata(&day4).unwrap().len()));
        assert!(fs::read_to_string(h.tmp.path().join("config/meta.txt"))
            .unwrap()
            .starts_with("# progress\n"));
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_offset() {
        let h = Harness::new();
        let day = date(2024, 6, 3);
        h.write_lines(day, &[seq(1), seq(2), seq(3)]);

        h.sink.succeed_next();
        h.sink.fail_next(SinkError::Connectivity("link down".into()));

        let mut engine = h.engine();
        let err = engine.drain_pass_on(day).await.unwrap_err();
        assert!(matches!(err, GatewayError::SinkDelivery(SinkError::Connectivity(_))));
        assert!(err.is_transient());
        assert_eq!(h.sink.get_delivered(), vec![seq(1)]);
        assert_eq!(h.persisted().1, Some(14));

        // Next pass resumes at the failed line; nothing is sent twice
        let report = engine.drain_pass_on(day).await.unwrap();
        assert_eq!(report.forwarded, 2);
        assert_eq!(h.sink.get_delivered(), vec![seq(1), seq(2), seq(3)]);
        assert_eq!(h.persisted().1, Some(42));
    }

    #[tokio::test]
    async fn test_restart_resumes_at_persisted_offset() {
        let h = Harness::new();
        let day = date(2024, 6, 3);
        h.write_lines(day, &[seq(1), seq(2)]);

        h.engine().drain_pass_on(day).await.unwrap();
        h.write_lines(day, &[seq(3)]);

        // Fresh engine and metadata overlay, as after a process restart
        let restarted = Harness {
            tmp: h.tmp,
            store: h.store.clone(),
            metadata: Arc::new(Mutex::new(MetadataStore::new(h.store.data_dir().parent().unwrap()))),
            sink: MockSink::new(),
            shutdown_tx: h.shutdown_tx,
        };
        let report = restarted.engine().drain_pass_on(day).await.unwrap();

        assert_eq!(report.forwarded, 1);
        assert_eq!(restarted.sink.get_delivered(), vec![seq(3)]);
    }

    #[tokio::test]
    async fn test_forward_timeout_is_transient() {
        let h = Harness::new();
        let day = date(2024, 6, 3);
        h.write_lines(day, &[seq(1)]);
        h.sink.set_delay(Duration::from_millis(500));

        let err = h.engine().drain_pass_on(day).await.unwrap_err();
        assert!(matches!(err, GatewayError::SinkDelivery(SinkError::Connectivity(_))));
        assert_eq!(h.persisted(), (None, None));
    }

    #[tokio::test]
    async fn test_malformed_line_skipped_and_noted() {
        let h = Harness::new();
        let day = date(2024, 6, 3);
        let path = h.write_lines(day, &[seq(1)]);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"garbage\n\n").unwrap();
        file.write_all(encode(&seq(2)).as_bytes()).unwrap();
        drop(file);

        let report = h.engine().drain_pass_on(day).await.unwrap();
        assert_eq!(report.forwarded, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(h.sink.get_delivered(), vec![seq(1), seq(2)]);
        assert_eq!(h.persisted().1, Some(fs::metadata(&path).unwrap().len()));
    }

    #[tokio::test]
    async fn test_unfinished_line_in_live_file_waits() {
        let h = Harness::new();
        let today = date(2024, 6, 3);
        let path = h.write_lines(today, &[seq(1)]);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"seq=2,v=").unwrap();

        let mut engine = h.engine();
        let report = engine.drain_pass_on(today).await.unwrap();
        assert_eq!(report.forwarded, 1);
        assert_eq!(h.persisted().1, Some(14));

        file.write_all(b"12345\n").unwrap();
        drop(file);
        let report = engine.drain_pass_on(today).await.unwrap();
        assert_eq!(report.forwarded, 1);
        assert_eq!(h.sink.get_delivered(), vec![seq(1), seq(2)]);
    }

    #[tokio::test]
    async fn test_torn_line_in_past_file_is_skipped() {
        let h = Harness::new();
        let day3 = h.write_lines(date(2024, 6, 3), &[seq(1)]);
        let mut file = OpenOptions::new().append(true).open(&day3).unwrap();
        file.write_all(b"seq=2,v=12").unwrap();
        drop(file);
        let day4 = h.write_lines(date(2024, 6, 4), &[seq(3)]);

        let report = h.engine().drain_pass_on(date(2024, 6, 4)).await.unwrap();
        assert_eq!(report.forwarded, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(h.sink.get_delivered(), vec![seq(1), seq(3)]);
        assert_eq!(
            h.persisted(),
            (Some(day4.to_string_lossy().into_owned()), Some(14))
        );
    }

    #[tokio::test]
    async fn test_unreadable_offset_restarts_file() {
        let h = Harness::new();
        let day = date(2024, 6, 3);
        let path = h.write_lines(day, &[seq(1), seq(2)]);
        h.write_metadata(&format!(
            "LastUploadedFile={}\nLastUploadedFileOffset=fourteen\n",
            path.display()
        ));

        let report = h.engine().drain_pass_on(day).await.unwrap();
        assert_eq!(report.forwarded, 2);
        assert_eq!(h.persisted().1, Some(28));
    }

    #[tokio::test]
    async fn test_first_run_starts_at_earliest_partition() {
        let h = Harness::new();
        h.write_lines(date(2024, 5, 30), &[seq(1)]);
        let last = h.write_lines(date(2024, 6, 2), &[seq(2)]);

        let report = h.engine().drain_pass_on(date(2024, 6, 3)).await.unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(h.sink.get_delivered(), vec![seq(1), seq(2)]);
        assert_eq!(h.persisted().0, Some(last.to_string_lossy().into_owned()));
    }

    #[tokio::test]
    async fn test_empty_log_is_noop() {
        let h = Harness::new();
        let report = h.engine().drain_pass_on(date(2024, 6, 3)).await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert!(!h.tmp.path().join("config/meta.txt").exists());
    }

    #[tokio::test]
    async fn test_foreign_cursor_path_is_structural() {
        let h = Harness::new();
        let other = h.store.path_for("dev/all", date(2024, 6, 3));
        h.write_metadata(&format!("LastUploadedFile={}\n", other.display()));

        let err = h.engine().drain_pass_on(date(2024, 6, 3)).await.unwrap_err();
        assert!(matches!(err, GatewayError::CursorParse { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_shutdown_observed_between_lines() {
        let h = Harness::new();
        let day = date(2024, 6, 3);
        h.write_lines(day, &[seq(1), seq(2)]);

        let mut engine = h.engine();
        h.shutdown_tx.send_replace(true);
        let report = engine.drain_pass_on(day).await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.forwarded, 0);
        assert!(h.sink.get_delivered().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_mid_file_stops_after_current_line() {
        let h = Harness::new();
        let day = date(2024, 6, 3);
        let path = h.write_lines(day, &[seq(1), seq(2), seq(3)]);

        let shutdown_tx = Arc::clone(&h.shutdown_tx);
        h.sink.on_deliver(move |_| {
            shutdown_tx.send_replace(true);
        });

        let report = h.engine().drain_pass_on(day).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.files, 1);
        assert_eq!(report.forwarded, 1);
        assert_eq!(h.sink.get_delivered(), vec![seq(1)]);
        assert_eq!(
            h.persisted(),
            (Some(path.to_string_lossy().into_owned()), Some(14))
        );
    }

    #[tokio::test]
    async fn test_offline_probe_skips_drain() {
        let h = Harness::new();
        h.write_lines(date(2024, 6, 3), &[seq(1)]);

        let mut probe = MockConnectivityProbe::new();
        probe.expect_is_connected().returning(|| false);
        let mut engine = h.engine_with_probe(probe);

        let tx = h.shutdown_tx.clone();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send_replace(true);
        });

        engine.run().await.unwrap();
        stopper.await.unwrap();

        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(h.sink.get_delivered().is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_and_stops() {
        let h = Harness::new();
        let today = Local::now().date_naive();
        h.write_lines(today, &[seq(1), seq(2)]);

        let mut engine = h.engine();
        assert_eq!(engine.state(), EngineState::Idle);
        let handle = tokio::spawn(async move {
            let result = engine.run().await;
            (engine, result)
        });

        for _ in 0..100 {
            if h.sink.get_delivered().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.shutdown_tx.send_replace(true);

        let (engine, result) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(h.sink.get_delivered(), vec![seq(1), seq(2)]);
    }

    #[tokio::test]
    async fn test_run_halts_on_structural_error() {
        let h = Harness::new();
        h.write_metadata("LastUploadedFile=/somewhere/else\n");

        let mut engine = h.engine();
        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, GatewayError::CursorParse { .. }));
        assert_eq!(engine.state(), EngineState::Stopped);
    }
}
