//! HTTP status poller
//!
//! Fetches the status document of every configured inverter whenever the
//! save schedule comes due, merges the answers into one record and appends it
//! to the configured topic.

use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::HttpCollectorConfig;
use crate::error::Result;
use crate::record::{is_valid_field_name, Record, Value};
use crate::storage::LogStore;

/// How often the schedule is checked
const TICK: Duration = Duration::from_secs(1);

/// Date field format, day first
pub const DATE_FORMAT: &str = "%d/%m/%Y";

/// Time-of-day field format
pub const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Clone, Copy)]
enum Unit {
    Hour,
    Minute,
    Second,
}

/// Wall-clock save schedule
///
/// A save is due when the current hour, minute or second is a multiple of its
/// configured interval and no save has happened yet in that hour, minute or
/// second.
#[derive(Debug, Clone)]
pub struct SaveSchedule {
    hour: Option<u32>,
    minute: Option<u32>,
    second: Option<u32>,
    last: Option<NaiveDateTime>,
}

impl SaveSchedule {
    pub fn new(hour: Option<u32>, minute: Option<u32>, second: Option<u32>) -> Self {
        Self {
            hour,
            minute,
            second,
            last: None,
        }
    }

    /// Check whether a save is due at `now`, recording it if so
    pub fn is_due(&mut self, now: NaiveDateTime) -> bool {
        let rules = [
            (Unit::Hour, self.hour, now.hour()),
            (Unit::Minute, self.minute, now.minute()),
            (Unit::Second, self.second, now.second()),
        ];

        let due = rules.iter().any(|&(unit, interval, value)| match interval {
            Some(interval) if interval != 0 && value % interval == 0 => match self.last {
                Some(last) => slot(&last, unit) != slot(&now, unit),
                None => true,
            },
            _ => false,
        });

        if due {
            self.last = Some(now);
        }
        due
    }
}

/// `time` truncated to `unit`
fn slot(time: &NaiveDateTime, unit: Unit) -> (NaiveDate, u32, u32, u32) {
    match unit {
        Unit::Hour => (time.date(), time.hour(), 0, 0),
        Unit::Minute => (time.date(), time.hour(), time.minute(), 0),
        Unit::Second => (time.date(), time.hour(), time.minute(), time.second()),
    }
}

/// Strip a trailing unit annotation such as `Load_Percentage(%)`
fn strip_unit(key: &str) -> &str {
    if key.ends_with(')') {
        key.split('(').next().unwrap_or(key)
    } else {
        key
    }
}

/// Merge per-device status documents into one record.
///
/// `results[i]` is the answer of device `i`, or `None` if it could not be
/// fetched. Fields named in `duplicate_keys` are shared by all devices and
/// written once under their own name; every other field gets an `_<i>` suffix.
/// An empty `save_keys` keeps every field.
pub fn format_results(
    results: &[Option<serde_json::Value>],
    save_keys: &[String],
    duplicate_keys: &[String],
) -> Record {
    let mut record = Record::new();

    for (i, result) in results.iter().enumerate() {
        let Some(serde_json::Value::Object(map)) = result else {
            debug!("No usable status from device {}", i);
            continue;
        };

        for (key, value) in map {
            if !save_keys.is_empty() && !save_keys.iter().any(|k| k == key) {
                continue;
            }
            let name = strip_unit(key);
            let Some(value) = Value::from_json(value) else {
                continue;
            };

            if duplicate_keys.iter().any(|k| k == name) {
                if record.get(name).is_none() {
                    record.insert(name, value);
                }
                continue;
            }

            let field = format!("{}_{}", name, i);
            if is_valid_field_name(&field) {
                record.insert(field, value);
            } else {
                warn!("Skipping field with unusable name {:?}", key);
            }
        }
    }

    record
}

/// Add the `date` and `time` fields for `now`
pub fn stamp(record: &mut Record, now: NaiveDateTime) {
    record.insert("date", now.format(DATE_FORMAT).to_string());
    record.insert("time", now.format(TIME_FORMAT).to_string());
}

/// Inverter status poller
pub struct HttpPoller {
    client: reqwest::Client,
    urls: Vec<String>,
    topic: String,
    save_keys: Vec<String>,
    duplicate_keys: Vec<String>,
    schedule: SaveSchedule,
    store: LogStore,
}

impl HttpPoller {
    /// # Errors
    ///
    /// Returns `GatewayError::Http` if the HTTP client cannot be built
    pub fn new(config: &HttpCollectorConfig, store: LogStore) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            urls: config.device_urls.clone(),
            topic: config.topic.clone(),
            save_keys: config.save_keys.clone(),
            duplicate_keys: config.duplicate_keys.clone(),
            schedule: SaveSchedule::new(config.hour, config.minute, config.second),
            store,
        })
    }

    /// Check the schedule every second until `shutdown` flips to `true`
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("HTTP poller started for {} device(s)", self.urls.len());
        let mut tick = tokio::time::interval(TICK);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            if self.schedule.is_due(Local::now().naive_local()) {
                if let Err(e) = self.collect_once(Local::now().naive_local()).await {
                    error!("Failed to store device status: {}", e);
                }
            }
        }

        info!("HTTP poller stopped");
    }

    /// Poll every device once and append the merged record.
    ///
    /// # Returns
    ///
    /// The partition written to, or `None` if no device answered with usable
    /// fields
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be appended
    pub async fn collect_once(&self, now: NaiveDateTime) -> Result<Option<PathBuf>> {
        let results = self.fetch_all().await;
        let mut record = format_results(&results, &self.save_keys, &self.duplicate_keys);

        if record.is_empty() {
            warn!("No device returned usable status");
            return Ok(None);
        }

        stamp(&mut record, now);
        let path = self.store.append(&self.topic, &record)?;
        info!("Stored status from {} device(s)", results.iter().flatten().count());
        Ok(Some(path))
    }

    async fn fetch_all(&self) -> Vec<Option<serde_json::Value>> {
        let handles: Vec<_> = self
            .urls
            .iter()
            .map(|url| {
                let client = self.client.clone();
                let url = url.clone();
                tokio::spawn(async move {
                    let outcome = fetch_status(&client, &url).await;
                    if let Err(e) = &outcome {
                        error!("Failed to fetch status from {}: {}", url, e);
                    }
                    outcome.ok()
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.ok().flatten());
        }
        results
    }
}

async fn fetch_status(client: &reqwest::Client, url: &str) -> Result<serde_json::Value> {
    let response = client.get(url).send().await?.error_for_status()?;
    Ok(response.json().await?)
}
