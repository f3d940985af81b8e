//! # Storage Module
//!
//! Append-only, date-partitioned telemetry log.
//!
//! One file per (topic, calendar day), laid out as
//! `<base>/data/<YYYY>/<MM>/<DD>/<topic>`. Files are created lazily on the
//! first append of the day, only ever grow, and are never deleted here.
//!
//! This module handles:
//! - Mapping (topic, date) to a partition path
//! - Appending encoded records with a flush before returning
//! - Offset-tracked line reading for the forwarder
//! - Locating the earliest partition of a topic

pub mod cursor;

use chrono::{Local, NaiveDate};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::record::codec::encode;
use crate::record::Record;

/// Directory under the base path holding all partitions
pub const DATA_DIR: &str = "data";

/// Build the partition path for `topic` on `date` under `data_dir`
///
/// A leading `/` on the topic is ignored, so `/inverter/all` and
/// `inverter/all` name the same file.
pub fn partition_path(data_dir: &Path, topic: &str, date: NaiveDate) -> PathBuf {
    data_dir
        .join(date.format("%Y").to_string())
        .join(date.format("%m").to_string())
        .join(date.format("%d").to_string())
        .join(topic.trim_start_matches('/'))
}

/// Date-partitioned append-only log
#[derive(Debug, Clone)]
pub struct LogStore {
    data_dir: PathBuf,
}

impl LogStore {
    /// Create a log store rooted at `<base_dir>/data`
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: base_dir.as_ref().join(DATA_DIR),
        }
    }

    /// Root of the partition tree
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Partition path for `topic` on `date`
    pub fn path_for(&self, topic: &str, date: NaiveDate) -> PathBuf {
        partition_path(&self.data_dir, topic, date)
    }

    /// Append a record to today's partition for `topic`
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::DirectoryCreation` if the partition directory
    /// cannot be created, or `GatewayError::Io` if the write fails
    pub fn append(&self, topic: &str, record: &Record) -> Result<PathBuf> {
        self.append_on(topic, Local::now().date_naive(), record)
    }

    /// Append a record to the partition for `topic` on `date`
    ///
    /// The line is flushed and synced before returning.
    pub fn append_on(&self, topic: &str, date: NaiveDate, record: &Record) -> Result<PathBuf> {
        let path = self.path_for(topic, date);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| GatewayError::DirectoryCreation {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let created = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(encode(record).as_bytes())?;
        file.flush()?;
        file.sync_data()?;

        if created {
            info!("Created partition file {}", path.display());
        } else {
            debug!("Appended record to {}", path.display());
        }
        Ok(path)
    }

    /// Open an existing partition file for reading
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::FileNotFound` if the file does not exist
    pub fn open_for_read(&self, path: &Path) -> Result<LogReader> {
        LogReader::open(path)
    }

    /// Earliest existing partition of `topic`, if any
    ///
    /// Walks the `YYYY/MM/DD` tiers in sorted order and returns the first
    /// day that holds a file for the topic.
    pub fn earliest_partition(&self, topic: &str) -> Result<Option<PathBuf>> {
        for year in sorted_subdirs(&self.data_dir)? {
            for month in sorted_subdirs(&year)? {
                for day in sorted_subdirs(&month)? {
                    let candidate = day.join(topic.trim_start_matches('/'));
                    if candidate.is_file() {
                        return Ok(Some(candidate));
                    }
                }
            }
        }
        Ok(None)
    }
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// One line read from a partition file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Raw line text, including the trailing newline when present
    pub text: String,
    /// Whether the line ended with `\n`
    pub complete: bool,
    /// Byte offset just past this line
    pub next_offset: u64,
}

/// Sequential reader over a partition file that tracks its byte offset
#[derive(Debug)]
pub struct LogReader {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
}

impl LogReader {
    /// Open `path` read-only at offset 0
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => GatewayError::FileNotFound(path.to_path_buf()),
            _ => GatewayError::Io(e),
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            offset: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current byte offset
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Position the reader at `offset`
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.offset = self.reader.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Read the next line, or `None` at end of file
    pub fn next_line(&mut self) -> Result<Option<LogLine>> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(None);
        }

        self.offset += n as u64;
        Ok(Some(LogLine {
            complete: buf.ends_with(b"\n"),
            text: String::from_utf8_lossy(&buf).into_owned(),
            next_offset: self.offset,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_path_layout() {
        let store = LogStore::new("/srv/gateway");
        let path = store.path_for("/inverter/all", date(2024, 6, 3));
        assert_eq!(path, PathBuf::from("/srv/gateway/data/2024/06/03/inverter/all"));
        assert_eq!(path, store.path_for("inverter/all", date(2024, 6, 3)));
    }

    #[test]
    fn test_append_creates_directories_and_file() {
        let tmp = TempDir::new().unwrap();
        let store = LogStore::new(tmp.path());
        let record = Record::new().with("v", 12).with("temp", Value::Null);

        let path = store.append_on("inverter/all", date(2024, 6, 3), &record).unwrap();
        assert!(path.is_file());
        assert_eq!(fs::read_to_string(&path).unwrap(), "v=12,temp=None\n");

        store.append_on("inverter/all", date(2024, 6, 3), &record).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_append_uses_today() {
        let tmp = TempDir::new().unwrap();
        let store = LogStore::new(tmp.path());
        let path = store.append("dev/all", &Record::new().with("a", 1)).unwrap();
        assert_eq!(path, store.path_for("dev/all", Local::now().date_naive()));
    }

    #[test]
    fn test_open_missing_file() {
        let tmp = TempDir::new().unwrap();
        let store = LogStore::new(tmp.path());
        let missing = store.path_for("inverter/all", date(2024, 1, 1));

        let err = store.open_for_read(&missing).unwrap_err();
        assert!(matches!(err, GatewayError::FileNotFound(p) if p == missing));
    }

    #[test]
    fn test_reader_tracks_offsets() {
        let tmp = TempDir::new().unwrap();
        let store = LogStore::new(tmp.path());
        let day = date(2024, 6, 3);
        store.append_on("t", day, &Record::new().with("a", 1)).unwrap();
        let path = store.append_on("t", day, &Record::new().with("b", 22)).unwrap();

        let mut reader = store.open_for_read(&path).unwrap();
        let first = reader.next_line().unwrap().unwrap();
        assert_eq!(first.text, "a=1\n");
        assert_eq!(first.next_offset, 4);
        assert!(first.complete);

        reader.seek_to(4).unwrap();
        let second = reader.next_line().unwrap().unwrap();
        assert_eq!(second.text, "b=22\n");
        assert_eq!(second.next_offset, 9);

        assert!(reader.next_line().unwrap().is_none());
        assert_eq!(reader.offset(), 9);
    }

    #[test]
    fn test_reader_flags_partial_line() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("partial");
        fs::write(&path, "a=1\nb=").unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert!(reader.next_line().unwrap().unwrap().complete);
        let partial = reader.next_line().unwrap().unwrap();
        assert!(!partial.complete);
        assert_eq!(partial.text, "b=");

        reader.seek_to(4).unwrap();
        assert_eq!(reader.offset(), 4);
    }

    #[test]
    fn test_earliest_partition() {
        let tmp = TempDir::new().unwrap();
        let store = LogStore::new(tmp.path());
        assert!(store.earliest_partition("inverter/all").unwrap().is_none());

        let record = Record::new().with("a", 1);
        store.append_on("other", date(2023, 12, 31), &record).unwrap();
        store.append_on("inverter/all", date(2024, 6, 4), &record).unwrap();
        store.append_on("inverter/all", date(2024, 2, 10), &record).unwrap();

        assert_eq!(
            store.earliest_partition("inverter/all").unwrap(),
            Some(store.path_for("inverter/all", date(2024, 2, 10)))
        );
    }
}
