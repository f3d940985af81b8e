//! # Upload Cursor
//!
//! Works out which partition files still need draining, given the last file
//! the forwarder touched and today's date.
//!
//! The last uploaded path must look like `<data>/YYYY/MM/DD/<topic>` for the
//! configured topic. Paths written under a different topic naming scheme are
//! rejected instead of guessed at.

use chrono::NaiveDate;
use std::path::{Component, Path, PathBuf};

use super::partition_path;
use crate::error::{GatewayError, Result};

/// Computes pending partition files for one topic
#[derive(Debug, Clone)]
pub struct UploadCursor {
    data_dir: PathBuf,
    topic: String,
}

impl UploadCursor {
    pub fn new(data_dir: impl Into<PathBuf>, topic: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            topic: topic.into().trim_start_matches('/').to_string(),
        }
    }

    /// Extract the partition date from a last-uploaded path
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::CursorParse` if the path is outside the data
    /// directory, has no valid `YYYY/MM/DD` tiers, or names another topic
    pub fn parse_date(&self, last_uploaded: &Path) -> Result<NaiveDate> {
        let parse_err = |reason: String| GatewayError::CursorParse {
            path: last_uploaded.to_path_buf(),
            reason,
        };

        let relative = last_uploaded.strip_prefix(&self.data_dir).map_err(|_| {
            parse_err(format!("not under {}", self.data_dir.display()))
        })?;

        let mut parts = relative.components().map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        });

        let mut next_number = |name: &str, width: usize| -> Result<u32> {
            let part = parts
                .next()
                .flatten()
                .ok_or_else(|| parse_err(format!("missing {} component", name)))?;
            if part.len() != width || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(parse_err(format!("invalid {} component {:?}", name, part)));
            }
            part.parse()
                .map_err(|_| parse_err(format!("invalid {} component {:?}", name, part)))
        };

        let year = next_number("year", 4)?;
        let month = next_number("month", 2)?;
        let day = next_number("day", 2)?;

        let date = NaiveDate::from_ymd_opt(year as i32, month, day)
            .ok_or_else(|| parse_err(format!("{:04}-{:02}-{:02} is not a date", year, month, day)))?;

        let rest: Vec<&str> = parts.map(|p| p.unwrap_or("")).collect();
        let expected: Vec<&str> = self.topic.split('/').filter(|s| !s.is_empty()).collect();
        if rest != expected {
            return Err(parse_err(format!(
                "topic {:?} does not match expected {:?}",
                rest.join("/"),
                self.topic
            )));
        }

        Ok(date)
    }

    /// Pending partition files from the last uploaded file's date up to
    /// and including `today`
    ///
    /// Days without a file are skipped. The sequence is lazy; existence is
    /// checked as it is consumed. If the last uploaded date is after
    /// `today`, only that day is considered.
    pub fn pending_files(&self, last_uploaded: &Path, today: NaiveDate) -> Result<PendingFiles> {
        let start = self.parse_date(last_uploaded)?;
        Ok(PendingFiles {
            data_dir: self.data_dir.clone(),
            topic: self.topic.clone(),
            next: Some(start),
            end: today.max(start),
        })
    }
}

/// Lazy sequence of existing partition files, oldest first
#[derive(Debug)]
pub struct PendingFiles {
    data_dir: PathBuf,
    topic: String,
    next: Option<NaiveDate>,
    end: NaiveDate,
}

impl Iterator for PendingFiles {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        while let Some(date) = self.next {
            self.next = if date < self.end { date.succ_opt() } else { None };

            let path = partition_path(&self.data_dir, &self.topic, date);
            if path.is_file() {
                return Some(path);
            }
        }
        None
    }
}
