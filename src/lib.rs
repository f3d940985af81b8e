//! # Solar Gateway Library
//!
//! Collect solar inverter telemetry into a local date-partitioned log and
//! forward it to a cloud sink whenever the network allows.
//!
//! Collectors append records to `<base>/data/YYYY/MM/DD/<topic>`. The
//! forwarding engine drains those files in order, persisting its resume point
//! in `<base>/config/meta.txt` after every confirmed record, so delivery is
//! at-least-once across outages and restarts.

pub mod collector;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod metadata;
pub mod record;
pub mod sink;
pub mod storage;
