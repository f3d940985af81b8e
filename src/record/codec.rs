//! # Record Codec
//!
//! Serializes records as `k1=v1,k2=v2,...\n` log lines and decodes them back.
//!
//! No escaping is performed: field names never contain `=` or `,`, and a
//! value containing `,` does not survive a round trip.

use super::{Record, Value};
use crate::error::{GatewayError, Result};

/// Separator between `key=value` pairs
pub const FIELD_SEPARATOR: char = ',';

/// Separator between a key and its value
pub const KV_SEPARATOR: char = '=';

/// Encode a record as a newline-terminated log line
///
/// # Examples
///
/// ```
/// use solar_gateway::record::{Record, Value};
/// use solar_gateway::record::codec::encode;
///
/// let record = Record::new().with("temp", Value::Null).with("v", 12);
/// assert_eq!(encode(&record), "temp=None,v=12\n");
/// ```
pub fn encode(record: &Record) -> String {
    let mut line = String::new();
    for (i, (name, value)) in record.iter().enumerate() {
        if i > 0 {
            line.push(FIELD_SEPARATOR);
        }
        line.push_str(name);
        line.push(KV_SEPARATOR);
        line.push_str(&value.to_string());
    }
    line.push('\n');
    line
}

/// Decode a log line into a record
///
/// # Arguments
///
/// * `line` - A log line, with or without its trailing newline
///
/// # Returns
///
/// * `Result<Record>` - Decoded record; an empty line yields an empty record
///
/// # Errors
///
/// Returns `GatewayError::MalformedLine` if a segment has no `=`
pub fn decode(line: &str) -> Result<Record> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);

    let mut record = Record::new();
    if line.is_empty() {
        return Ok(record);
    }

    for segment in line.split(FIELD_SEPARATOR) {
        let (name, raw) = segment.split_once(KV_SEPARATOR).ok_or_else(|| {
            GatewayError::MalformedLine(format!("no '=' in segment {:?}", segment))
        })?;
        record.insert(name, Value::parse(raw));
    }

    Ok(record)
}
