//! # Record Module
//!
//! Flat telemetry records and their `key=value` line format.
//!
//! This module handles:
//! - Scalar field values (string, integer, null)
//! - Ordered field-name to value mappings produced by collectors
//! - Encoding records as comma-separated log lines and decoding them back

pub mod codec;

use std::fmt;

/// Literal written for a null value
pub const NULL_LITERAL: &str = "None";

/// Whether `name` can be used as a field name in a log line
pub fn is_valid_field_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['=', ',', '\n', '\r'])
}

/// Characters that would break a log line if they appeared in a value
const LINE_BREAKING: [char; 3] = [',', '\n', '\r'];

/// Replace characters that cannot appear in a log-line value with spaces
pub fn clean_value_text(text: &str) -> String {
    text.replace(LINE_BREAKING, " ")
}

/// A scalar field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Int(i64),
    Str(String),
}

impl Value {
    /// Parse a raw field value the way the log decoder does.
    ///
    /// `None` becomes [`Value::Null`], integer-looking text becomes
    /// [`Value::Int`], anything else stays a string.
    pub fn parse(raw: &str) -> Self {
        if raw == NULL_LITERAL {
            Value::Null
        } else if let Ok(n) = raw.parse::<i64>() {
            Value::Int(n)
        } else {
            Value::Str(raw.to_string())
        }
    }

    /// Convert to a JSON value for sinks
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Str(s) => serde_json::Value::from(s.as_str()),
        }
    }

    /// Convert from a JSON value.
    ///
    /// Floats and booleans are kept as their textual form. Strings have
    /// commas and line breaks replaced with spaces. Arrays and objects are
    /// not scalars and yield `None`.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(b) => Some(Value::Str(b.to_string())),
            serde_json::Value::Number(n) => Some(match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Str(n.to_string()),
            }),
            serde_json::Value::String(s) => Some(Value::Str(clean_value_text(s))),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str(NULL_LITERAL),
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// An ordered mapping from field name to scalar value
///
/// Field order is kept for writing; lookups are by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing an existing value in place
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Builder form of [`Record::insert`]
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// JSON object form of the record, as sent to sinks
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}
