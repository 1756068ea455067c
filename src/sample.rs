//! Samples, addresses and dynamically typed sensor values.
//!
//! Remote units publish on addresses of the form `<unit>/<sensor>/<quantity>`
//! (e.g. `rm1/gps/lat`). A [`Sample`] is one decoded reading from such an
//! address, stamped with the time it arrived.

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A sensor reading as decoded from a transport payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Explicit absence of a value.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Integer reading.
    Int(i64),
    /// Floating point reading.
    Float(f64),
    /// Anything else, kept verbatim.
    Text(String),
}

impl Value {
    /// Infer the best matching type for a textual payload.
    ///
    /// Integers win over floats, floats over booleans, and anything else is
    /// kept as text. Payloads containing `_` are never coerced, so identifiers
    /// such as `rm_1` survive untouched.
    pub fn parse_payload(raw: &str) -> Self {
        let s = raw.trim();
        if s.contains('_') {
            return Value::Text(s.to_string());
        }
        if let Ok(i) = s.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = s.parse::<f64>() {
            return Value::Float(f);
        }
        match s {
            "true" | "True" => Value::Bool(true),
            "false" | "False" => Value::Bool(false),
            "null" | "None" | "" => Value::Null,
            _ => Value::Text(s.to_string()),
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// True for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map_or(Value::Null, Value::Float),
            },
            serde_json::Value::String(s) => Value::Text(s),
            // Nested payloads are stored as their JSON text.
            other => Value::Text(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

/// A validated `<unit>/<sensor>/<quantity>` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    full: String,
    unit_len: usize,
}

impl Address {
    /// Parse and validate an address string.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let parts: Vec<&str> = raw.split('/').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(DaqError::MalformedAddress(raw.to_string()));
        }
        Ok(Self {
            full: raw.to_string(),
            unit_len: parts[0].len(),
        })
    }

    /// Build an address from a unit id and a `<sensor>/<quantity>` topic.
    pub fn from_parts(unit_id: &str, topic: &str) -> AppResult<Self> {
        Self::parse(&format!("{unit_id}/{topic}"))
    }

    /// The remote unit the address belongs to.
    pub fn unit_id(&self) -> &str {
        &self.full[..self.unit_len]
    }

    /// The `<sensor>/<quantity>` part.
    pub fn topic(&self) -> &str {
        &self.full[self.unit_len + 1..]
    }

    /// Full address string.
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl TryFrom<String> for Address {
    type Error = DaqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.full
    }
}

/// The atomic unit produced by a transport reader. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Where the reading came from.
    pub address: Address,
    /// Decoded reading.
    pub value: Value,
    /// Arrival time.
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    /// Create a sample from its parts.
    pub fn new(address: Address, value: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            address,
            value,
            timestamp,
        }
    }

    /// Convenience constructor used by the transport decoders.
    pub fn parse(address: &str, value: Value, timestamp: DateTime<Utc>) -> AppResult<Self> {
        Ok(Self::new(Address::parse(address)?, value, timestamp))
    }

    /// Remote unit that produced the sample.
    pub fn unit_id(&self) -> &str {
        self.address.unit_id()
    }
}
