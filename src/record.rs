//! Aggregated records, the rows of a track.

use crate::sample::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One synthesized row: the latest value of every field at one aggregator tick.
///
/// Stored as `{"timestamp": ..., "input_data": {...}}`, the layout archived
/// tracks have always used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRecord {
    /// Tick time.
    pub timestamp: DateTime<Utc>,
    /// Field name (an address, or `<unit>/last_timestamp`) to value.
    #[serde(rename = "input_data", alias = "values")]
    pub values: BTreeMap<String, Value>,
}

impl AggregatedRecord {
    /// Create a record.
    pub fn new(timestamp: DateTime<Utc>, values: BTreeMap<String, Value>) -> Self {
        Self { timestamp, values }
    }

    /// Value of one field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Numeric value of one field.
    pub fn number(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }
}

/// A record together with its position in the track.
///
/// Indices are absolute: they count every record ever appended to the track,
/// so they stay stable when old records are trimmed from memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedRecord {
    /// Position in the track.
    pub index: u64,
    /// The record.
    #[serde(flatten)]
    pub record: AggregatedRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_layout_uses_input_data() {
        let mut values = BTreeMap::new();
        values.insert("rm1/gps/lat".to_string(), Value::Float(45.5));
        let record = AggregatedRecord::new(
            DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            values,
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["input_data"]["rm1/gps/lat"], 45.5);
        assert_eq!(json["timestamp"], "2023-11-14T22:13:20Z");

        let indexed = IndexedRecord { index: 7, record };
        let line = serde_json::to_string(&indexed).unwrap();
        let back: IndexedRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back, indexed);
    }

    #[test]
    fn accepts_values_alias() {
        let record: AggregatedRecord = serde_json::from_str(
            r#"{"timestamp": "2024-06-01T10:00:00Z", "values": {"rm2/wind/speed": 3}}"#,
        )
        .unwrap();
        assert_eq!(record.number("rm2/wind/speed"), Some(3.0));
    }
}
