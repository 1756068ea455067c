//! Transport readers.
//!
//! Each reader owns one physical or logical connection, decodes raw payloads
//! into [`Sample`]s and pushes them into the shared [`Communicator`]. Readers are
//! independent failure domains: a reader that loses its connection logs the
//! [`DaqError::Transport`], backs off and reconnects without touching any other
//! reader.
//!
//! # Readers
//!
//! - [`serial::SerialReader`]: line-oriented JSON objects over a serial port
//!   (requires the `serial` feature)
//! - [`mqtt::MqttReader`]: publish/subscribe broker client

pub mod mqtt;
pub mod serial;

use crate::communicator::Communicator;
use crate::config::TransportSettings;
use crate::error::{AppResult, DaqError};
use crate::sample::{Sample, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// A source of samples running as its own task.
#[async_trait]
pub trait TransportReader: Send {
    /// Short identifier used in logs and errors, e.g. `serial:port1`.
    fn name(&self) -> &str;

    /// Read until `shutdown` flips to `true`.
    ///
    /// Connection failures are handled inside, with backoff. An error is only
    /// returned when the reader cannot run at all (e.g. its transport is
    /// compiled out).
    async fn run(&mut self, sink: Communicator, shutdown: watch::Receiver<bool>) -> AppResult<()>;
}

/// Exponential reconnect delay.
///
/// Starts at `initial`, doubles after every failed attempt up to `max`, and
/// returns to `initial` after a successful connection.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_settings(&TransportSettings::default())
    }
}

impl Backoff {
    /// Create a backoff between `initial` and `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            current: initial,
            attempts: 0,
        }
    }

    /// Build from the `[transport]` section.
    pub fn from_settings(settings: &TransportSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.backoff_initial_ms),
            Duration::from_millis(settings.backoff_max_ms),
        )
    }

    /// Delay before the next attempt; grows the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Sleep for `delay` unless shutdown is requested first.
///
/// Returns `true` when the reader should stop.
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Decode one serial line into samples.
///
/// A line carries one JSON object mapping addresses to values; several objects
/// written back to back (`{...}{...}`) are split and decoded one by one. Entries
/// whose key is not a valid address are skipped with a warning, while a line
/// that is not JSON at all is an error.
pub fn decode_json_line(
    transport: &str,
    line: &str,
    timestamp: DateTime<Utc>,
) -> AppResult<Vec<Sample>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }

    let mut samples = Vec::new();
    for chunk in line.split("}{") {
        let mut object = String::with_capacity(chunk.len() + 2);
        if !chunk.starts_with('{') {
            object.push('{');
        }
        object.push_str(chunk);
        if !chunk.ends_with('}') {
            object.push('}');
        }

        let message: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&object)
            .map_err(|e| DaqError::transport(transport, format!("{e} in '{line}'")))?;
        for (topic, value) in message {
            match Sample::parse(&topic, Value::from(value), timestamp) {
                Ok(sample) => samples.push(sample),
                Err(e) => warn!(transport, %e, "skipping entry"),
            }
        }
    }
    Ok(samples)
}

/// Decode one publish/subscribe payload.
pub fn decode_payload(topic: &str, payload: &[u8], timestamp: DateTime<Utc>) -> AppResult<Sample> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| DaqError::transport(topic, format!("payload is not UTF-8: {e}")))?;
    Sample::parse(topic, Value::parse_payload(text), timestamp)
}
