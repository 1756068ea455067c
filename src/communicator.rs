//! Shared ingest buffer and unit liveness.
//!
//! The [`Communicator`] is the single point of truth for "what is the most recent
//! data from every remote unit, and is each unit alive". Every transport reader
//! holds a clone of the same handle and pushes samples through [`Communicator::ingest`];
//! the aggregator and the read-only query surface pull consistent views through
//! [`Communicator::snapshot`] and [`Communicator::unit_status`].
//!
//! All state lives behind one `parking_lot::RwLock`. An ingest, including its
//! preprocessing and trimming, happens entirely inside one write guard, so
//! readers either see the whole update or none of it. The lock is never held
//! across an `.await`.

use crate::config::{CommunicatorSettings, Settings, StatusSettings};
use crate::error::AppResult;
use crate::liveness::{LivenessThresholds, UnitStatus};
use crate::preprocess::{self, UnitConversion};
use crate::sample::{Address, Sample, Value};
use crate::trim::TrimPolicy;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Most recent value seen on one address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestValue {
    /// The reading.
    pub value: Value,
    /// When it arrived.
    pub timestamp: DateTime<Utc>,
}

/// Immutable view of the buffer at one instant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Latest value per address (the last one to arrive).
    pub values: BTreeMap<Address, LatestValue>,
    /// Last time each unit was heard from.
    pub last_seen: BTreeMap<String, DateTime<Utc>>,
}

impl Snapshot {
    /// Latest value of `address`, if any sample has arrived.
    pub fn get(&self, address: &Address) -> Option<&LatestValue> {
        self.values.get(address)
    }

    /// Latest value by address string.
    pub fn value(&self, address: &str) -> Option<&Value> {
        let address = Address::parse(address).ok()?;
        self.values.get(&address).map(|latest| &latest.value)
    }

    /// Number of addresses with at least one sample.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when nothing has been ingested yet.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Ingest counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommunicatorStats {
    /// Samples stored (after preprocessing expanded them).
    pub ingested: u64,
    /// Samples dropped by trimming.
    pub trimmed: u64,
    /// Samples older than the newest one already stored under their address.
    pub out_of_order: u64,
}

#[derive(Debug)]
struct Inner {
    policy: TrimPolicy,
    thresholds: LivenessThresholds,
    conversions: Vec<UnitConversion>,
    buffer: HashMap<Address, VecDeque<Sample>>,
    last_seen: HashMap<String, DateTime<Utc>>,
    expected_units: BTreeSet<String>,
    stats: CommunicatorStats,
}

impl Inner {
    fn store(&mut self, sample: Sample) {
        let unit = sample.unit_id();
        match self.last_seen.get_mut(unit) {
            Some(seen) => {
                if sample.timestamp > *seen {
                    *seen = sample.timestamp;
                }
            }
            None => {
                info!(unit, "first sample from unit");
                self.last_seen.insert(unit.to_string(), sample.timestamp);
            }
        }

        let history = self.buffer.entry(sample.address.clone()).or_default();
        if history
            .back()
            .is_some_and(|newest| sample.timestamp < newest.timestamp)
        {
            self.stats.out_of_order += 1;
            trace!(address = %sample.address, "out-of-order sample accepted");
        }
        history.push_back(sample);
        self.stats.ingested += 1;

        let excess = self.policy.excess(history.len());
        if excess > 0 {
            history.drain(..excess);
            self.stats.trimmed += excess as u64;
            debug!(removed = excess, kept = history.len(), "trimmed raw buffer");
        }
    }
}

/// Cheap-to-clone handle to the shared buffer.
#[derive(Debug, Clone)]
pub struct Communicator {
    inner: Arc<RwLock<Inner>>,
}

impl Communicator {
    /// Create an empty communicator with the given bounds.
    pub fn new(policy: TrimPolicy, thresholds: LivenessThresholds) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                policy,
                thresholds,
                conversions: Vec::new(),
                buffer: HashMap::new(),
                last_seen: HashMap::new(),
                expected_units: BTreeSet::new(),
                stats: CommunicatorStats::default(),
            })),
        }
    }

    /// Build a communicator from loaded settings.
    ///
    /// Units named by enabled transport readers are expected, so they are
    /// reported offline until their first sample.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        let communicator = Self::new(
            TrimPolicy::new(0, 0.0),
            LivenessThresholds::default(),
        );
        communicator.reconfigure(&settings.communicator, &settings.status)?;
        communicator.expect_units(
            settings
                .configured_addresses()
                .iter()
                .map(|a| a.unit_id().to_string()),
        );
        Ok(communicator)
    }

    /// Store a sample, apply ingest conversions and trim its key.
    ///
    /// Safe to call from any number of tasks; never blocks on I/O.
    pub fn ingest(&self, sample: Sample) {
        let mut inner = self.inner.write();
        let expanded = preprocess::expand(&inner.conversions, sample);
        for sample in expanded {
            inner.store(sample);
        }
    }

    /// Build and ingest a sample from its parts.
    pub fn ingest_parts(
        &self,
        unit_id: &str,
        topic: &str,
        value: Value,
        timestamp: DateTime<Utc>,
    ) -> AppResult<()> {
        let address = Address::from_parts(unit_id, topic)?;
        self.ingest(Sample::new(address, value, timestamp));
        Ok(())
    }

    /// Consistent view of the latest value per address.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read();
        let values = inner
            .buffer
            .iter()
            .filter_map(|(address, history)| {
                history.back().map(|newest| {
                    (
                        address.clone(),
                        LatestValue {
                            value: newest.value.clone(),
                            timestamp: newest.timestamp,
                        },
                    )
                })
            })
            .collect();
        let last_seen = inner
            .last_seen
            .iter()
            .map(|(unit, ts)| (unit.clone(), *ts))
            .collect();
        Snapshot {
            taken_at: Utc::now(),
            values,
            last_seen,
        }
    }

    /// Liveness of one unit at `now`.
    pub fn unit_status(&self, unit_id: &str, now: DateTime<Utc>) -> UnitStatus {
        let inner = self.inner.read();
        inner
            .thresholds
            .classify(inner.last_seen.get(unit_id).copied(), now)
    }

    /// Liveness of every known or expected unit at `now`.
    pub fn statuses(&self, now: DateTime<Utc>) -> BTreeMap<String, UnitStatus> {
        let inner = self.inner.read();
        inner
            .last_seen
            .keys()
            .chain(inner.expected_units.iter())
            .map(|unit| {
                let status = inner
                    .thresholds
                    .classify(inner.last_seen.get(unit).copied(), now);
                (unit.clone(), status)
            })
            .collect()
    }

    /// Recent samples of one address, oldest first.
    pub fn history(&self, address: &Address) -> Vec<Sample> {
        self.inner
            .read()
            .buffer
            .get(address)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Units heard from so far with their last-seen time.
    pub fn units(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.inner
            .read()
            .last_seen
            .iter()
            .map(|(unit, ts)| (unit.clone(), *ts))
            .collect()
    }

    /// Mark units as expected so they show up as offline before reporting.
    pub fn expect_units<I>(&self, units: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.inner.write().expected_units.extend(units);
    }

    /// Apply new trim bounds, thresholds and conversion rules.
    ///
    /// Everything is validated before anything is changed. Keys that are
    /// oversize under the new bounds shrink on their next ingest.
    pub fn reconfigure(
        &self,
        communicator: &CommunicatorSettings,
        status: &StatusSettings,
    ) -> AppResult<()> {
        let conversions = communicator
            .conversions
            .iter()
            .map(UnitConversion::from_rule)
            .collect::<AppResult<Vec<_>>>()?;
        let policy = TrimPolicy::new(communicator.max_values, communicator.trim_fraction);
        let thresholds = LivenessThresholds {
            noncomm: status.noncomm(),
            offline: status.offline(),
        };

        let mut inner = self.inner.write();
        inner.policy = policy;
        inner.thresholds = thresholds;
        inner.conversions = conversions;
        debug!(
            max_values = policy.capacity(),
            trim_fraction = policy.fraction(),
            "communicator reconfigured"
        );
        Ok(())
    }

    /// Current trim policy.
    pub fn policy(&self) -> TrimPolicy {
        self.inner.read().policy
    }

    /// Ingest counters.
    pub fn stats(&self) -> CommunicatorStats {
        self.inner.read().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn communicator(max_values: usize, fraction: f64) -> Communicator {
        Communicator::new(
            TrimPolicy::new(max_values, fraction),
            LivenessThresholds::default(),
        )
    }

    fn sample(addr: &str, value: i64, secs: i64) -> Sample {
        Sample::parse(addr, Value::Int(value), at(secs)).unwrap()
    }

    #[test]
    fn twenty_one_samples_leave_ten() {
        let comm = communicator(20, 0.5);
        let addr = Address::parse("rm2/wind/speed").unwrap();
        for i in 0..20 {
            comm.ingest(sample("rm2/wind/speed", i, i));
        }
        assert_eq!(comm.history(&addr).len(), 20);

        comm.ingest(sample("rm2/wind/speed", 20, 20));
        let history = comm.history(&addr);
        assert_eq!(history.len(), 10);
        let kept: Vec<Value> = history.into_iter().map(|s| s.value).collect();
        let expected: Vec<Value> = (11..=20).map(Value::Int).collect();
        assert_eq!(kept, expected);
        assert_eq!(comm.stats().trimmed, 11);
    }

    #[test]
    fn keys_are_bounded_independently() {
        let comm = communicator(5, 0.5);
        for i in 0..100 {
            comm.ingest(sample("rm1/gps/lat", i, i));
            if i % 10 == 0 {
                comm.ingest(sample("rm1/gps/long", i, i));
            }
            assert!(comm.history(&Address::parse("rm1/gps/lat").unwrap()).len() <= 5);
        }
        assert_eq!(
            comm.history(&Address::parse("rm1/gps/long").unwrap()).len(),
            5
        );
    }

    #[test]
    fn last_seen_never_moves_backward() {
        let comm = communicator(20, 0.5);
        comm.ingest(sample("rm1/gps/lat", 1, 50));
        comm.ingest(sample("rm1/gps/lat", 2, 10));
        assert_eq!(comm.units()["rm1"], at(50));
        assert_eq!(comm.stats().out_of_order, 1);

        // The late sample is still stored and is the latest arrival.
        let snap = comm.snapshot();
        assert_eq!(snap.value("rm1/gps/lat"), Some(&Value::Int(2)));
    }

    #[test]
    fn status_follows_last_seen() {
        let comm = communicator(20, 0.5);
        comm.ingest(sample("rm1/gps/lat", 1, 0));
        assert_eq!(comm.unit_status("rm1", at(20)), UnitStatus::Online);
        assert_eq!(comm.unit_status("rm1", at(45)), UnitStatus::Noncomm);
        assert_eq!(comm.unit_status("rm1", at(75)), UnitStatus::Offline);
        assert_eq!(comm.unit_status("rm7", at(0)), UnitStatus::Offline);
    }

    #[test]
    fn expected_units_reported_offline() {
        let comm = communicator(20, 0.5);
        comm.expect_units(["rm2".to_string()]);
        comm.ingest(sample("rm1/gps/lat", 1, 0));
        let statuses = comm.statuses(at(1));
        assert_eq!(statuses["rm1"], UnitStatus::Online);
        assert_eq!(statuses["rm2"], UnitStatus::Offline);
    }

    #[test]
    fn snapshot_is_detached_from_later_ingest() {
        let comm = communicator(20, 0.5);
        comm.ingest(sample("rm1/gps/lat", 1, 0));
        let snap = comm.snapshot();
        comm.ingest(sample("rm1/gps/lat", 2, 1));
        comm.ingest(sample("rm2/wind/speed", 3, 1));
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.value("rm1/gps/lat"), Some(&Value::Int(1)));
        assert_eq!(comm.snapshot().len(), 2);
    }

    #[test]
    fn concurrent_ingest_respects_bounds() {
        let comm = communicator(20, 0.5);
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let comm = comm.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        comm.ingest(sample("rm1/imu/heading", worker * 1000 + i, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let history = comm.history(&Address::parse("rm1/imu/heading").unwrap());
        assert!(!history.is_empty());
        assert!(history.len() <= 20);
        assert_eq!(comm.stats().ingested, 2000);
    }

    #[test]
    fn conversions_applied_at_ingest() {
        let comm = communicator(20, 0.5);
        let mut settings = CommunicatorSettings::default();
        settings.conversions.push(crate::config::ConversionRule {
            topic: "rm2/wind/speed".into(),
            target: Some("rm2/wind/knots".into()),
            scale: 2.0,
            offset: 0.0,
        });
        comm.reconfigure(&settings, &StatusSettings::default())
            .unwrap();
        comm.ingest(sample("rm2/wind/speed", 5, 0));
        let snap = comm.snapshot();
        assert_eq!(snap.value("rm2/wind/speed"), Some(&Value::Int(5)));
        assert_eq!(snap.value("rm2/wind/knots"), Some(&Value::Float(10.0)));
    }

    #[test]
    fn invalid_reconfigure_changes_nothing() {
        let comm = communicator(20, 0.5);
        let mut settings = CommunicatorSettings {
            max_values: 3,
            ..Default::default()
        };
        settings.conversions.push(crate::config::ConversionRule {
            topic: "not-an-address".into(),
            target: None,
            scale: 1.0,
            offset: 0.0,
        });
        let status = StatusSettings {
            timeout_noncomm: 5.0,
            timeout_offline: 10.0,
        };
        assert!(comm.reconfigure(&settings, &status).is_err());
        assert_eq!(comm.policy().capacity(), 20);

        comm.ingest(sample("rm1/gps/lat", 1, 0));
        assert_eq!(comm.unit_status("rm1", at(0) + Duration::seconds(20)), UnitStatus::Online);
    }

    #[test]
    fn from_settings_expects_configured_units() {
        let settings = Settings::from_toml_str(
            r#"
            [serial.port1]
            port = "/dev/ttyACM0"
            topics = ["rm2/wind/speed", "rm1/gps/lat"]
            "#,
        )
        .unwrap();
        let comm = Communicator::from_settings(&settings).unwrap();
        let statuses = comm.statuses(Utc::now());
        assert_eq!(statuses.get("rm1"), Some(&UnitStatus::Offline));
        assert_eq!(statuses.get("rm2"), Some(&UnitStatus::Offline));
        assert_eq!(comm.policy().capacity(), 1000);
    }

    #[test]
    fn ingest_parts_validates_topic() {
        let comm = communicator(20, 0.5);
        assert!(comm.ingest_parts("rm1", "gps/lat", Value::Float(1.0), at(0)).is_ok());
        assert!(comm.ingest_parts("rm1", "gps", Value::Float(1.0), at(0)).is_err());
    }
}
