//! Periodic snapshotting of the communicator into track records.
//!
//! Every `interval` the aggregator takes a [`Snapshot`], folds it into a small
//! per-field state machine (`{last_value, last_update}`) and appends one
//! [`AggregatedRecord`] to the active track. Fields that did not change since
//! the previous tick carry their last value forward; configured fields that
//! never reported are recorded as `null`.
//!
//! Cycles never overlap. The timer loop runs each cycle inline with
//! `MissedTickBehavior::Skip`, so ticks missed while a slow cycle was running
//! are dropped and counted as overruns, and a cycle started from elsewhere while
//! one is in progress is skipped the same way.

use crate::communicator::{Communicator, Snapshot};
use crate::record::AggregatedRecord;
use crate::sample::{Address, Value};
use crate::track::{AppendOutcome, TrackSlot};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Suffix of the per-unit field holding the time of its newest sample.
pub const LAST_TIMESTAMP_FIELD: &str = "last_timestamp";

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Aggregation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    /// Cycles that ran.
    pub ticks: u64,
    /// Records the track stored.
    pub appended: u64,
    /// Records the track's save mode dropped.
    pub gated: u64,
    /// Cycles that found no active track.
    pub skipped_no_track: u64,
    /// Ticks skipped because the previous cycle was still running.
    pub overruns: u64,
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A record was produced and handed to the track.
    Recorded(AppendOutcome),
    /// Nothing is recording.
    NoTrack,
    /// Another cycle was in progress.
    Overrun,
    /// The track refused the record.
    Failed,
}

#[derive(Debug, Clone)]
struct FieldState {
    last_value: Value,
    last_update: DateTime<Utc>,
}

/// Turns communicator snapshots into records.
#[derive(Debug)]
pub struct Aggregator {
    communicator: Communicator,
    slot: TrackSlot,
    fields: Mutex<Vec<Address>>,
    cycle: tokio::sync::Mutex<BTreeMap<Address, FieldState>>,
    stats: Mutex<AggregatorStats>,
}

impl Aggregator {
    /// Create an aggregator over `communicator` feeding whatever track `slot` holds.
    ///
    /// `fields` are always present in records, even before their first sample.
    pub fn new(communicator: Communicator, slot: TrackSlot, fields: Vec<Address>) -> Self {
        Self {
            communicator,
            slot,
            fields: Mutex::new(fields),
            cycle: tokio::sync::Mutex::new(BTreeMap::new()),
            stats: Mutex::new(AggregatorStats::default()),
        }
    }

    /// Replace the always-present field list. Applied on the next tick.
    pub fn set_fields(&self, fields: Vec<Address>) {
        *self.fields.lock() = fields;
    }

    /// Counters so far.
    pub fn stats(&self) -> AggregatorStats {
        *self.stats.lock()
    }

    /// Run one aggregation cycle stamped `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let Ok(mut carry) = self.cycle.try_lock() else {
            self.stats.lock().overruns += 1;
            warn!("aggregation cycle still running, tick skipped");
            return TickOutcome::Overrun;
        };
        self.stats.lock().ticks += 1;

        let Some(track) = self.slot.get() else {
            self.stats.lock().skipped_no_track += 1;
            return TickOutcome::NoTrack;
        };

        let snapshot = self.communicator.snapshot();
        fold_snapshot(&mut carry, &snapshot);
        let fields = self.fields.lock().clone();
        let record = build_record(now, &carry, &fields);

        let outcome = match track.append(record).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(track = %track.id(), error = %e, "append failed");
                return TickOutcome::Failed;
            }
        };
        let mut stats = self.stats.lock();
        match outcome {
            AppendOutcome::Appended(_) => stats.appended += 1,
            AppendOutcome::Gated | AppendOutcome::OutOfOrder => stats.gated += 1,
        }
        TickOutcome::Recorded(outcome)
    }

    /// Start the timer loop.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> AggregatorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (interval_tx, interval_rx) = watch::channel(interval.max(MIN_INTERVAL));
        let aggregator = Arc::clone(self);
        let task = tokio::spawn(async move {
            aggregator.run(interval_rx, shutdown_rx).await;
        });
        AggregatorHandle {
            interval_tx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn run(
        &self,
        mut interval_rx: watch::Receiver<Duration>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut period = *interval_rx.borrow();
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = period.as_millis() as u64, "aggregator started");

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    period = *interval_rx.borrow();
                    ticker = time::interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    info!(interval_ms = period.as_millis() as u64, "aggregation interval changed");
                }
                _ = ticker.tick() => {
                    let started = Instant::now();
                    self.tick(Utc::now()).await;
                    let elapsed = started.elapsed();
                    if elapsed > period {
                        let missed = (elapsed.as_nanos() / period.as_nanos().max(1)) as u64;
                        self.stats.lock().overruns += missed;
                        warn!(elapsed_ms = elapsed.as_millis() as u64, missed, "aggregation overran its interval");
                    }
                }
            }
        }
        info!("aggregator stopped");
    }
}

/// Control handle for a running aggregator loop.
#[derive(Debug)]
pub struct AggregatorHandle {
    interval_tx: watch::Sender<Duration>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AggregatorHandle {
    /// Change the period; takes effect after the current cycle.
    pub fn set_interval(&self, interval: Duration) {
        let _ = self.interval_tx.send(interval.max(MIN_INTERVAL));
    }

    /// Stop the loop and wait for the running cycle to finish.
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "aggregator task ended abnormally");
            }
        }
    }
}

fn fold_snapshot(carry: &mut BTreeMap<Address, FieldState>, snapshot: &Snapshot) {
    for (address, latest) in &snapshot.values {
        match carry.get_mut(address) {
            Some(state) if latest.timestamp < state.last_update => {}
            Some(state) => {
                state.last_value = latest.value.clone();
                state.last_update = latest.timestamp;
            }
            None => {
                debug!(%address, "new field");
                carry.insert(
                    address.clone(),
                    FieldState {
                        last_value: latest.value.clone(),
                        last_update: latest.timestamp,
                    },
                );
            }
        }
    }
}

fn build_record(
    now: DateTime<Utc>,
    carry: &BTreeMap<Address, FieldState>,
    fields: &[Address],
) -> AggregatedRecord {
    let mut values = BTreeMap::new();
    for field in fields {
        values.insert(field.to_string(), Value::Null);
    }

    let mut newest: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
    for (address, state) in carry {
        values.insert(address.to_string(), state.last_value.clone());
        newest
            .entry(address.unit_id())
            .and_modify(|ts| *ts = (*ts).max(state.last_update))
            .or_insert(state.last_update);
    }
    for (unit, ts) in newest {
        values.insert(
            format!("{unit}/{LAST_TIMESTAMP_FIELD}"),
            Value::Text(ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }
    AggregatedRecord::new(now, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackSettings;
    use crate::liveness::LivenessThresholds;
    use crate::sample::Sample;
    use crate::track::{SaveMode, Track, TrackOrigin};
    use crate::trim::TrimPolicy;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn setup(dir: &std::path::Path) -> (Communicator, TrackSlot, Arc<Aggregator>) {
        let communicator = Communicator::new(TrimPolicy::new(20, 0.5), LivenessThresholds::default());
        let slot = TrackSlot::new();
        let fields = vec![
            Address::parse("rm1/gps/lat").unwrap(),
            Address::parse("rm2/wind/speed").unwrap(),
        ];
        let aggregator = Arc::new(Aggregator::new(communicator.clone(), slot.clone(), fields));
        let track = Track::create(
            TrackOrigin::Live,
            &TrackSettings::default(),
            SaveMode::Continuous,
            dir,
        )
        .unwrap();
        slot.replace(Arc::new(track));
        (communicator, slot, aggregator)
    }

    #[tokio::test]
    async fn no_track_means_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let (_, slot, aggregator) = setup(dir.path());
        slot.take();
        assert_eq!(aggregator.tick(at(0)).await, TickOutcome::NoTrack);
        assert_eq!(aggregator.stats().skipped_no_track, 1);
        assert_eq!(aggregator.stats().appended, 0);
    }

    #[tokio::test]
    async fn values_carry_forward() {
        let dir = tempfile::tempdir().unwrap();
        let (communicator, slot, aggregator) = setup(dir.path());
        communicator.ingest(Sample::parse("rm1/gps/lat", Value::Float(45.1), at(0)).unwrap());
        aggregator.tick(at(1)).await;
        aggregator.tick(at(2)).await;
        communicator.ingest(Sample::parse("rm1/gps/lat", Value::Float(45.2), at(2)).unwrap());
        aggregator.tick(at(3)).await;

        let records = slot.get().unwrap().records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].get("rm1/gps/lat"), Some(&Value::Float(45.1)));
        assert_eq!(records[1].get("rm1/gps/lat"), Some(&Value::Float(45.1)));
        assert_eq!(records[2].get("rm1/gps/lat"), Some(&Value::Float(45.2)));
        assert_eq!(records[2].timestamp, at(3));
        assert_eq!(records[0].get("rm2/wind/speed"), Some(&Value::Null));
        assert_eq!(
            records[2].get("rm1/last_timestamp"),
            Some(&Value::Text("2023-11-14T22:13:22.000Z".into()))
        );
        assert!(records[2].get("rm2/last_timestamp").is_none());
        assert_eq!(aggregator.stats().appended, 3);
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, aggregator) = setup(dir.path());
        let guard = aggregator.cycle.lock().await;
        assert_eq!(aggregator.tick(at(0)).await, TickOutcome::Overrun);
        drop(guard);
        assert!(matches!(aggregator.tick(at(1)).await, TickOutcome::Recorded(_)));
        assert_eq!(aggregator.stats().overruns, 1);
        assert_eq!(aggregator.stats().ticks, 1);
    }

    #[tokio::test]
    async fn gated_records_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let (_, slot, aggregator) = setup(dir.path());
        slot.get().unwrap().set_save_mode(SaveMode::OnDemand);
        assert_eq!(
            aggregator.tick(at(0)).await,
            TickOutcome::Recorded(AppendOutcome::Gated)
        );
        assert_eq!(aggregator.stats().gated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_loop_ticks_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (_, slot, aggregator) = setup(dir.path());
        let mut handle = aggregator.spawn(Duration::from_secs(1));

        time::sleep(Duration::from_millis(4500)).await;
        handle.set_interval(Duration::from_secs(2));
        time::sleep(Duration::from_millis(4100)).await;
        handle.stop().await;

        // Ticks at 0..=4 s, then at 6.5 and 8.5 s after the interval change.
        assert_eq!(aggregator.stats().ticks, 7);
        assert_eq!(slot.get().unwrap().len(), 7);
    }
}
