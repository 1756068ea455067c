//! Replay of stored tracks.
//!
//! A replayer takes the place of the aggregator: it feeds the records of a
//! [`TrackFile`] into the active track through the normal append path, one per
//! interval, so readers of the track see the same progressive growth as during a
//! live recording.

use crate::archive::TrackFile;
use crate::record::AggregatedRecord;
use crate::track::TrackSlot;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

/// Handle to a running replay.
#[derive(Debug)]
pub struct ReplayHandle {
    total: usize,
    fed: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ReplayHandle {
    /// Start feeding `file` into whatever track `slot` holds.
    pub fn spawn(file: TrackFile, slot: TrackSlot, interval: Duration) -> Self {
        let source = file.path().display().to_string();
        let records = file.into_records();
        let total = records.len();
        let fed = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let counter = Arc::clone(&fed);
        let task = tokio::spawn(async move {
            feed(records, slot, interval, counter, shutdown_rx).await;
            info!(source = %source, "replay finished");
        });

        Self {
            total,
            fed,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Records handed to the track so far and the total in the file.
    pub fn progress(&self) -> (usize, usize) {
        (self.fed.load(Ordering::Relaxed), self.total)
    }

    /// True once every record was fed or the replay was stopped.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop feeding and wait for the task. Returns the number of records fed.
    pub async fn stop(&mut self) -> usize {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "replay task ended abnormally");
            }
        }
        self.fed.load(Ordering::Relaxed)
    }
}

async fn feed(
    records: Vec<AggregatedRecord>,
    slot: TrackSlot,
    interval: Duration,
    fed: Arc<AtomicUsize>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    for record in records {
        tokio::select! {
            _ = &mut shutdown_rx => return,
            _ = ticker.tick() => {}
        }
        let Some(track) = slot.get() else {
            return;
        };
        if let Err(e) = track.append(record).await {
            warn!(track = %track.id(), error = %e, "replayed record rejected");
        }
        fed.fetch_add(1, Ordering::Relaxed);
    }
}
