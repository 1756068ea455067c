//! Recording sessions.
//!
//! A [`Track`] is the append-only series of [`AggregatedRecord`]s of one
//! recording (live or replayed). It owns:
//!
//! - the in-memory window of records, bounded by a [`TrimPolicy`]
//! - the checkpoint cursor and the [`CheckpointStore`] behind it
//! - the save-mode state machine deciding which records are kept
//!
//! Records are addressed by absolute index. `base_index` is the index of the
//! oldest record still in memory and `cursor` is the first index not yet durable;
//! `base_index <= cursor <= next_index` always holds, so trimming (which only
//! moves `base_index`) can never drop a record that was not checkpointed.
//!
//! # Checkpointing
//!
//! [`Track::checkpoint`] copies the delta `[cursor, next_index)` under the state
//! lock, writes it on the blocking pool with the lock released, and only then
//! advances the cursor. An async mutex around the store serializes checkpoints,
//! so a request that arrives while a write is in flight waits for it instead of
//! running concurrently.

use crate::checkpoint::CheckpointStore;
use crate::config::{Settings, TrackSettings};
use crate::error::{AppResult, DaqError};
use crate::record::{AggregatedRecord, IndexedRecord};
use crate::trim::TrimPolicy;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Which records a track keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaveMode {
    /// Every aggregator tick is recorded.
    #[default]
    Continuous,
    /// Only ticks inside a capture (or a single requested capture) are recorded.
    OnDemand,
}

impl fmt::Display for SaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveMode::Continuous => f.write_str("continuous"),
            SaveMode::OnDemand => f.write_str("on-demand"),
        }
    }
}

impl std::str::FromStr for SaveMode {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continuous" => Ok(SaveMode::Continuous),
            "on-demand" | "on_demand" | "ondemand" => Ok(SaveMode::OnDemand),
            other => Err(DaqError::InvalidSaveMode(format!("unknown save mode '{other}'"))),
        }
    }
}

/// Save-mode state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaveState {
    /// Recording every tick.
    Continuous,
    /// On-demand, discarding ticks.
    OnDemandIdle,
    /// On-demand, recording every tick until the capture stops.
    OnDemandCapturing,
}

impl SaveState {
    /// Mode this state belongs to.
    pub fn mode(self) -> SaveMode {
        match self {
            SaveState::Continuous => SaveMode::Continuous,
            SaveState::OnDemandIdle | SaveState::OnDemandCapturing => SaveMode::OnDemand,
        }
    }

    fn initial(mode: SaveMode) -> Self {
        match mode {
            SaveMode::Continuous => SaveState::Continuous,
            SaveMode::OnDemand => SaveState::OnDemandIdle,
        }
    }
}

/// Where a track's records come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "source")]
pub enum TrackOrigin {
    /// Fed by the aggregator.
    Live,
    /// Fed from a stored track file.
    Replay(PathBuf),
}

/// Result of [`Track::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored at this absolute index.
    Appended(u64),
    /// Dropped by the save mode.
    Gated,
    /// Dropped because it is older than the newest record.
    OutOfOrder,
}

/// Result of [`Track::checkpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Nothing new since the last checkpoint.
    Unchanged,
    /// A checkpoint with `records` records was written and the cursor moved.
    Written {
        /// New checkpoint file.
        path: PathBuf,
        /// Records in the delta.
        records: usize,
        /// Cursor after the write.
        cursor: u64,
    },
}

/// Read-only view of a track for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct TrackStatus {
    /// Track id.
    pub id: String,
    /// Live or replay.
    pub origin: TrackOrigin,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Save-mode state.
    pub save_state: SaveState,
    /// Records in memory.
    pub in_memory: usize,
    /// Records appended so far (absolute index of the next record).
    pub total: u64,
    /// Oldest index in memory.
    pub base_index: u64,
    /// First index not yet durable.
    pub checkpoint_cursor: u64,
    /// Completed checkpoints.
    pub checkpoints_written: u64,
    /// Failed checkpoint attempts.
    pub checkpoint_failures: u64,
    /// Message of the most recent failure, cleared on success.
    pub last_checkpoint_error: Option<String>,
    /// Records dropped by the save mode or for being out of order.
    pub discarded: u64,
    /// Records dropped from memory by trimming (still durable).
    pub trimmed: u64,
}

#[derive(Debug)]
struct TrackState {
    records: VecDeque<AggregatedRecord>,
    base_index: u64,
    cursor: u64,
    save_state: SaveState,
    capture_once: bool,
    policy: TrimPolicy,
    checkpoints_written: u64,
    checkpoint_failures: u64,
    last_checkpoint_error: Option<String>,
    discarded: u64,
    trimmed: u64,
}

impl TrackState {
    fn next_index(&self) -> u64 {
        self.base_index + self.records.len() as u64
    }

    fn accepts(&mut self) -> bool {
        match self.save_state {
            SaveState::Continuous | SaveState::OnDemandCapturing => true,
            SaveState::OnDemandIdle => std::mem::take(&mut self.capture_once),
        }
    }

    /// Whether pushing one more record would trim past the cursor.
    fn needs_flush(&self) -> bool {
        let excess = self.policy.excess(self.records.len() + 1) as u64;
        excess > 0 && self.base_index + excess > self.cursor
    }

    /// Drop the oldest records over capacity, never past the cursor.
    fn trim(&mut self) {
        let excess = self.policy.excess(self.records.len());
        if excess == 0 {
            return;
        }
        let durable = (self.cursor - self.base_index) as usize;
        let drop = excess.min(durable);
        if drop < excess {
            warn!(
                pending = excess - drop,
                "trim deferred until records are checkpointed"
            );
        }
        if drop > 0 {
            self.records.drain(..drop);
            self.base_index += drop as u64;
            self.trimmed += drop as u64;
            debug!(removed = drop, kept = self.records.len(), "trimmed track");
        }
    }
}

/// One recording session. Shared as `Arc<Track>`.
#[derive(Debug)]
pub struct Track {
    id: String,
    origin: TrackOrigin,
    created_at: DateTime<Utc>,
    output_dir: PathBuf,
    state: RwLock<TrackState>,
    store: Arc<tokio::sync::Mutex<CheckpointStore>>,
}

impl Track {
    /// Create a track storing its checkpoints under `output_dir/chk`.
    pub fn create(
        origin: TrackOrigin,
        settings: &TrackSettings,
        save_mode: SaveMode,
        output_dir: &Path,
    ) -> AppResult<Self> {
        let created_at = Utc::now();
        let id = format!(
            "{}-{}",
            created_at.format("%Y%m%d-%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let store = CheckpointStore::open(output_dir, &id, settings.max_checkpoint_files)?;
        info!(track = %id, ?origin, mode = %save_mode, "track created");
        Ok(Self {
            id,
            origin,
            created_at,
            output_dir: output_dir.to_path_buf(),
            state: RwLock::new(TrackState {
                records: VecDeque::new(),
                base_index: 0,
                cursor: 0,
                save_state: SaveState::initial(save_mode),
                capture_once: false,
                policy: TrimPolicy::new(settings.max_datapoints, settings.trim_fraction),
                checkpoints_written: 0,
                checkpoint_failures: 0,
                last_checkpoint_error: None,
                discarded: 0,
                trimmed: 0,
            }),
            store: Arc::new(tokio::sync::Mutex::new(store)),
        })
    }

    /// Create a track from the loaded settings.
    pub fn from_settings(origin: TrackOrigin, settings: &Settings) -> AppResult<Self> {
        Self::create(
            origin,
            &settings.track,
            settings.saving.default_mode,
            &settings.files.output_dir,
        )
    }

    /// Track id, also the prefix of its checkpoint files.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Live or replay.
    pub fn origin(&self) -> &TrackOrigin {
        &self.origin
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Storage root.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Add a record if the save mode allows it, then trim.
    ///
    /// When the trim would drop records that are not durable yet, a checkpoint
    /// is forced first. If that checkpoint fails the trim is postponed, so memory
    /// may exceed `max_datapoints` until storage recovers.
    pub async fn append(&self, record: AggregatedRecord) -> AppResult<AppendOutcome> {
        let needs_flush = {
            let mut state = self.state.write();
            if let Some(last) = state.records.back() {
                if record.timestamp < last.timestamp {
                    state.discarded += 1;
                    warn!(track = %self.id, "out-of-order record discarded");
                    return Ok(AppendOutcome::OutOfOrder);
                }
            }
            if !state.accepts() {
                state.discarded += 1;
                return Ok(AppendOutcome::Gated);
            }
            state.needs_flush()
        };

        if needs_flush {
            if let Err(e) = self.checkpoint().await {
                error!(track = %self.id, error = %e, "flush before trim failed");
            }
        }

        let mut state = self.state.write();
        let index = state.next_index();
        state.records.push_back(record);
        state.trim();
        Ok(AppendOutcome::Appended(index))
    }

    /// Write the records past the cursor as a new checkpoint.
    ///
    /// A no-op when nothing was appended since the last checkpoint. On failure
    /// the cursor stays where it was and the next call retries the same records.
    pub async fn checkpoint(&self) -> AppResult<CheckpointOutcome> {
        let mut store = Arc::clone(&self.store).lock_owned().await;

        let (start, delta) = {
            let state = self.state.read();
            let offset = (state.cursor - state.base_index) as usize;
            let delta: Vec<AggregatedRecord> = state.records.range(offset..).cloned().collect();
            (state.cursor, delta)
        };
        if delta.is_empty() {
            return Ok(CheckpointOutcome::Unchanged);
        }
        let count = delta.len();
        let end = start + count as u64;

        let written = tokio::task::spawn_blocking(move || store.write(start, &delta))
            .await
            .map_err(join_error)
            .and_then(|result| result);

        let mut state = self.state.write();
        match written {
            Ok(path) => {
                state.cursor = state.cursor.max(end);
                state.checkpoints_written += 1;
                state.last_checkpoint_error = None;
                // Records held back by a failed flush can go now.
                state.trim();
                info!(track = %self.id, records = count, cursor = state.cursor, "checkpoint complete");
                Ok(CheckpointOutcome::Written {
                    path,
                    records: count,
                    cursor: state.cursor,
                })
            }
            Err(e) => {
                state.checkpoint_failures += 1;
                state.last_checkpoint_error = Some(e.to_string());
                error!(track = %self.id, error = %e, "checkpoint failed, will retry");
                Err(e)
            }
        }
    }

    /// Every durable record, oldest first, including those trimmed from memory.
    pub async fn durable_records(&self) -> AppResult<Vec<IndexedRecord>> {
        let store = Arc::clone(&self.store).lock_owned().await;
        tokio::task::spawn_blocking(move || store.recover())
            .await
            .map_err(join_error)?
    }

    /// Delete this track's checkpoint files. Used once the track is archived.
    pub async fn discard_checkpoints(&self) -> AppResult<usize> {
        let store = Arc::clone(&self.store).lock_owned().await;
        tokio::task::spawn_blocking(move || store.remove_all())
            .await
            .map_err(join_error)?
    }

    /// Current save mode.
    pub fn save_mode(&self) -> SaveMode {
        self.state.read().save_state.mode()
    }

    /// Current save-mode state.
    pub fn save_state(&self) -> SaveState {
        self.state.read().save_state
    }

    /// Switch between continuous and on-demand. Buffered records are kept.
    pub fn set_save_mode(&self, mode: SaveMode) {
        let mut state = self.state.write();
        if state.save_state.mode() != mode {
            state.save_state = SaveState::initial(mode);
            state.capture_once = false;
            info!(track = %self.id, %mode, "save mode changed");
        }
    }

    /// Start recording every tick while in on-demand mode.
    pub fn start_capture(&self) -> AppResult<()> {
        let mut state = self.state.write();
        match state.save_state {
            SaveState::OnDemandIdle => {
                state.save_state = SaveState::OnDemandCapturing;
                info!(track = %self.id, "capture started");
                Ok(())
            }
            SaveState::OnDemandCapturing => Ok(()),
            SaveState::Continuous => Err(DaqError::InvalidSaveMode(
                "cannot start a capture in continuous mode".into(),
            )),
        }
    }

    /// Stop an on-demand capture.
    pub fn stop_capture(&self) -> AppResult<()> {
        let mut state = self.state.write();
        match state.save_state {
            SaveState::OnDemandCapturing => {
                state.save_state = SaveState::OnDemandIdle;
                info!(track = %self.id, "capture stopped");
                Ok(())
            }
            SaveState::OnDemandIdle => Ok(()),
            SaveState::Continuous => Err(DaqError::InvalidSaveMode(
                "no capture to stop in continuous mode".into(),
            )),
        }
    }

    /// Record only the next tick while in on-demand mode.
    pub fn request_capture(&self) -> AppResult<()> {
        let mut state = self.state.write();
        if state.save_state == SaveState::Continuous {
            return Err(DaqError::InvalidSaveMode(
                "single captures need on-demand mode".into(),
            ));
        }
        state.capture_once = true;
        Ok(())
    }

    /// Apply new trim bounds and retention. Existing records are trimmed on the
    /// next append.
    pub async fn reconfigure(&self, settings: &TrackSettings) {
        self.state.write().policy = TrimPolicy::new(settings.max_datapoints, settings.trim_fraction);
        self.store
            .lock()
            .await
            .set_max_files(settings.max_checkpoint_files);
    }

    /// Records in memory.
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    /// True when no record is in memory.
    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    /// Index of the oldest record in memory.
    pub fn base_index(&self) -> u64 {
        self.state.read().base_index
    }

    /// Index the next record will get.
    pub fn next_index(&self) -> u64 {
        self.state.read().next_index()
    }

    /// First index not yet durable.
    pub fn checkpoint_cursor(&self) -> u64 {
        self.state.read().cursor
    }

    /// Up to `limit` in-memory records starting at absolute index `from`.
    ///
    /// Indices older than the in-memory window start at the oldest record kept.
    pub fn window(&self, from: u64, limit: usize) -> Vec<IndexedRecord> {
        let state = self.state.read();
        let start = from.max(state.base_index);
        let offset = (start - state.base_index) as usize;
        state
            .records
            .iter()
            .skip(offset)
            .take(limit)
            .enumerate()
            .map(|(i, record)| IndexedRecord {
                index: start + i as u64,
                record: record.clone(),
            })
            .collect()
    }

    /// All in-memory records, oldest first.
    pub fn records(&self) -> Vec<AggregatedRecord> {
        self.state.read().records.iter().cloned().collect()
    }

    /// Most recent record.
    pub fn latest(&self) -> Option<AggregatedRecord> {
        self.state.read().records.back().cloned()
    }

    /// Every field name appearing in the in-memory records.
    pub fn field_names(&self) -> BTreeSet<String> {
        self.state
            .read()
            .records
            .iter()
            .flat_map(|r| r.values.keys().cloned())
            .collect()
    }

    /// Snapshot of counters and state.
    pub fn status(&self) -> TrackStatus {
        let state = self.state.read();
        TrackStatus {
            id: self.id.clone(),
            origin: self.origin.clone(),
            created_at: self.created_at,
            save_state: state.save_state,
            in_memory: state.records.len(),
            total: state.next_index(),
            base_index: state.base_index,
            checkpoint_cursor: state.cursor,
            checkpoints_written: state.checkpoints_written,
            checkpoint_failures: state.checkpoint_failures,
            last_checkpoint_error: state.last_checkpoint_error.clone(),
            discarded: state.discarded,
            trimmed: state.trimmed,
        }
    }
}

/// The active track, shared between the recorder, the aggregator and readers.
///
/// Empty while nothing is recording.
#[derive(Debug, Clone, Default)]
pub struct TrackSlot {
    inner: Arc<RwLock<Option<Arc<Track>>>>,
}

impl TrackSlot {
    /// Empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// The active track, if any.
    pub fn get(&self) -> Option<Arc<Track>> {
        self.inner.read().clone()
    }

    /// Install `track`, returning the previous one.
    pub fn replace(&self, track: Arc<Track>) -> Option<Arc<Track>> {
        self.inner.write().replace(track)
    }

    /// Remove the active track.
    pub fn take(&self) -> Option<Arc<Track>> {
        self.inner.write().take()
    }

    /// True while a track is installed.
    pub fn is_active(&self) -> bool {
        self.inner.read().is_some()
    }
}

fn join_error(e: tokio::task::JoinError) -> DaqError {
    DaqError::Io(std::io::Error::other(format!("blocking task failed: {e}")))
}
