//! Pipeline supervisor.
//!
//! The [`Recorder`] wires transport readers, the communicator, the aggregator
//! (or a replayer) and the active track together, and tears them down in a
//! fixed order:
//!
//! 1. transport readers
//! 2. aggregator or replayer
//! 3. checkpoint timer
//! 4. final checkpoint and archive
//! 5. release of the track
//!
//! The communicator outlives sessions so unit liveness stays visible between
//! recordings.

use crate::aggregator::{Aggregator, AggregatorHandle, AggregatorStats};
use crate::archive::{archive_track, TrackFile};
use crate::catalog::{TrackCatalog, TrackSelector};
use crate::communicator::{Communicator, CommunicatorStats, Snapshot};
use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::gps::GpsFields;
use crate::liveness::UnitStatus;
use crate::replay::ReplayHandle;
use crate::track::{SaveMode, Track, TrackOrigin, TrackSlot, TrackStatus};
use crate::transport::mqtt::{MqttPublisher, MqttReader};
use crate::transport::serial::SerialReader;
use crate::transport::TransportReader;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// How long a reader gets to notice shutdown before its task is aborted.
const READER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const MIN_CHECKPOINT_INTERVAL: Duration = Duration::from_millis(1);

/// Attempts at the final checkpoint before `stop` gives up and keeps the track.
const FINAL_CHECKPOINT_ATTEMPTS: u32 = 3;
const FINAL_CHECKPOINT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// What feeds the active track.
enum Feeder {
    Live(Arc<Aggregator>, AggregatorHandle),
    Replay(ReplayHandle),
}

struct Session {
    track: Arc<Track>,
    reader_shutdown: watch::Sender<bool>,
    readers: Vec<(String, JoinHandle<()>)>,
    publisher: Option<MqttPublisher>,
    feeder: Feeder,
    checkpoints: CheckpointTimer,
}

impl Session {
    fn mode(&self) -> &'static str {
        match self.feeder {
            Feeder::Live(..) => "live",
            Feeder::Replay(_) => "replay",
        }
    }
}

/// Periodic [`Track::checkpoint`] calls for one track.
struct CheckpointTimer {
    interval_tx: watch::Sender<Duration>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CheckpointTimer {
    fn spawn(track: Arc<Track>, period: Duration) -> Self {
        let (interval_tx, mut interval_rx) = watch::channel(period.max(MIN_CHECKPOINT_INTERVAL));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut period = *interval_rx.borrow();
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
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
                    }
                    _ = ticker.tick() => {
                        // Failures are counted in the track status and retried next tick.
                        let _ = track.checkpoint().await;
                    }
                }
            }
        });
        Self {
            interval_tx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    fn set_interval(&self, period: Duration) {
        let _ = self.interval_tx.send(period.max(MIN_CHECKPOINT_INTERVAL));
    }

    async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "checkpoint timer ended abnormally");
            }
        }
    }
}

/// Read-only view of the whole pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct RecorderStatus {
    /// `live`, `replay`, or `None` when idle.
    pub mode: Option<&'static str>,
    /// The active track.
    pub track: Option<TrackStatus>,
    /// Aggregation counters of the live session.
    pub aggregator: Option<AggregatorStats>,
    /// Replay progress as `(fed, total)`.
    pub replay: Option<(usize, usize)>,
    /// Ingest counters.
    pub communicator: CommunicatorStats,
    /// Every known or expected unit with its status.
    pub units: BTreeMap<String, UnitStatus>,
    /// Names of the running transport readers.
    pub readers: Vec<String>,
}

/// Result of [`Recorder::stop`].
#[derive(Debug, Clone)]
pub struct StopReport {
    /// Final state of the released track.
    pub track: TrackStatus,
    /// Archive written, `None` for an empty track.
    pub archive: Option<PathBuf>,
}

/// Starts, stops and reconfigures the recording pipeline.
pub struct Recorder {
    settings: Settings,
    communicator: Communicator,
    slot: TrackSlot,
    session: Option<Session>,
}

impl Recorder {
    /// Build an idle recorder.
    pub fn new(settings: Settings) -> AppResult<Self> {
        settings.validate()?;
        let communicator = Communicator::from_settings(&settings)?;
        Ok(Self {
            settings,
            communicator,
            slot: TrackSlot::new(),
            session: None,
        })
    }

    /// Active configuration.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Shared communicator.
    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    /// Latest value of every address.
    pub fn snapshot(&self) -> Snapshot {
        self.communicator.snapshot()
    }

    /// The active track, if recording.
    pub fn track(&self) -> Option<Arc<Track>> {
        self.slot.get()
    }

    /// Handle to the active-track slot.
    pub fn slot(&self) -> TrackSlot {
        self.slot.clone()
    }

    /// True while a session runs.
    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Catalog over the configured output directory.
    pub fn catalog(&self) -> TrackCatalog {
        TrackCatalog::from_settings(&self.settings)
    }

    /// Position fields from the `[gps]` section.
    pub fn gps_fields(&self) -> GpsFields {
        GpsFields::from_settings(&self.settings.gps)
    }

    /// Readers for every enabled transport in the configuration, plus a
    /// publisher on the broker connection when there is one.
    fn configured_readers(&self) -> (Vec<Box<dyn TransportReader>>, Option<MqttPublisher>) {
        let mut readers: Vec<Box<dyn TransportReader>> = Vec::new();
        for (key, serial) in &self.settings.serial {
            if serial.enabled {
                readers.push(Box::new(SerialReader::new(
                    key,
                    serial.clone(),
                    &self.settings.transport,
                )));
            }
        }
        let mut publisher = None;
        if let Some(mqtt) = self.settings.mqtt.as_ref().filter(|m| m.enabled) {
            let reader = MqttReader::new(mqtt, &self.settings.transport);
            publisher = Some(reader.publisher());
            readers.push(Box::new(reader));
        }
        (readers, publisher)
    }

    /// Start a live recording with the configured transports.
    pub fn start_live(&mut self) -> AppResult<Arc<Track>> {
        self.ensure_idle()?;
        let (readers, publisher) = self.configured_readers();
        self.launch_live(readers, publisher)
    }

    /// Start a live recording fed by the given readers.
    pub fn start_live_with(
        &mut self,
        readers: Vec<Box<dyn TransportReader>>,
    ) -> AppResult<Arc<Track>> {
        self.ensure_idle()?;
        self.launch_live(readers, None)
    }

    fn launch_live(
        &mut self,
        readers: Vec<Box<dyn TransportReader>>,
        publisher: Option<MqttPublisher>,
    ) -> AppResult<Arc<Track>> {
        let track = Arc::new(Track::from_settings(TrackOrigin::Live, &self.settings)?);
        self.slot.replace(Arc::clone(&track));

        let (reader_shutdown, shutdown_rx) = watch::channel(false);
        let readers = readers
            .into_iter()
            .map(|reader| self.spawn_reader(reader, shutdown_rx.clone()))
            .collect();

        let aggregator = Arc::new(Aggregator::new(
            self.communicator.clone(),
            self.slot.clone(),
            self.settings.configured_addresses(),
        ));
        let handle = aggregator.spawn(self.settings.aggregator.interval());
        let checkpoints = CheckpointTimer::spawn(
            Arc::clone(&track),
            self.settings.track.checkpoint_interval(),
        );

        info!(track = %track.id(), "live recording started");
        self.session = Some(Session {
            track: Arc::clone(&track),
            reader_shutdown,
            readers,
            publisher,
            feeder: Feeder::Live(aggregator, handle),
            checkpoints,
        });
        Ok(track)
    }

    fn spawn_reader(
        &self,
        mut reader: Box<dyn TransportReader>,
        shutdown: watch::Receiver<bool>,
    ) -> (String, JoinHandle<()>) {
        let name = reader.name().to_string();
        let sink = self.communicator.clone();
        let label = name.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = reader.run(sink, shutdown).await {
                error!(reader = %label, error = %e, "transport reader stopped");
            }
        });
        (name, task)
    }

    /// Replay a stored track file through a new track.
    pub fn start_replay(&mut self, path: impl AsRef<Path>) -> AppResult<Arc<Track>> {
        self.ensure_idle()?;
        let file = TrackFile::load(path.as_ref())?;
        let track = Arc::new(Track::from_settings(
            TrackOrigin::Replay(file.path().to_path_buf()),
            &self.settings,
        )?);
        self.slot.replace(Arc::clone(&track));

        let total = file.len();
        let replay = ReplayHandle::spawn(file, self.slot.clone(), self.settings.aggregator.interval());
        let checkpoints = CheckpointTimer::spawn(
            Arc::clone(&track),
            self.settings.track.checkpoint_interval(),
        );
        let (reader_shutdown, _) = watch::channel(false);

        info!(track = %track.id(), source = %path.as_ref().display(), records = total, "replay started");
        self.session = Some(Session {
            track: Arc::clone(&track),
            reader_shutdown,
            readers: Vec::new(),
            publisher: None,
            feeder: Feeder::Replay(replay),
            checkpoints,
        });
        Ok(track)
    }

    /// Replay the stored track named by an index into the catalog or a filename.
    pub fn start_replay_selected(&mut self, selector: &TrackSelector) -> AppResult<Arc<Track>> {
        let path = self.catalog().resolve(selector)?;
        self.start_replay(path)
    }

    /// Stop the session, archive the track and release it.
    ///
    /// If the final checkpoint keeps failing, the feeders stay stopped but the
    /// track is kept and the error returned; calling `stop` again retries.
    /// Once everything is durable the track is released even when writing the
    /// archive fails: its checkpoint files stay on disk and the catalog keeps
    /// listing them.
    pub async fn stop(&mut self) -> AppResult<StopReport> {
        let mut session = self.session.take().ok_or(DaqError::NotRunning)?;
        info!(track = %session.track.id(), mode = session.mode(), "stopping recording");

        let _ = session.reader_shutdown.send(true);
        let reader_stops = session.readers.drain(..).map(|(name, task)| async move {
            let abort = task.abort_handle();
            match time::timeout(READER_STOP_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(reader = %name, error = %e, "reader task ended abnormally"),
                Err(_) => {
                    warn!(reader = %name, "reader ignored shutdown, aborting");
                    abort.abort();
                }
            }
        });
        join_all(reader_stops).await;

        match &mut session.feeder {
            Feeder::Live(_, handle) => handle.stop().await,
            Feeder::Replay(replay) => {
                let fed = replay.stop().await;
                info!(records = fed, "replay stopped");
            }
        }
        session.checkpoints.stop().await;

        if let Err(e) = final_checkpoint(&session.track).await {
            error!(track = %session.track.id(), error = %e, "final checkpoint failed, track kept");
            self.session = Some(session);
            return Err(e);
        }
        let archived = archive_track(&session.track).await;
        self.slot.take();
        let report = StopReport {
            track: session.track.status(),
            archive: archived?,
        };
        info!(track = %report.track.id, total = report.track.total, "recording stopped");
        Ok(report)
    }

    /// Validate `settings` completely, then apply them to the running pipeline.
    ///
    /// On error nothing changes. Transport sections only take effect on the next
    /// start.
    pub async fn reload_config(&mut self, settings: Settings) -> AppResult<()> {
        settings.validate()?;
        self.communicator
            .reconfigure(&settings.communicator, &settings.status)?;
        self.communicator.expect_units(
            settings
                .configured_addresses()
                .iter()
                .map(|a| a.unit_id().to_string()),
        );

        if let Some(session) = &self.session {
            if let Feeder::Live(aggregator, handle) = &session.feeder {
                aggregator.set_fields(settings.configured_addresses());
                handle.set_interval(settings.aggregator.interval());
            }
            session
                .checkpoints
                .set_interval(settings.track.checkpoint_interval());
            session.track.reconfigure(&settings.track).await;
            if settings.serial != self.settings.serial || settings.mqtt != self.settings.mqtt {
                info!("transport changes apply to the next recording");
            }
        }

        self.settings = settings;
        info!("configuration reloaded");
        Ok(())
    }

    /// Load the file at `path` (plus environment) and apply it.
    pub async fn reload_from(&mut self, path: impl AsRef<Path>) -> AppResult<()> {
        let settings = Settings::load_from(path)?;
        self.reload_config(settings).await
    }

    /// Change the save mode of the active track.
    pub fn set_save_mode(&self, mode: SaveMode) -> AppResult<()> {
        self.active_track()?.set_save_mode(mode);
        Ok(())
    }

    /// Begin an on-demand capture on the active track.
    pub fn start_capture(&self) -> AppResult<()> {
        self.active_track()?.start_capture()
    }

    /// End an on-demand capture on the active track.
    pub fn stop_capture(&self) -> AppResult<()> {
        self.active_track()?.stop_capture()
    }

    /// Record a single tick on the active track.
    pub fn request_capture(&self) -> AppResult<()> {
        self.active_track()?.request_capture()
    }

    /// Send a command to a unit over the broker connection of the live session.
    pub fn send_command(&self, unit_id: &str, command: &str) -> AppResult<()> {
        let publisher = self
            .session
            .as_ref()
            .and_then(|s| s.publisher.as_ref())
            .ok_or_else(|| DaqError::transport("mqtt", "no broker connection"))?;
        publisher.send_command(unit_id, command)
    }

    /// Pipeline state for status displays.
    pub fn status(&self) -> RecorderStatus {
        let session = self.session.as_ref();
        RecorderStatus {
            mode: session.map(Session::mode),
            track: self.slot.get().map(|t| t.status()),
            aggregator: session.and_then(|s| match &s.feeder {
                Feeder::Live(aggregator, _) => Some(aggregator.stats()),
                Feeder::Replay(_) => None,
            }),
            replay: session.and_then(|s| match &s.feeder {
                Feeder::Replay(replay) => Some(replay.progress()),
                Feeder::Live(..) => None,
            }),
            communicator: self.communicator.stats(),
            units: self.communicator.statuses(Utc::now()),
            readers: session
                .map(|s| s.readers.iter().map(|(name, _)| name.clone()).collect())
                .unwrap_or_default(),
        }
    }

    fn active_track(&self) -> AppResult<Arc<Track>> {
        self.slot.get().ok_or(DaqError::NoActiveTrack)
    }

    fn ensure_idle(&self) -> AppResult<()> {
        match &self.session {
            Some(session) => Err(DaqError::AlreadyRunning(session.mode().to_string())),
            None => Ok(()),
        }
    }
}

/// Make every appended record durable, retrying a failed checkpoint.
async fn final_checkpoint(track: &Track) -> AppResult<()> {
    let mut attempt = 1;
    loop {
        match track.checkpoint().await {
            Ok(_) => return Ok(()),
            Err(e) if attempt < FINAL_CHECKPOINT_ATTEMPTS => {
                warn!(
                    track = %track.id(),
                    attempt,
                    error = %e,
                    "final checkpoint failed, retrying"
                );
                time::sleep(FINAL_CHECKPOINT_RETRY_DELAY).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
