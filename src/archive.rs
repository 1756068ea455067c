//! Stored track files.
//!
//! An archived track is a JSON array of `{timestamp, input_data}` objects under
//! the output directory, named after the time the track was created
//! (`<YYYYmmdd-HHMMSS>.json`). [`TrackFile::load`] reads those as well as
//! checkpoint files: loading any checkpoint of a crashed session merges every
//! durable record of that track, so it replays from the first record.

use crate::checkpoint::{parse_checkpoint_name, write_atomic, CheckpointFile, CheckpointStore};
use crate::error::{AppResult, DaqError};
use crate::record::AggregatedRecord;
use crate::track::Track;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Timestamp layout used in archive file names.
pub const ARCHIVE_NAME_FORMAT: &str = "%Y%m%d-%H%M%S";

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredLayout {
    Archive(Vec<AggregatedRecord>),
    Checkpoint(CheckpointFile),
}

/// A track loaded from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackFile {
    path: PathBuf,
    records: Vec<AggregatedRecord>,
    track_id: Option<String>,
}

impl TrackFile {
    /// Read an archive, or the full durable series of the track a checkpoint
    /// file belongs to.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| DaqError::TrackLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let layout: StoredLayout =
            serde_json::from_slice(&bytes).map_err(|e| DaqError::TrackLoad {
                path: path.to_path_buf(),
                message: format!("not a track file: {e}"),
            })?;
        let (records, track_id) = match layout {
            StoredLayout::Archive(records) => (records, None),
            StoredLayout::Checkpoint(file) => {
                let records = recover_checkpointed(path, &file)?.unwrap_or(file.records);
                (records, Some(file.track_id))
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            records,
            track_id,
        })
    }

    /// Where the file was read from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True for a checkpoint file.
    pub fn is_checkpoint(&self) -> bool {
        self.track_id.is_some()
    }

    /// Id of the crashed track a checkpoint file belongs to.
    pub fn track_id(&self) -> Option<&str> {
        self.track_id.as_deref()
    }

    /// The records in file order.
    pub fn records(&self) -> &[AggregatedRecord] {
        &self.records
    }

    /// Take the records.
    pub fn into_records(self) -> Vec<AggregatedRecord> {
        self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the file holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Timestamp of the first record.
    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.records.first().map(|r| r.timestamp)
    }

    /// Time between the first and the last record.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let first = self.records.first()?;
        let last = self.records.last()?;
        Some(last.timestamp - first.timestamp)
    }

    /// Unit ids contributing to the first record.
    pub fn remote_units(&self) -> BTreeSet<String> {
        self.records
            .first()
            .map(|r| {
                r.values
                    .keys()
                    .filter_map(|key| key.split('/').next())
                    .filter(|unit| !unit.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Every durable record of the track `file` belongs to, merged from its
/// sibling checkpoints and base segment.
///
/// `None` when `path` does not carry a checkpoint name of that track (a copy
/// renamed by hand); the caller then uses the file's own records.
fn recover_checkpointed(
    path: &Path,
    file: &CheckpointFile,
) -> AppResult<Option<Vec<AggregatedRecord>>> {
    let named = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(parse_checkpoint_name)
        .is_some_and(|(track_id, seq)| track_id == file.track_id && seq == file.seq);
    let Some(dir) = path.parent().filter(|_| named) else {
        return Ok(None);
    };
    let store = CheckpointStore::in_dir(dir, &file.track_id, 1)?;
    let records: Vec<AggregatedRecord> =
        store.recover()?.into_iter().map(|r| r.record).collect();
    debug!(
        path = %path.display(),
        track = %file.track_id,
        records = records.len(),
        "checkpointed track recovered"
    );
    Ok(Some(records))
}

/// First free `<YYYYmmdd-HHMMSS>[-n].json` path in `output_dir`.
pub fn archive_path(output_dir: &Path, created_at: DateTime<Utc>) -> PathBuf {
    let stem = created_at.format(ARCHIVE_NAME_FORMAT).to_string();
    let mut path = output_dir.join(format!("{stem}.json"));
    let mut n = 1;
    while path.exists() {
        path = output_dir.join(format!("{stem}-{n}.json"));
        n += 1;
    }
    path
}

/// Write `records` as an archive file.
pub fn write_archive(path: &Path, records: &[AggregatedRecord]) -> AppResult<()> {
    let bytes = serde_json::to_vec_pretty(records)?;
    write_atomic(path, &bytes).map_err(|source| DaqError::CheckpointWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// Force a final checkpoint, write the whole durable series as an archive and
/// drop the track's checkpoint files.
///
/// If the final checkpoint fails nothing is archived and the checkpoint files
/// stay on disk, where the catalog still lists them.
pub async fn archive_track(track: &Track) -> AppResult<Option<PathBuf>> {
    track.checkpoint().await?;
    let durable = track.durable_records().await?;
    if durable.is_empty() {
        track.discard_checkpoints().await?;
        info!(track = %track.id(), "empty track, nothing archived");
        return Ok(None);
    }

    let path = archive_path(track.output_dir(), track.created_at());
    let records: Vec<AggregatedRecord> = durable.into_iter().map(|r| r.record).collect();
    let count = records.len();
    let target = path.clone();
    tokio::task::spawn_blocking(move || write_archive(&target, &records))
        .await
        .map_err(|e| DaqError::Io(std::io::Error::other(format!("archive task failed: {e}"))))??;

    track.discard_checkpoints().await?;
    info!(track = %track.id(), path = %path.display(), records = count, "track archived");
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackSettings;
    use crate::sample::Value;
    use crate::track::{SaveMode, TrackOrigin};
    use std::collections::BTreeMap;

    fn record(i: i64) -> AggregatedRecord {
        let mut values = BTreeMap::new();
        values.insert("rm2/wind/speed".to_string(), Value::Int(i));
        values.insert("rm1/gps/lat".to_string(), Value::Float(45.0));
        AggregatedRecord::new(
            DateTime::<Utc>::from_timestamp(1_700_000_000 + i, 0).unwrap(),
            values,
        )
    }

    #[test]
    fn loads_archives_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("20240601-100000.json");
        write_archive(&archive, &[record(0), record(30)]).unwrap();
        let file = TrackFile::load(&archive).unwrap();
        assert!(!file.is_checkpoint());
        assert_eq!(file.len(), 2);
        assert_eq!(file.duration(), Some(chrono::Duration::seconds(30)));
        let units: Vec<String> = file.remote_units().into_iter().collect();
        assert_eq!(units, vec!["rm1", "rm2"]);

        let mut store = crate::checkpoint::CheckpointStore::open(dir.path(), "t", 3).unwrap();
        let chk = store.write(0, &[record(1)]).unwrap();
        let file = TrackFile::load(&chk).unwrap();
        assert!(file.is_checkpoint());
        assert_eq!(file.track_id(), Some("t"));
        assert_eq!(file.records(), &[record(1)]);
    }

    #[test]
    fn checkpoint_loads_the_whole_crashed_track() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = crate::checkpoint::CheckpointStore::open(dir.path(), "crashed", 1).unwrap();
        let first = store.write(0, &(0..10).map(record).collect::<Vec<_>>()).unwrap();
        let second = store.write(10, &(10..15).map(record).collect::<Vec<_>>()).unwrap();
        assert!(!first.exists(), "folded into the base segment");

        let file = TrackFile::load(&second).unwrap();
        assert_eq!(file.into_records(), (0..15).map(record).collect::<Vec<_>>());

        // A renamed copy only holds its own delta.
        let copy = dir.path().join("delta.json");
        fs::copy(&second, &copy).unwrap();
        assert_eq!(TrackFile::load(&copy).unwrap().len(), 5);
    }

    #[test]
    fn rejects_foreign_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, br#"{"theme": "dark"}"#).unwrap();
        assert!(matches!(
            TrackFile::load(&path),
            Err(DaqError::TrackLoad { .. })
        ));
    }

    #[test]
    fn archive_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let created = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let first = archive_path(dir.path(), created);
        assert!(first.ends_with("20231114-221320.json"));
        fs::write(&first, b"[]").unwrap();
        let second = archive_path(dir.path(), created);
        assert!(second.ends_with("20231114-221320-1.json"));
    }

    #[tokio::test]
    async fn archive_contains_trimmed_records() {
        let dir = tempfile::tempdir().unwrap();
        let settings = TrackSettings {
            max_datapoints: 4,
            max_checkpoint_files: 1,
            ..TrackSettings::default()
        };
        let track =
            Track::create(TrackOrigin::Live, &settings, SaveMode::Continuous, dir.path()).unwrap();
        for i in 0..12 {
            track.append(record(i)).await.unwrap();
        }
        assert!(track.len() <= 4);

        let path = archive_track(&track).await.unwrap().unwrap();
        let file = TrackFile::load(&path).unwrap();
        assert_eq!(file.into_records(), (0..12).map(record).collect::<Vec<_>>());
        let leftovers = fs::read_dir(dir.path().join("chk")).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
