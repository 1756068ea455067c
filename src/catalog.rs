//! Listing and selection of stored tracks.
//!
//! The catalog looks at two places under the output directory: archived tracks
//! (`*.json`) and surviving checkpoints (`chk/*.chk.json`) of sessions that never
//! reached a clean stop. A crashed session is one entry, listed under its newest
//! checkpoint and counting every durable record. Entries are listed newest
//! first; an index into that listing, a filename or a crashed track's id
//! selects a track for replay.

use crate::archive::{TrackFile, ARCHIVE_NAME_FORMAT};
use crate::checkpoint::{parse_checkpoint_name, CHECKPOINT_DIR, CHECKPOINT_EXT};
use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Derived description of a stored track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackMetadata {
    /// File name without directories.
    pub filename: String,
    /// Full path.
    pub path: PathBuf,
    /// Start of the recording.
    pub datetime: Option<DateTime<Utc>>,
    /// Seconds between first and last record.
    pub duration: f64,
    /// Number of records in the track.
    pub datapoint_count: usize,
    /// Display names of the units present in the first record.
    pub remote_units: Vec<String>,
    /// True when read from checkpoints rather than an archive.
    pub checkpoint: bool,
    /// Id of a crashed track.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
}

/// How a caller names a stored track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackSelector {
    /// Position in the listing returned by [`TrackCatalog::scan`].
    Index(usize),
    /// File name (or path) of the track, or the id of a crashed track.
    Name(String),
}

impl FromStr for TrackSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<usize>() {
            Ok(index) => TrackSelector::Index(index),
            Err(_) => TrackSelector::Name(s.to_string()),
        })
    }
}

impl fmt::Display for TrackSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackSelector::Index(i) => write!(f, "#{i}"),
            TrackSelector::Name(name) => f.write_str(name),
        }
    }
}

/// Stored tracks under one output directory.
#[derive(Debug, Clone)]
pub struct TrackCatalog {
    output_dir: PathBuf,
    units: BTreeMap<String, String>,
}

impl TrackCatalog {
    /// Catalog over `output_dir`, mapping unit ids through `units`.
    pub fn new(output_dir: impl Into<PathBuf>, units: BTreeMap<String, String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            units,
        }
    }

    /// Catalog for the configured output directory and unit thesaurus.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.files.output_dir, settings.units.clone())
    }

    /// Directory being listed.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Every readable track, newest first. Unreadable files are skipped.
    pub fn scan(&self) -> AppResult<Vec<TrackMetadata>> {
        let mut candidates = json_files(&self.output_dir, ".json")?;

        // One candidate per crashed track: its newest checkpoint.
        let mut newest: BTreeMap<String, (u64, PathBuf)> = BTreeMap::new();
        for path in json_files(&self.output_dir.join(CHECKPOINT_DIR), CHECKPOINT_EXT)? {
            let parsed = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_checkpoint_name)
                .map(|(track_id, seq)| (track_id.to_string(), seq));
            let Some((track_id, seq)) = parsed else {
                candidates.push(path);
                continue;
            };
            if !newest.get(&track_id).is_some_and(|(known, _)| *known >= seq) {
                newest.insert(track_id, (seq, path));
            }
        }
        candidates.extend(newest.into_values().map(|(_, path)| path));

        let mut tracks: Vec<TrackMetadata> = candidates
            .into_iter()
            .filter_map(|path| match self.describe(&path) {
                Ok(meta) => Some(meta),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping invalid track file");
                    None
                }
            })
            .collect();
        tracks.sort_by(|a, b| {
            b.datetime
                .cmp(&a.datetime)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        debug!(dir = %self.output_dir.display(), count = tracks.len(), "track catalog scanned");
        Ok(tracks)
    }

    /// Metadata of the track named by `selector`.
    pub fn select(&self, selector: &TrackSelector) -> AppResult<TrackMetadata> {
        let tracks = self.scan()?;
        let found = match selector {
            TrackSelector::Index(i) => tracks.into_iter().nth(*i),
            TrackSelector::Name(name) => {
                let wanted = Path::new(name)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| name.clone());
                tracks.into_iter().find(|t| {
                    t.filename == wanted || t.track_id.as_deref() == Some(name.as_str())
                })
            }
        };
        found.ok_or_else(|| DaqError::TrackNotFound(selector.to_string()))
    }

    /// Path of the track named by `selector`.
    ///
    /// A name pointing at an existing file outside the output directory is
    /// accepted as is.
    pub fn resolve(&self, selector: &TrackSelector) -> AppResult<PathBuf> {
        if let TrackSelector::Name(name) = selector {
            let direct = Path::new(name);
            if direct.components().count() > 1 && direct.is_file() {
                return Ok(direct.to_path_buf());
            }
        }
        self.select(selector).map(|meta| meta.path)
    }

    /// Read `path` and derive its metadata.
    pub fn describe(&self, path: &Path) -> AppResult<TrackMetadata> {
        let file = TrackFile::load(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let datetime = datetime_from_name(&filename).or_else(|| file.start());
        let duration = file
            .duration()
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        let remote_units = file
            .remote_units()
            .into_iter()
            .map(|id| self.units.get(&id).cloned().unwrap_or(id))
            .collect();

        Ok(TrackMetadata {
            filename,
            path: path.to_path_buf(),
            datetime,
            duration,
            datapoint_count: file.len(),
            remote_units,
            checkpoint: file.is_checkpoint(),
            track_id: file.track_id().map(str::to_string),
        })
    }
}

fn json_files(dir: &Path, suffix: &str) -> AppResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(suffix));
        if matches && path.is_file() {
            out.push(path);
        }
    }
    Ok(out)
}

/// Creation time encoded in an archive name (`20240601-100000.json`,
/// `20240601-100000-1.json`) or a checkpoint name that starts with a track id.
fn datetime_from_name(filename: &str) -> Option<DateTime<Utc>> {
    let stamp = filename.get(..15)?;
    NaiveDateTime::parse_from_str(stamp, ARCHIVE_NAME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::write_archive;
    use crate::checkpoint::CheckpointStore;
    use crate::record::AggregatedRecord;
    use crate::sample::Value;

    fn record(secs: i64) -> AggregatedRecord {
        let mut values = BTreeMap::new();
        values.insert("rm1/gps/lat".to_string(), Value::Float(45.0));
        values.insert("rm2/wind/speed".to_string(), Value::Float(3.5));
        AggregatedRecord::new(
            DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
            values,
        )
    }

    fn catalog(dir: &Path) -> TrackCatalog {
        let mut units = BTreeMap::new();
        units.insert("rm1".to_string(), "GPS+IMU".to_string());
        TrackCatalog::new(dir, units)
    }

    #[test]
    fn lists_archives_and_checkpoints_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        write_archive(
            &dir.path().join("20240601-100000.json"),
            &[record(0), record(90)],
        )
        .unwrap();
        write_archive(&dir.path().join("20240602-080000.json"), &[record(0)]).unwrap();
        let mut store = CheckpointStore::open(dir.path(), "20240603-120000-abcdef01", 3).unwrap();
        store.write(0, &[record(0), record(1)]).unwrap();
        fs::write(dir.path().join("notes.json"), b"{\"a\": 1}").unwrap();

        let tracks = catalog(dir.path()).scan().unwrap();
        let names: Vec<&str> = tracks.iter().map(|t| t.filename.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "20240603-120000-abcdef01-000001.chk.json",
                "20240602-080000.json",
                "20240601-100000.json",
            ]
        );
        assert!(tracks[0].checkpoint);
        assert_eq!(tracks[2].duration, 90.0);
        assert_eq!(tracks[2].datapoint_count, 2);
        assert_eq!(tracks[2].remote_units, vec!["GPS+IMU", "rm2"]);
    }

    #[test]
    fn crashed_track_is_listed_once_with_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let track_id = "20240603-120000-abcdef01";
        let mut store = CheckpointStore::open(dir.path(), track_id, 3).unwrap();
        store.write(0, &(0..10).map(record).collect::<Vec<_>>()).unwrap();
        store.write(10, &(10..15).map(record).collect::<Vec<_>>()).unwrap();
        write_archive(&dir.path().join("20240601-100000.json"), &[record(0)]).unwrap();

        let catalog = catalog(dir.path());
        let tracks = catalog.scan().unwrap();
        assert_eq!(tracks.len(), 2);
        let crashed = &tracks[0];
        assert_eq!(crashed.filename, format!("{track_id}-000002.chk.json"));
        assert_eq!(crashed.track_id.as_deref(), Some(track_id));
        assert_eq!(crashed.datapoint_count, 15);
        assert_eq!(crashed.duration, 14.0);

        let by_id = catalog.resolve(&TrackSelector::Name(track_id.into())).unwrap();
        assert_eq!(by_id, crashed.path);
        let replayed = TrackFile::load(&by_id).unwrap();
        assert_eq!(replayed.into_records(), (0..15).map(record).collect::<Vec<_>>());
    }

    #[test]
    fn selects_by_index_and_name() {
        let dir = tempfile::tempdir().unwrap();
        write_archive(&dir.path().join("20240601-100000.json"), &[record(0)]).unwrap();
        write_archive(&dir.path().join("20240602-080000.json"), &[record(0)]).unwrap();
        let catalog = catalog(dir.path());

        let newest = catalog.select(&"0".parse().unwrap()).unwrap();
        assert_eq!(newest.filename, "20240602-080000.json");
        let named = catalog
            .resolve(&TrackSelector::Name("20240601-100000.json".into()))
            .unwrap();
        assert_eq!(named, dir.path().join("20240601-100000.json"));

        assert!(matches!(
            catalog.select(&TrackSelector::Index(5)),
            Err(DaqError::TrackNotFound(_))
        ));
    }

    #[test]
    fn datetime_falls_back_to_first_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harbour-run.json");
        write_archive(&path, &[record(0)]).unwrap();
        let meta = catalog(dir.path()).describe(&path).unwrap();
        assert_eq!(meta.datetime, Some(record(0).timestamp));
    }

    #[test]
    fn missing_output_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog(&dir.path().join("nowhere"));
        assert!(catalog.scan().unwrap().is_empty());
    }
}
