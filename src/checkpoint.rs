//! File-backed checkpoint store with bounded retention.
//!
//! Layout under `<output_dir>/chk/`:
//!
//! - `<track_id>-<seq>.chk.json`: one incremental checkpoint, the records
//!   `[start_index, start_index + len)` of the track.
//! - `<track_id>.base.jsonl`: records folded out of checkpoints that were
//!   rotated away, one [`IndexedRecord`] per line.
//!
//! Every checkpoint is written to a temporary file, fsynced and renamed into
//! place, so a crash leaves either the old set of files or the new one. Rotation
//! appends the oldest checkpoint to the base segment (and fsyncs it) before
//! deleting it, which keeps every record durable even though at most
//! `max_files` checkpoint files exist per track.

use crate::error::{AppResult, DaqError};
use crate::record::{AggregatedRecord, IndexedRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the checkpoint directory under the output directory.
pub const CHECKPOINT_DIR: &str = "chk";
/// Extension of checkpoint files.
pub const CHECKPOINT_EXT: &str = ".chk.json";
const BASE_EXT: &str = ".base.jsonl";
const TMP_EXT: &str = ".tmp";

/// Contents of one checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Track the records belong to.
    pub track_id: String,
    /// Sequence number, increasing per track.
    pub seq: u64,
    /// Absolute index of the first record.
    pub start_index: u64,
    /// When the checkpoint was written.
    pub written_at: DateTime<Utc>,
    /// The delta.
    pub records: Vec<AggregatedRecord>,
}

impl CheckpointFile {
    /// Read and parse a checkpoint file.
    pub fn read(path: &Path) -> AppResult<Self> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| DaqError::TrackLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Absolute index one past the last record.
    pub fn end_index(&self) -> u64 {
        self.start_index + self.records.len() as u64
    }

    fn indexed(self) -> impl Iterator<Item = IndexedRecord> {
        let start = self.start_index;
        self.records
            .into_iter()
            .enumerate()
            .map(move |(i, record)| IndexedRecord {
                index: start + i as u64,
                record,
            })
    }
}

/// Track id and sequence number encoded in a checkpoint file name
/// (`<track_id>-<seq>.chk.json`).
pub fn parse_checkpoint_name(name: &str) -> Option<(&str, u64)> {
    let (track_id, seq) = name.strip_suffix(CHECKPOINT_EXT)?.rsplit_once('-')?;
    if track_id.is_empty() {
        return None;
    }
    Some((track_id, seq.parse().ok()?))
}

/// Write `bytes` to `path` so that readers see either the old file or the new one.
///
/// The data goes to `<path>.tmp` first, is fsynced, renamed over `path`, and the
/// parent directory is fsynced so the rename itself survives a power loss.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_EXT);
    let tmp = PathBuf::from(tmp);

    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// True when `path` exists and its last byte is not a newline.
fn ends_mid_line(path: &Path) -> io::Result<bool> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Checkpoint files of one track.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    track_id: String,
    max_files: usize,
    next_seq: u64,
}

impl CheckpointStore {
    /// Open (creating if needed) the checkpoint directory for `track_id`.
    ///
    /// Sequence numbers continue after any checkpoints already on disk.
    pub fn open(output_dir: &Path, track_id: &str, max_files: usize) -> AppResult<Self> {
        let dir = output_dir.join(CHECKPOINT_DIR);
        fs::create_dir_all(&dir)?;
        Self::in_dir(dir, track_id, max_files)
    }

    /// Store over an existing checkpoint directory, e.g. the one holding a
    /// checkpoint picked for replay. Nothing is created.
    pub fn in_dir(dir: impl Into<PathBuf>, track_id: &str, max_files: usize) -> AppResult<Self> {
        let mut store = Self {
            dir: dir.into(),
            track_id: track_id.to_string(),
            max_files: max_files.max(1),
            next_seq: 1,
        };
        store.next_seq = store
            .list()?
            .last()
            .map_or(1, |(seq, _)| seq + 1);
        Ok(store)
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Track the store belongs to.
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Change how many checkpoint files are kept. Applied on the next write.
    pub fn set_max_files(&mut self, max_files: usize) {
        self.max_files = max_files.max(1);
    }

    /// Path of checkpoint `seq`.
    pub fn path_for(&self, seq: u64) -> PathBuf {
        self.dir
            .join(format!("{}-{:06}{}", self.track_id, seq, CHECKPOINT_EXT))
    }

    /// Path of the base segment.
    pub fn base_path(&self) -> PathBuf {
        self.dir.join(format!("{}{}", self.track_id, BASE_EXT))
    }

    /// Sequence number of `name` if it is one of this track's checkpoints.
    fn parse_seq(&self, name: &str) -> Option<u64> {
        parse_checkpoint_name(name)
            .filter(|(track_id, _)| *track_id == self.track_id)
            .map(|(_, seq)| seq)
    }

    /// Existing checkpoint files of this track, oldest first.
    pub fn list(&self) -> AppResult<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let seq = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|name| self.parse_seq(name));
            if let Some(seq) = seq {
                files.push((seq, path));
            }
        }
        files.sort_by_key(|(seq, _)| *seq);
        Ok(files)
    }

    /// Durably write records `[start_index, start_index + records.len())` as a
    /// new checkpoint, then enforce retention.
    ///
    /// Returns the path of the new checkpoint once it is durable. Retention
    /// failures are logged, not returned: the new checkpoint is already safe.
    pub fn write(&mut self, start_index: u64, records: &[AggregatedRecord]) -> AppResult<PathBuf> {
        let seq = self.next_seq;
        let path = self.path_for(seq);
        let file = CheckpointFile {
            track_id: self.track_id.clone(),
            seq,
            start_index,
            written_at: Utc::now(),
            records: records.to_vec(),
        };
        let bytes = serde_json::to_vec(&file)?;
        write_atomic(&path, &bytes).map_err(|source| DaqError::CheckpointWrite {
            path: path.clone(),
            source,
        })?;
        self.next_seq += 1;
        debug!(path = %path.display(), start_index, records = records.len(), "checkpoint written");

        if let Err(e) = self.rotate() {
            warn!(track = %self.track_id, error = %e, "checkpoint rotation failed");
        }
        Ok(path)
    }

    /// Fold the oldest checkpoints into the base segment until at most
    /// `max_files` remain.
    fn rotate(&self) -> AppResult<()> {
        let files = self.list()?;
        let surplus = files.len().saturating_sub(self.max_files);
        for (_, path) in files.into_iter().take(surplus) {
            let checkpoint = CheckpointFile::read(&path)?;
            self.append_to_base(checkpoint)?;
            fs::remove_file(&path)?;
            debug!(path = %path.display(), "rotated checkpoint into base segment");
        }
        Ok(())
    }

    fn append_to_base(&self, checkpoint: CheckpointFile) -> AppResult<()> {
        let base = self.base_path();
        let mut out = Vec::new();
        for record in checkpoint.indexed() {
            serde_json::to_writer(&mut out, &record)?;
            out.push(b'\n');
        }
        if ends_mid_line(&base)? {
            out.insert(0, b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&base)?;
        file.write_all(&out)?;
        file.sync_all()?;
        Ok(())
    }

    /// Every durable record of this track, ordered by index and deduplicated.
    ///
    /// Leftover temporary files are ignored, as is an unterminated or garbled
    /// trailing line in the base segment (a crash during a fold). A checkpoint
    /// that cannot be parsed is skipped with a warning.
    pub fn recover(&self) -> AppResult<Vec<IndexedRecord>> {
        let mut merged: BTreeMap<u64, AggregatedRecord> = BTreeMap::new();

        let base = self.base_path();
        if base.exists() {
            let reader = BufReader::new(File::open(&base)?);
            for (n, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<IndexedRecord>(&line) {
                    Ok(indexed) => {
                        merged.insert(indexed.index, indexed.record);
                    }
                    Err(e) => warn!(path = %base.display(), line = n + 1, error = %e, "skipping damaged base record"),
                }
            }
        }

        for (_, path) in self.list()? {
            match CheckpointFile::read(&path) {
                Ok(checkpoint) => {
                    for indexed in checkpoint.indexed() {
                        merged.insert(indexed.index, indexed.record);
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint"),
            }
        }

        let records: Vec<IndexedRecord> = merged
            .into_iter()
            .map(|(index, record)| IndexedRecord { index, record })
            .collect();
        if let (Some(first), Some(last)) = (records.first(), records.last()) {
            let expected = last.index - first.index + 1;
            if expected != records.len() as u64 {
                warn!(
                    track = %self.track_id,
                    missing = expected - records.len() as u64,
                    "recovered checkpoints have gaps"
                );
            }
        }
        Ok(records)
    }

    /// Delete every file of this track, temporaries included.
    pub fn remove_all(&self) -> AppResult<usize> {
        let base_name = format!("{}{}", self.track_id, BASE_EXT);
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let name = name.strip_suffix(TMP_EXT).unwrap_or(name);
            if name == base_name || self.parse_seq(name).is_some() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        info!(track = %self.track_id, removed, "checkpoint files removed");
        Ok(removed)
    }
}
