//! Position projections over the record stream.

use crate::config::GpsSettings;
use crate::record::AggregatedRecord;
use crate::track::Track;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One position fix taken from a record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrackPoint {
    /// Record time.
    pub timestamp: DateTime<Utc>,
    /// Degrees north.
    pub latitude: f64,
    /// Degrees east.
    pub longitude: f64,
}

/// Which record fields hold the position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpsFields {
    latitude: String,
    longitude: String,
}

impl GpsFields {
    /// Use explicit field names.
    pub fn new(latitude: impl Into<String>, longitude: impl Into<String>) -> Self {
        Self {
            latitude: latitude.into(),
            longitude: longitude.into(),
        }
    }

    /// Fields named in the `[gps]` section.
    pub fn from_settings(settings: &GpsSettings) -> Self {
        Self::new(&settings.latitude, &settings.longitude)
    }

    /// Position in `record`, if both coordinates are finite numbers.
    pub fn point(&self, record: &AggregatedRecord) -> Option<TrackPoint> {
        let latitude = record.number(&self.latitude)?;
        let longitude = record.number(&self.longitude)?;
        if !latitude.is_finite() || !longitude.is_finite() {
            return None;
        }
        Some(TrackPoint {
            timestamp: record.timestamp,
            latitude,
            longitude,
        })
    }

    /// Every position in `records`, skipping records without one.
    pub fn points<'a, I>(&self, records: I) -> Vec<TrackPoint>
    where
        I: IntoIterator<Item = &'a AggregatedRecord>,
    {
        records.into_iter().filter_map(|r| self.point(r)).collect()
    }
}

/// Newest position in the track's memory window.
pub fn latest_position(track: &Track, fields: &GpsFields) -> Option<TrackPoint> {
    track
        .records()
        .iter()
        .rev()
        .find_map(|record| fields.point(record))
}

/// Positions of every in-memory record of the track, oldest first.
pub fn track_points(track: &Track, fields: &GpsFields) -> Vec<TrackPoint> {
    fields.points(&track.records())
}
