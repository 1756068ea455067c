//! Remote unit liveness classification.
//!
//! Status is never stored; it is recomputed from the last time a unit was heard
//! from every time someone asks.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connectivity of a remote unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    /// Heard from within `timeout_noncomm`.
    Online,
    /// Silent for longer than `timeout_noncomm` but not yet `timeout_offline`.
    Noncomm,
    /// Silent for longer than `timeout_offline`, or never heard from.
    Offline,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnitStatus::Online => "online",
            UnitStatus::Noncomm => "noncomm",
            UnitStatus::Offline => "offline",
        };
        f.write_str(label)
    }
}

/// The two silence thresholds. `noncomm < offline` is checked by the config layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessThresholds {
    /// Silence after which a unit is `noncomm`.
    pub noncomm: Duration,
    /// Silence after which a unit is `offline`.
    pub offline: Duration,
}

impl Default for LivenessThresholds {
    fn default() -> Self {
        Self {
            noncomm: Duration::seconds(30),
            offline: Duration::seconds(60),
        }
    }
}

impl LivenessThresholds {
    /// Classify a unit last heard from at `last_seen`.
    ///
    /// Boundaries are inclusive on the healthier side: exactly `noncomm` seconds of
    /// silence is still online. A `last_seen` in the future (clock skew) counts as
    /// zero silence.
    pub fn classify(&self, last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> UnitStatus {
        let Some(last_seen) = last_seen else {
            return UnitStatus::Offline;
        };
        let silence = now.signed_duration_since(last_seen).max(Duration::zero());
        if silence <= self.noncomm {
            UnitStatus::Online
        } else if silence <= self.offline {
            UnitStatus::Noncomm
        } else {
            UnitStatus::Offline
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn thirty_sixty_scenario() {
        let t = LivenessThresholds::default();
        assert_eq!(t.classify(Some(at(0)), at(20)), UnitStatus::Online);
        assert_eq!(t.classify(Some(at(0)), at(45)), UnitStatus::Noncomm);
        assert_eq!(t.classify(Some(at(0)), at(75)), UnitStatus::Offline);
    }

    #[test]
    fn boundaries() {
        let t = LivenessThresholds::default();
        assert_eq!(t.classify(Some(at(0)), at(30)), UnitStatus::Online);
        assert_eq!(t.classify(Some(at(0)), at(60)), UnitStatus::Noncomm);
        assert_eq!(t.classify(Some(at(0)), at(61)), UnitStatus::Offline);
    }

    #[test]
    fn never_seen_is_offline() {
        let t = LivenessThresholds::default();
        assert_eq!(t.classify(None, at(0)), UnitStatus::Offline);
    }

    #[test]
    fn status_only_degrades_without_samples() {
        let t = LivenessThresholds::default();
        let mut previous = UnitStatus::Online;
        for now in 0..200 {
            let status = t.classify(Some(at(0)), at(now));
            assert!(status >= previous, "status improved at t={now}");
            previous = status;
        }
        assert_eq!(previous, UnitStatus::Offline);
    }

    #[test]
    fn future_timestamps_count_as_online() {
        let t = LivenessThresholds::default();
        assert_eq!(t.classify(Some(at(10)), at(0)), UnitStatus::Online);
    }
}
