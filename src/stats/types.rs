//! Persisted per-day posture statistics.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Usage totals for one calendar day. The date is the unique key.
///
/// Invariant: `hunched_posture_duration <= usage_duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayStatistic {
    pub date: NaiveDate,
    /// Seconds the device was connected with a known posture.
    pub usage_duration: u64,
    /// Seconds of `usage_duration` spent hunched.
    pub hunched_posture_duration: u64,
    /// Number of transitions into the hunched posture.
    pub hunched_count: u32,
}

impl DayStatistic {
    /// An empty record for `date`.
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            usage_duration: 0,
            hunched_posture_duration: 0,
            hunched_count: 0,
        }
    }

    pub fn stretched_duration(&self) -> u64 {
        self.usage_duration
            .saturating_sub(self.hunched_posture_duration)
    }

    /// Share of usage time spent stretched, in percent. Zero without usage.
    pub fn stretch_percent(&self) -> f64 {
        if self.usage_duration == 0 {
            return 0.0;
        }
        self.stretched_duration() as f64 / self.usage_duration as f64 * 100.0
    }

    pub fn usage_minutes(&self) -> u64 {
        self.usage_duration / 60
    }

    pub fn hunched_minutes(&self) -> u64 {
        self.hunched_posture_duration / 60
    }

    pub fn is_empty(&self) -> bool {
        self.usage_duration == 0 && self.hunched_count == 0
    }
}
