//! Folds posture events into daily statistics.
//!
//! The aggregator remembers the current posture and when it started. Each
//! real change, and the end of a session, closes that interval and adds it to
//! the record of the day the interval was closed on.

use crate::activity::SharedActivityLog;
use crate::device::types::{Posture, PostureEvent};
use crate::stats::store::{StatisticStore, StoreError};
use crate::stats::types::DayStatistic;
use chrono::{Local, NaiveDate};
use std::time::Instant;
use tracing::{debug, warn};

/// Turns a stream of [`PostureEvent`]s into [`DayStatistic`] updates.
pub struct PostureAggregator<S: StatisticStore> {
    store: S,
    last_posture: Option<Posture>,
    last_change: Option<Instant>,
    activity: Option<SharedActivityLog>,
}

impl<S: StatisticStore> PostureAggregator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            last_posture: None,
            last_change: None,
            activity: None,
        }
    }

    pub fn with_activity_log(mut self, log: SharedActivityLog) -> Self {
        self.activity = Some(log);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Posture of the interval that is currently open.
    pub fn current_posture(&self) -> Option<Posture> {
        self.last_posture
    }

    /// Handle an event at the current instant, attributing time to today's
    /// local date.
    pub fn handle_event(&mut self, event: PostureEvent) -> Result<(), StoreError> {
        self.handle_event_at(event, Instant::now(), Local::now().date_naive())
    }

    /// Handle an event observed at `now`. A closed interval is added to the
    /// record for `today`.
    ///
    /// On a store error the running state has already moved on, so the failed
    /// interval is lost rather than counted twice.
    pub fn handle_event_at(
        &mut self,
        event: PostureEvent,
        now: Instant,
        today: NaiveDate,
    ) -> Result<(), StoreError> {
        let next = match event {
            PostureEvent::Connected | PostureEvent::Disconnected => return Ok(()),
            PostureEvent::PostureChanged(posture) => {
                if self.last_posture.is_none() {
                    debug!(%posture, "posture baseline set");
                    self.last_posture = Some(posture);
                    self.last_change = Some(now);
                    return Ok(());
                }
                if self.last_posture == Some(posture) {
                    return Ok(());
                }
                Some(posture)
            }
            PostureEvent::SessionEnded => {
                if self.last_posture.is_none() {
                    return Ok(());
                }
                None
            }
        };

        let previous = self.last_posture;
        let elapsed = self
            .last_change
            .map(|since| now.saturating_duration_since(since).as_secs())
            .unwrap_or(0);

        self.last_posture = next;
        self.last_change = Some(now);
        if next.is_some() {
            if let Some(ref activity) = self.activity {
                activity.record_posture_change();
            }
        }

        let result = self.store.update_day(today, &mut |stat: &mut DayStatistic| {
            stat.usage_duration = stat.usage_duration.saturating_add(elapsed);
            if previous == Some(Posture::Hunched) {
                stat.hunched_posture_duration =
                    stat.hunched_posture_duration.saturating_add(elapsed);
            }
            if next == Some(Posture::Hunched) {
                stat.hunched_count = stat.hunched_count.saturating_add(1);
            }
        });

        match result {
            Ok(stat) => {
                debug!(
                    date = %stat.date,
                    elapsed,
                    usage = stat.usage_duration,
                    hunched = stat.hunched_posture_duration,
                    "posture interval closed"
                );
                if let Some(ref activity) = self.activity {
                    activity.record_record_written();
                }
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, date = %today, "failed to store posture interval");
                Err(err)
            }
        }
    }
}
