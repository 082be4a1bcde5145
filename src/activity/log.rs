//! Activity log for the posture agent.
//!
//! Counts what the agent received and wrote without keeping any payloads.
//! Counters survive restarts when the log is created with persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Activity counters for the agent.
#[derive(Debug)]
pub struct ActivityLog {
    /// Payloads delivered by the peripheral
    payloads_received: AtomicU64,
    /// Payloads that decoded to no posture
    payloads_dropped: AtomicU64,
    /// Posture changes emitted by the session
    posture_changes: AtomicU64,
    /// Connect attempts that reached the transport
    sessions: AtomicU64,
    /// Day statistic writes
    records_written: AtomicU64,
    /// Identifier of this process run
    run_id: Uuid,
    run_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self {
            payloads_received: AtomicU64::new(0),
            payloads_dropped: AtomicU64::new(0),
            posture_changes: AtomicU64::new(0),
            sessions: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            run_id: Uuid::new_v4(),
            run_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create an activity log that loads from and saves to `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!(error = %e, "could not load previous activity counters");
        }

        log
    }

    pub fn record_session_started(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a payload from the peripheral. `decoded` is false when the
    /// payload was not a known posture token.
    pub fn record_payload(&self, decoded: bool) {
        self.payloads_received.fetch_add(1, Ordering::Relaxed);
        if !decoded {
            self.payloads_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_posture_change(&self) {
        self.posture_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_record_written(&self) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Get the current counters.
    pub fn stats(&self) -> ActivityStats {
        ActivityStats {
            payloads_received: self.payloads_received.load(Ordering::Relaxed),
            payloads_dropped: self.payloads_dropped.load(Ordering::Relaxed),
            posture_changes: self.posture_changes.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            run_id: self.run_id,
            run_start: self.run_start,
            run_duration_secs: (Utc::now() - self.run_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Activity:\n\
             - Sessions started: {}\n\
             - Payloads received: {}\n\
             - Payloads dropped: {}\n\
             - Posture changes: {}\n\
             - Records written: {}\n\
             - Run duration: {} seconds",
            stats.sessions,
            stats.payloads_received,
            stats.payloads_dropped,
            stats.posture_changes,
            stats.records_written,
            stats.run_duration_secs
        )
    }

    /// Save counters to disk. A log without persistence saves nothing.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedActivity {
                payloads_received: stats.payloads_received,
                payloads_dropped: stats.payloads_dropped,
                posture_changes: stats.posture_changes,
                sessions: stats.sessions,
                records_written: stats.records_written,
                last_run: Some(stats.run_id),
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedActivity =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.payloads_received
                    .store(persisted.payloads_received, Ordering::Relaxed);
                self.payloads_dropped
                    .store(persisted.payloads_dropped, Ordering::Relaxed);
                self.posture_changes
                    .store(persisted.posture_changes, Ordering::Relaxed);
                self.sessions.store(persisted.sessions, Ordering::Relaxed);
                self.records_written
                    .store(persisted.records_written, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the activity counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityStats {
    pub payloads_received: u64,
    pub payloads_dropped: u64,
    pub posture_changes: u64,
    pub sessions: u64,
    pub records_written: u64,
    pub run_id: Uuid,
    pub run_start: DateTime<Utc>,
    pub run_duration_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedActivity {
    payloads_received: u64,
    payloads_dropped: u64,
    posture_changes: u64,
    sessions: u64,
    records_written: u64,
    #[serde(default)]
    last_run: Option<Uuid>,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared activity log.
pub type SharedActivityLog = Arc<ActivityLog>;

pub fn create_shared_log() -> SharedActivityLog {
    Arc::new(ActivityLog::new())
}

pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedActivityLog {
    Arc::new(ActivityLog::with_persistence(path))
}
