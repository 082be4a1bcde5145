//! Activity tracking for the posture agent.
//!
//! Records how many payloads, posture changes and statistic writes the agent
//! handled so a user can check what it has been doing.

pub mod log;

pub use log::{
    create_shared_log, create_shared_log_with_persistence, ActivityLog, ActivityStats,
    SharedActivityLog,
};
