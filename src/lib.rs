//! Posture Agent - daily posture statistics from a BLE posture corrector.
//!
//! The posture corrector is a wearable that streams one of two tokens over a
//! GATT notification: `ok` while the wearer sits up straight and `bad` while
//! they are hunched. This library keeps the connection to the wearable and
//! folds its posture changes into per-day usage statistics.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Posture Agent                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │  Transport  │──▶│ Connection  │──▶│  Posture    │       │
//! │  │ (BLE / sim) │   │  Session    │   │ Aggregator  │       │
//! │  └─────────────┘   └─────────────┘   └─────────────┘       │
//! │                           │                  │              │
//! │                           ▼                  ▼              │
//! │                    ┌─────────────┐   ┌─────────────┐       │
//! │                    │  Activity   │   │ Statistic   │       │
//! │                    │    Log      │   │   Store     │       │
//! │                    └─────────────┘   └─────────────┘       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use crossbeam_channel::unbounded;
//! use posture_agent::device::{ConnectionSession, PeripheralProfile, SimulatedTransport};
//! use posture_agent::stats::{MemoryStore, PostureAggregator};
//! use std::time::Duration;
//!
//! let mut session = ConnectionSession::new(SimulatedTransport::new(PeripheralProfile::default()));
//! let mut aggregator = PostureAggregator::new(MemoryStore::new());
//! let (tx, rx) = unbounded();
//!
//! session.connect("D4:D4:DA:44:28:86", tx).expect("Failed to connect");
//! session.pump(Duration::from_millis(100));
//! for event in rx.try_iter() {
//!     aggregator.handle_event(event).expect("Failed to record event");
//! }
//! ```

pub mod activity;
pub mod config;
pub mod device;
pub mod stats;

// Re-export key types at crate root for convenience
pub use activity::{ActivityLog, ActivityStats, SharedActivityLog};
pub use config::{Config, ConfigError, SimulationConfig};
pub use device::{
    ConnectionSession, ConnectionState, DeviceAddress, LinkPhase, Posture, PostureEvent,
    SessionError, StateHandle, Transport,
};
pub use stats::{
    DayStatistic, JsonFileStore, MemoryStore, PostureAggregator, StatisticStore, StoreError,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
