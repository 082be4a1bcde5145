//! Daily posture statistics.
//!
//! - `types`: the persisted [`DayStatistic`] record
//! - `store`: date-keyed persistence behind [`StatisticStore`]
//! - `aggregator`: folds posture events into the store
//! - `report`: summaries, history and exports for the CLI

pub mod aggregator;
pub mod report;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use aggregator::PostureAggregator;
pub use report::{ExportFormat, DEFAULT_HISTORY_DAYS, MAX_HISTORY_DAYS};
pub use store::{JsonFileStore, MemoryStore, StatisticStore, StoreError};
pub use types::DayStatistic;
