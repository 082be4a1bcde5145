//! Persistence for [`DayStatistic`] records, keyed by date.

use crate::stats::types::DayStatistic;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::NamedTempFile;

/// Errors raised by a [`StatisticStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse error in {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialize error: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Date-keyed store of daily statistics.
///
/// Readers must only ever observe whole records. Implementations that are
/// shared between threads guard `update_day` so a read-modify-write for one
/// date is not interleaved with another write.
pub trait StatisticStore: Send + Sync {
    fn get_by_date(&self, date: NaiveDate) -> Result<Option<DayStatistic>, StoreError>;

    /// Insert or replace the record for `stat.date`.
    fn upsert(&self, stat: DayStatistic) -> Result<(), StoreError>;

    /// All records, ordered by date.
    fn all(&self) -> Result<Vec<DayStatistic>, StoreError>;

    /// Fetch-or-create the record for `date`, apply `f`, and upsert it.
    fn update_day(
        &self,
        date: NaiveDate,
        f: &mut dyn FnMut(&mut DayStatistic),
    ) -> Result<DayStatistic, StoreError> {
        let mut stat = self
            .get_by_date(date)?
            .unwrap_or_else(|| DayStatistic::new(date));
        f(&mut stat);
        self.upsert(stat)?;
        Ok(stat)
    }
}

impl<S: StatisticStore + ?Sized> StatisticStore for Arc<S> {
    fn get_by_date(&self, date: NaiveDate) -> Result<Option<DayStatistic>, StoreError> {
        (**self).get_by_date(date)
    }

    fn upsert(&self, stat: DayStatistic) -> Result<(), StoreError> {
        (**self).upsert(stat)
    }

    fn all(&self) -> Result<Vec<DayStatistic>, StoreError> {
        (**self).all()
    }

    fn update_day(
        &self,
        date: NaiveDate,
        f: &mut dyn FnMut(&mut DayStatistic),
    ) -> Result<DayStatistic, StoreError> {
        (**self).update_day(date, f)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Volatile store, used in tests and `--simulate` runs without persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<NaiveDate, DayStatistic>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatisticStore for MemoryStore {
    fn get_by_date(&self, date: NaiveDate) -> Result<Option<DayStatistic>, StoreError> {
        Ok(lock(&self.records).get(&date).copied())
    }

    fn upsert(&self, stat: DayStatistic) -> Result<(), StoreError> {
        lock(&self.records).insert(stat.date, stat);
        Ok(())
    }

    fn all(&self) -> Result<Vec<DayStatistic>, StoreError> {
        Ok(lock(&self.records).values().copied().collect())
    }

    fn update_day(
        &self,
        date: NaiveDate,
        f: &mut dyn FnMut(&mut DayStatistic),
    ) -> Result<DayStatistic, StoreError> {
        let mut records = lock(&self.records);
        let stat = records.entry(date).or_insert_with(|| DayStatistic::new(date));
        f(stat);
        Ok(*stat)
    }
}

/// On-disk format of [`JsonFileStore`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct StatisticsFile {
    days: Vec<DayStatistic>,
}

/// Store kept in a single JSON file.
///
/// The whole table is held in memory; every write rewrites the file through a
/// temporary sibling and a rename, so the file on disk always holds a complete
/// table.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<BTreeMap<NaiveDate, DayStatistic>>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading existing records if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let file: StatisticsFile =
                serde_json::from_str(&content).map_err(|source| StoreError::Parse {
                    path: path.clone(),
                    source,
                })?;
            file.days.into_iter().map(|d| (d.date, d)).collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, records: &BTreeMap<NaiveDate, DayStatistic>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent).map_err(io_err)?;

        let file = StatisticsFile {
            days: records.values().copied().collect(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(StoreError::Serialize)?;

        // Unique temp file in the target directory so the rename stays on one
        // filesystem and concurrent writers never share it.
        let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|err| io_err(err.error))?;
        Ok(())
    }
}

impl StatisticStore for JsonFileStore {
    fn get_by_date(&self, date: NaiveDate) -> Result<Option<DayStatistic>, StoreError> {
        Ok(lock(&self.records).get(&date).copied())
    }

    fn upsert(&self, stat: DayStatistic) -> Result<(), StoreError> {
        let mut records = lock(&self.records);
        let previous = records.insert(stat.date, stat);
        if let Err(err) = self.persist(&records) {
            match previous {
                Some(previous) => records.insert(stat.date, previous),
                None => records.remove(&stat.date),
            };
            return Err(err);
        }
        Ok(())
    }

    fn all(&self) -> Result<Vec<DayStatistic>, StoreError> {
        Ok(lock(&self.records).values().copied().collect())
    }

    fn update_day(
        &self,
        date: NaiveDate,
        f: &mut dyn FnMut(&mut DayStatistic),
    ) -> Result<DayStatistic, StoreError> {
        let mut records = lock(&self.records);
        let previous = records.get(&date).copied();
        let mut stat = previous.unwrap_or_else(|| DayStatistic::new(date));
        f(&mut stat);
        records.insert(date, stat);

        if let Err(err) = self.persist(&records) {
            match previous {
                Some(previous) => records.insert(date, previous),
                None => records.remove(&date),
            };
            return Err(err);
        }
        Ok(stat)
    }
}
