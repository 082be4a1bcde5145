//! Text reports and exports over stored day statistics.

use crate::stats::store::{StatisticStore, StoreError};
use crate::stats::types::DayStatistic;
use chrono::{Datelike, NaiveDate};
use std::fmt::Write as _;

/// Number of days shown by `history` when none is given.
pub const DEFAULT_HISTORY_DAYS: u32 = 5;

/// Longest history `history` will build.
pub const MAX_HISTORY_DAYS: u32 = 3650;

const BAR_WIDTH: usize = 20;

/// Export formats supported by [`export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Json,
    Csv,
}

/// Today's record, or an empty one if nothing was recorded yet.
pub fn today(store: &dyn StatisticStore, today: NaiveDate) -> Result<DayStatistic, StoreError> {
    Ok(store
        .get_by_date(today)?
        .unwrap_or_else(|| DayStatistic::new(today)))
}

/// The last `days` days ending at `today`, oldest first. Days without a
/// record are filled with empty statistics. At most [`MAX_HISTORY_DAYS`] days
/// are returned, and never any before the earliest representable date.
pub fn history(
    store: &dyn StatisticStore,
    today: NaiveDate,
    days: u32,
) -> Result<Vec<DayStatistic>, StoreError> {
    let days = days.min(MAX_HISTORY_DAYS);
    let mut out = Vec::with_capacity(days as usize);
    let mut next = Some(today);
    for _ in 0..days {
        let Some(date) = next else { break };
        let stat = store
            .get_by_date(date)?
            .unwrap_or_else(|| DayStatistic::new(date));
        out.push(stat);
        next = date.pred_opt();
    }
    out.reverse();
    Ok(out)
}

/// Multi-line summary of one day, as shown by `status`.
pub fn format_summary(stat: &DayStatistic) -> String {
    format!(
        "Statistics for {}:\n\
         - Approximate stretched time: {}%\n\
         - Usage today: {} minutes\n\
         - Hunched today: {} minutes\n\
         - Hunch count: {}",
        stat.date,
        stat.stretch_percent().round() as u32,
        stat.usage_minutes(),
        stat.hunched_minutes(),
        stat.hunched_count
    )
}

/// One bar per day showing the stretched share of usage time.
pub fn format_history(days: &[DayStatistic]) -> String {
    let mut out = String::from("Stretched time per day:\n");
    for stat in days {
        if stat.is_empty() {
            let _ = writeln!(
                out,
                "  {:>6} |{}|    -  (no usage)",
                day_label(stat.date),
                " ".repeat(BAR_WIDTH)
            );
            continue;
        }
        let percent = stat.stretch_percent();
        let filled = ((percent / 100.0) * BAR_WIDTH as f64).round() as usize;
        let filled = filled.min(BAR_WIDTH);
        let _ = writeln!(
            out,
            "  {:>6} |{}{}| {:>3}%  ({} min)",
            day_label(stat.date),
            "#".repeat(filled),
            " ".repeat(BAR_WIDTH - filled),
            percent.round() as u32,
            stat.usage_minutes()
        );
    }
    out
}

/// Short `day.month.` label.
pub fn day_label(date: NaiveDate) -> String {
    format!("{}.{}.", date.day(), date.month())
}

/// Serialize all stored records in `format`.
pub fn export(store: &dyn StatisticStore, format: ExportFormat) -> Result<String, StoreError> {
    let records = store.all()?;
    match format {
        ExportFormat::Json => {
            serde_json::to_string_pretty(&records).map_err(StoreError::Serialize)
        }
        ExportFormat::Csv => Ok(to_csv(&records)),
    }
}

fn to_csv(records: &[DayStatistic]) -> String {
    let mut out =
        String::from("date,usage_duration,hunched_posture_duration,hunched_count,stretch_percent\n");
    for stat in records {
        let _ = writeln!(
            out,
            "{},{},{},{},{:.1}",
            stat.date,
            stat.usage_duration,
            stat.hunched_posture_duration,
            stat.hunched_count,
            stat.stretch_percent()
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, d).unwrap()
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .upsert(DayStatistic {
                date: date(9),
                usage_duration: 600,
                hunched_posture_duration: 150,
                hunched_count: 4,
            })
            .unwrap();
        store
            .upsert(DayStatistic {
                date: date(7),
                usage_duration: 120,
                hunched_posture_duration: 120,
                hunched_count: 1,
            })
            .unwrap();
        store
    }

    #[test]
    fn test_history_fills_missing_days() {
        let store = seeded();
        let days = history(&store, date(10), 5).unwrap();

        let dates: Vec<NaiveDate> = days.iter().map(|s| s.date).collect();
        assert_eq!(dates, vec![date(6), date(7), date(8), date(9), date(10)]);
        assert!(days[0].is_empty());
        assert_eq!(days[3].usage_duration, 600);
        assert!(days[4].is_empty());
    }

    #[test]
    fn test_history_is_capped() {
        let days = history(&MemoryStore::new(), date(10), 100_000_000).unwrap();
        assert_eq!(days.len(), MAX_HISTORY_DAYS as usize);
        assert_eq!(days.last().map(|s| s.date), Some(date(10)));
    }

    #[test]
    fn test_history_stops_at_earliest_date() {
        let days = history(&MemoryStore::new(), NaiveDate::MIN, 3).unwrap();
        let dates: Vec<NaiveDate> = days.iter().map(|s| s.date).collect();
        assert_eq!(dates, vec![NaiveDate::MIN]);
    }

    #[test]
    fn test_history_zero_days() {
        assert!(history(&seeded(), date(10), 0).unwrap().is_empty());
    }

    #[test]
    fn test_summary_rounds_like_display() {
        let stat = seeded().get_by_date(date(9)).unwrap().unwrap();
        let summary = format_summary(&stat);

        assert!(summary.contains("2024-07-09"));
        assert!(summary.contains("Approximate stretched time: 75%"));
        assert!(summary.contains("Usage today: 10 minutes"));
        assert!(summary.contains("Hunched today: 2 minutes"));
        assert!(summary.contains("Hunch count: 4"));
    }

    #[test]
    fn test_today_without_record() {
        let stat = today(&MemoryStore::new(), date(1)).unwrap();
        assert_eq!(stat, DayStatistic::new(date(1)));
    }

    #[test]
    fn test_history_bars() {
        let days = history(&seeded(), date(9), 3).unwrap();
        let text = format_history(&days);

        assert!(text.contains("7.7."));
        assert!(text.contains("8.7."));
        assert!(text.contains("(no usage)"));
        assert!(text.contains(&format!("|{}|   0%", " ".repeat(BAR_WIDTH))));
        assert!(text.contains(&format!("|{}{}|  75%", "#".repeat(15), " ".repeat(5))));
    }

    #[test]
    fn test_csv_export() {
        let csv = export(&seeded(), ExportFormat::Csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "2024-07-07,120,120,1,0.0");
        assert_eq!(lines[2], "2024-07-09,600,150,4,75.0");
    }

    #[test]
    fn test_json_export_roundtrips() {
        let json = export(&seeded(), ExportFormat::Json).unwrap();
        let parsed: Vec<DayStatistic> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, seeded().all().unwrap());
    }
}
