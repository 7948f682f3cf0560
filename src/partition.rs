//! Time-based partition assignment
//!
//! Maps an event timestamp onto a half-open `[from, to)` window whose start
//! is aligned to a fixed epoch origin, so the same timestamp always lands in
//! the same partition and windows of one `(mode, size)` never overlap.

use crate::{Error, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Label used for shards of unpartitioned indexes.
pub const ALL_PARTITION_LABEL: &str = "all";

/// Calendar unit used to partition an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionBy {
    Day,
    Week,
    Month,
    Year,
}

impl PartitionBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionBy::Day => "DAY",
            PartitionBy::Week => "WEEK",
            PartitionBy::Month => "MONTH",
            PartitionBy::Year => "YEAR",
        }
    }
}

impl fmt::Display for PartitionBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionBy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DAY" => Ok(PartitionBy::Day),
            "WEEK" => Ok(PartitionBy::Week),
            "MONTH" => Ok(PartitionBy::Month),
            "YEAR" => Ok(PartitionBy::Year),
            other => Err(Error::Config(format!(
                "Unknown partition mode: '{}'. Use DAY, WEEK, MONTH or YEAR",
                other
            ))),
        }
    }
}

/// Half-open time window `[from_ms, to_ms)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub mode: PartitionBy,
    pub size: u32,
    pub from_ms: i64,
    pub to_ms: i64,
    pub label: String,
}

impl TimeWindow {
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.from_ms && timestamp_ms < self.to_ms
    }
}

/// Partition a document is routed into
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partition {
    /// No partitioning
    All,
    /// A time window
    Window(TimeWindow),
}

impl Partition {
    /// Resolve the partition for an event time, or `All` when the index is
    /// not partitioned.
    pub fn for_timestamp(
        partition_by: Option<PartitionBy>,
        size: u32,
        timestamp_ms: i64,
    ) -> Result<Self> {
        match partition_by {
            None => Ok(Partition::All),
            Some(mode) => compute_window(mode, size, timestamp_ms).map(Partition::Window),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Partition::All => ALL_PARTITION_LABEL,
            Partition::Window(w) => &w.label,
        }
    }

    pub fn from_ms(&self) -> Option<i64> {
        match self {
            Partition::All => None,
            Partition::Window(w) => Some(w.from_ms),
        }
    }

    pub fn to_ms(&self) -> Option<i64> {
        match self {
            Partition::All => None,
            Partition::Window(w) => Some(w.to_ms),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

const EPOCH_YEAR: i32 = 1970;

fn epoch_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(EPOCH_YEAR, 1, 1).unwrap_or_default()
}

/// Week numbering starts on the Monday before the epoch so every window
/// begins on an ISO week boundary.
fn epoch_monday() -> NaiveDate {
    epoch_day() - Duration::days(3)
}

fn midnight_ms(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default()
}

fn first_of_month(months_since_epoch: i64) -> Result<NaiveDate> {
    let year = EPOCH_YEAR as i64 + months_since_epoch.div_euclid(12);
    let month = months_since_epoch.rem_euclid(12) as u32 + 1;
    i32::try_from(year)
        .ok()
        .and_then(|y| NaiveDate::from_ymd_opt(y, month, 1))
        .ok_or_else(|| Error::Config(format!("Partition month out of range: {}", months_since_epoch)))
}

/// Compute the aligned window of `size` units of `mode` that contains
/// `timestamp_ms`.
pub fn compute_window(mode: PartitionBy, size: u32, timestamp_ms: i64) -> Result<TimeWindow> {
    if size < 1 {
        return Err(Error::Config(format!(
            "Partition size must be at least 1, got {}",
            size
        )));
    }
    let size = size as i64;
    let date = DateTime::from_timestamp_millis(timestamp_ms)
        .ok_or_else(|| Error::Config(format!("Timestamp out of range: {}", timestamp_ms)))?
        .date_naive();

    let (start, end, label) = match mode {
        PartitionBy::Year => {
            let units = (date.year() - EPOCH_YEAR) as i64;
            let aligned = units.div_euclid(size) * size;
            let start = first_of_month(aligned * 12)?;
            let end = first_of_month((aligned + size) * 12)?;
            (start, end, start.format("%Y").to_string())
        }
        PartitionBy::Month => {
            let units = (date.year() - EPOCH_YEAR) as i64 * 12 + date.month0() as i64;
            let aligned = units.div_euclid(size) * size;
            let start = first_of_month(aligned)?;
            let end = first_of_month(aligned + size)?;
            (start, end, start.format("%Y-%m").to_string())
        }
        PartitionBy::Week => {
            let weeks = (date - epoch_monday()).num_days().div_euclid(7);
            let aligned = weeks.div_euclid(size) * size;
            let start = epoch_monday() + Duration::weeks(aligned);
            let end = start + Duration::weeks(size);
            (start, end, start.format("%Y-%m-%d").to_string())
        }
        PartitionBy::Day => {
            let days = (date - epoch_day()).num_days();
            let aligned = days.div_euclid(size) * size;
            let start = epoch_day() + Duration::days(aligned);
            let end = start + Duration::days(size);
            (start, end, start.format("%Y-%m-%d").to_string())
        }
    };

    Ok(TimeWindow {
        mode,
        size: size as u32,
        from_ms: midnight_ms(start),
        to_ms: midnight_ms(end),
        label,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc, Weekday};

    fn ms(y: i32, m: u32, d: u32, h: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap().timestamp_millis()
    }

    #[test]
    fn test_day_window() {
        let w = compute_window(PartitionBy::Day, 1, ms(2024, 3, 15, 13)).unwrap();
        assert_eq!(w.from_ms, ms(2024, 3, 15, 0));
        assert_eq!(w.to_ms, ms(2024, 3, 16, 0));
        assert_eq!(w.label, "2024-03-15");
    }

    #[test]
    fn test_week_window_starts_on_monday() {
        // 2024-03-14 is a Thursday
        let w = compute_window(PartitionBy::Week, 1, ms(2024, 3, 14, 9)).unwrap();
        let start = DateTime::from_timestamp_millis(w.from_ms).unwrap().date_naive();
        assert_eq!(start.weekday(), Weekday::Mon);
        assert_eq!(w.label, "2024-03-11");
        assert_eq!(w.to_ms - w.from_ms, 7 * 24 * 3600 * 1000);
    }

    #[test]
    fn test_month_window_multi_size() {
        let w = compute_window(PartitionBy::Month, 3, ms(2024, 5, 20, 0)).unwrap();
        // months since epoch for 2024-05 = 652, aligned to 651 = 2024-04
        assert_eq!(w.label, "2024-04");
        assert_eq!(w.from_ms, ms(2024, 4, 1, 0));
        assert_eq!(w.to_ms, ms(2024, 7, 1, 0));
    }

    #[test]
    fn test_year_window() {
        let w = compute_window(PartitionBy::Year, 1, ms(2023, 12, 31, 23)).unwrap();
        assert_eq!(w.label, "2023");
        assert_eq!(w.from_ms, ms(2023, 1, 1, 0));
        assert_eq!(w.to_ms, ms(2024, 1, 1, 0));
    }

    #[test]
    fn test_pre_epoch_timestamp() {
        let w = compute_window(PartitionBy::Day, 2, ms(1969, 12, 31, 5)).unwrap();
        assert!(w.contains(ms(1969, 12, 31, 5)));
        assert!(w.to_ms > w.from_ms);
    }

    #[test]
    fn test_windows_are_stable_and_contiguous() {
        for mode in [
            PartitionBy::Day,
            PartitionBy::Week,
            PartitionBy::Month,
            PartitionBy::Year,
        ] {
            for size in [1u32, 2, 5] {
                let mut ts = ms(2019, 6, 1, 0);
                let end = ms(2021, 6, 1, 0);
                while ts < end {
                    let w = compute_window(mode, size, ts).unwrap();
                    assert!(w.contains(ts), "{:?}/{} must contain {}", mode, size, ts);
                    assert!(w.to_ms > w.from_ms);
                    // Any point in the window maps back to the same window
                    assert_eq!(compute_window(mode, size, w.from_ms).unwrap(), w);
                    assert_eq!(compute_window(mode, size, w.to_ms - 1).unwrap(), w);
                    // The next window starts exactly where this one ends
                    let next = compute_window(mode, size, w.to_ms).unwrap();
                    assert_eq!(next.from_ms, w.to_ms);
                    ts += 37 * 3600 * 1000;
                }
            }
        }
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            compute_window(PartitionBy::Day, 0, 0),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_parse_partition_by() {
        assert_eq!("month".parse::<PartitionBy>().unwrap(), PartitionBy::Month);
        assert!("fortnight".parse::<PartitionBy>().is_err());
    }

    #[test]
    fn test_unpartitioned_is_all() {
        let p = Partition::for_timestamp(None, 1, ms(2024, 1, 1, 0)).unwrap();
        assert_eq!(p, Partition::All);
        assert_eq!(p.label(), ALL_PARTITION_LABEL);
        assert_eq!(p.to_ms(), None);
    }
}
