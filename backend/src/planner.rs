//! Window planning for partition creation.
//!
//! [`plan_windows`] splits `[start, end)` into contiguous half-open windows of
//! one grain unit each (the last one clipped to `end`). Each window carries the
//! suffix that names its child partition, so any window can be handed to the
//! schema layer on its own and planning can resume from any window start.

use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::db::repository::{ErrorContext, RepositoryError, RepositoryResult};
use crate::models::{format_timestamp, TimeRange};

/// Partition grain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grain {
    Day,
    Week,
}

impl Grain {
    /// Length of one grain unit.
    pub fn step(self) -> Duration {
        match self {
            Grain::Day => Duration::days(1),
            Grain::Week => Duration::weeks(1),
        }
    }

    /// Canonical partition suffix for a window starting at `start`.
    pub fn suffix(self, start: &NaiveDateTime) -> String {
        match self {
            Grain::Day => day_suffix(start.date()),
            Grain::Week => week_suffix(start.date()),
        }
    }
}

impl FromStr for Grain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "day" | "daily" => Ok(Self::Day),
            "week" | "weekly" => Ok(Self::Week),
            other => Err(format!("Unknown partition grain: {}", other)),
        }
    }
}

impl fmt::Display for Grain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grain::Day => f.write_str("day"),
            Grain::Week => f.write_str("week"),
        }
    }
}

/// `2025_01_07` for 2025-01-07.
pub fn day_suffix(date: NaiveDate) -> String {
    date.format("%Y_%m_%d").to_string()
}

/// `wk_2025_01_01` for a week starting 2025-01-01.
pub fn week_suffix(date: NaiveDate) -> String {
    format!("wk_{}", day_suffix(date))
}

/// Midnight of a calendar date.
pub fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}

/// One planned window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub range: TimeRange,
    pub suffix: String,
    pub grain: Grain,
}

impl Window {
    pub fn start(&self) -> NaiveDateTime {
        self.range.lo
    }

    pub fn end(&self) -> NaiveDateTime {
        self.range.hi
    }

    /// The full 7-day window beginning at `week_start`.
    pub fn week(week_start: NaiveDate) -> Self {
        let lo = start_of_day(week_start);
        Self {
            range: TimeRange {
                lo,
                hi: lo + Grain::Week.step(),
            },
            suffix: week_suffix(week_start),
            grain: Grain::Week,
        }
    }

    /// The single-day window for `date`.
    pub fn day(date: NaiveDate) -> Self {
        let lo = start_of_day(date);
        Self {
            range: TimeRange {
                lo,
                hi: lo + Grain::Day.step(),
            },
            suffix: day_suffix(date),
            grain: Grain::Day,
        }
    }
}

/// Lazy iterator over planned windows.
#[derive(Debug, Clone)]
pub struct Windows {
    cursor: NaiveDateTime,
    end: NaiveDateTime,
    grain: Grain,
}

impl Iterator for Windows {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        if self.cursor >= self.end {
            return None;
        }
        let lo = self.cursor;
        let hi = std::cmp::min(lo + self.grain.step(), self.end);
        self.cursor = hi;
        Some(Window {
            range: TimeRange { lo, hi },
            suffix: self.grain.suffix(&lo),
            grain: self.grain,
        })
    }
}

/// Plan windows covering `[start, end)` at `grain`.
///
/// # Errors
/// `InvalidRange` when `end <= start`.
pub fn plan_windows(
    start: NaiveDateTime,
    end: NaiveDateTime,
    grain: Grain,
) -> RepositoryResult<Windows> {
    if end <= start {
        return Err(RepositoryError::InvalidRange {
            message: format!(
                "end {} must be after start {}",
                format_timestamp(&end),
                format_timestamp(&start)
            ),
            context: ErrorContext::new("plan_windows").with_details(format!("grain={}", grain)),
        });
    }
    Ok(Windows {
        cursor: start,
        end,
        grain,
    })
}

/// Plan windows between two calendar dates (`end` exclusive).
pub fn plan_date_windows(
    start: NaiveDate,
    end: NaiveDate,
    grain: Grain,
) -> RepositoryResult<Windows> {
    plan_windows(start_of_day(start), start_of_day(end), grain)
}
