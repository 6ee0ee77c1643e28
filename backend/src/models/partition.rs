use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::repository::{RepositoryError, RepositoryResult};

/// Text form used for timestamps in DDL literals and catalog output.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Render a timestamp the way the store prints `timestamp without time zone`.
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

/// Half-open time range `[lo, hi)` on the ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub lo: NaiveDateTime,
    pub hi: NaiveDateTime,
}

impl TimeRange {
    /// Build a range, rejecting `hi <= lo`.
    pub fn new(lo: NaiveDateTime, hi: NaiveDateTime) -> RepositoryResult<Self> {
        if hi <= lo {
            return Err(RepositoryError::invalid_range(format!(
                "range end {} must be after start {}",
                format_timestamp(&hi),
                format_timestamp(&lo)
            )));
        }
        Ok(Self { lo, hi })
    }

    pub fn contains(&self, ts: &NaiveDateTime) -> bool {
        *ts >= self.lo && *ts < self.hi
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.lo < other.hi && other.lo < self.hi
    }

    pub fn duration(&self) -> chrono::Duration {
        self.hi - self.lo
    }

    /// Recover a range from text holding two quoted timestamps, such as a
    /// partition bound (`FOR VALUES FROM ('…') TO ('…')`) or a range CHECK
    /// definition. Returns `None` when the text has a different shape.
    pub fn from_quoted_bounds(text: &str) -> Option<Self> {
        let mut literals = text.split('\'').skip(1).step_by(2);
        let lo = parse_timestamp(literals.next()?)?;
        let hi = parse_timestamp(literals.next()?)?;
        Self::new(lo, hi).ok()
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            format_timestamp(&self.lo),
            format_timestamp(&self.hi)
        )
    }
}

/// Grain tag of a child partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrainTag {
    Day,
    WeekRollup,
}

impl GrainTag {
    /// Derive the tag from a child table name (`orders_wk_…` is a week).
    pub fn from_table_name(name: &str) -> Self {
        if name.contains("_wk_") {
            Self::WeekRollup
        } else {
            Self::Day
        }
    }
}

/// A concrete child relation as seen through the parent's partition map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildPartition {
    pub name: String,
    pub range: Option<TimeRange>,
    pub grain: GrainTag,
    pub attached: bool,
}

/// State of a CHECK constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintState {
    /// Declared but not proven against existing rows.
    NotValid,
    /// Scanned and confirmed.
    Valid,
}

/// A CHECK constraint as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConstraint {
    pub name: String,
    pub definition: String,
    pub validated: bool,
}

impl CheckConstraint {
    /// Interpret this constraint as a range constraint, if it has that shape.
    pub fn as_range(&self) -> Option<RangeConstraint> {
        let range = TimeRange::from_quoted_bounds(&self.definition)?;
        Some(RangeConstraint {
            name: self.name.clone(),
            range,
            state: if self.validated {
                ConstraintState::Valid
            } else {
                ConstraintState::NotValid
            },
        })
    }
}

/// CHECK constraint encoding `[lo, hi)` on a child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeConstraint {
    pub name: String,
    pub range: TimeRange,
    pub state: ConstraintState,
}

impl RangeConstraint {
    /// Whether the store may attach the child for `range` without scanning.
    pub fn permits_attach(&self, range: &TimeRange) -> bool {
        self.state == ConstraintState::Valid && self.range == *range
    }
}

/// One row of the partitioned `orders` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRow {
    pub order_id: Uuid,
    pub customer_id: i32,
    pub store_id: i32,
    pub status: String,
    pub amount: f64,
    pub order_time: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
