//! Row types for catalog queries.

use diesel::prelude::*;
use diesel::sql_types::{Array, BigInt, Bool, Double, Integer, Nullable, Text};

use crate::models::{BlockedSession, CheckConstraint, FastPathUsage, LockCount};

#[derive(Debug, QueryableByName)]
pub struct ExistsRow {
    #[diesel(sql_type = Bool)]
    pub present: bool,
}

#[derive(Debug, QueryableByName)]
pub struct CountRow {
    #[diesel(sql_type = BigInt)]
    pub n: i64,
}

#[derive(Debug, QueryableByName)]
pub struct CheckConstraintRow {
    #[diesel(sql_type = Text)]
    pub name: String,
    #[diesel(sql_type = Text)]
    pub definition: String,
    #[diesel(sql_type = Bool)]
    pub validated: bool,
}

impl From<CheckConstraintRow> for CheckConstraint {
    fn from(row: CheckConstraintRow) -> Self {
        Self {
            name: row.name,
            definition: row.definition,
            validated: row.validated,
        }
    }
}

/// A child of the parent with its rendered partition bound.
#[derive(Debug, QueryableByName)]
pub struct PartitionRow {
    #[diesel(sql_type = Text)]
    pub name: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub bound: Option<String>,
}

#[derive(Debug, QueryableByName)]
pub struct LockCountRow {
    #[diesel(sql_type = Text)]
    pub locktype: String,
    #[diesel(sql_type = Text)]
    pub mode: String,
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

impl From<LockCountRow> for LockCount {
    fn from(row: LockCountRow) -> Self {
        Self {
            locktype: row.locktype,
            mode: row.mode,
            count: row.count,
        }
    }
}

#[derive(Debug, QueryableByName)]
pub struct FastPathRow {
    #[diesel(sql_type = Integer)]
    pub pid: i32,
    #[diesel(sql_type = Text)]
    pub mode: String,
    #[diesel(sql_type = Bool)]
    pub fastpath: bool,
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

impl From<FastPathRow> for FastPathUsage {
    fn from(row: FastPathRow) -> Self {
        Self {
            pid: row.pid,
            mode: row.mode,
            fastpath: row.fastpath,
            count: row.count,
        }
    }
}

#[derive(Debug, QueryableByName)]
pub struct BlockedSessionRow {
    #[diesel(sql_type = Integer)]
    pub pid: i32,
    #[diesel(sql_type = Array<Integer>)]
    pub blocking_pids: Vec<i32>,
    #[diesel(sql_type = Nullable<Text>)]
    pub wait_event: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub query_excerpt: Option<String>,
    #[diesel(sql_type = Nullable<Double>)]
    pub query_age_secs: Option<f64>,
    #[diesel(sql_type = Nullable<Double>)]
    pub transaction_age_secs: Option<f64>,
}

impl From<BlockedSessionRow> for BlockedSession {
    fn from(row: BlockedSessionRow) -> Self {
        Self {
            pid: row.pid,
            blocking_pids: row.blocking_pids,
            wait_event: row.wait_event,
            query_excerpt: row.query_excerpt,
            query_age_secs: row.query_age_secs,
            transaction_age_secs: row.transaction_age_secs,
        }
    }
}

#[derive(Debug, QueryableByName)]
pub struct TerminateRow {
    #[diesel(sql_type = Bool)]
    pub terminated: bool,
}
