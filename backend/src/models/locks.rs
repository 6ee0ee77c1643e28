use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate lock count for one `(locktype, mode)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockCount {
    pub locktype: String,
    pub mode: String,
    pub count: i64,
}

/// Fast-path vs. regular lock usage of one session for one mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastPathUsage {
    pub pid: i32,
    pub mode: String,
    pub fastpath: bool,
    pub count: i64,
}

/// A session waiting on at least one other session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedSession {
    pub pid: i32,
    pub blocking_pids: Vec<i32>,
    pub wait_event: Option<String>,
    pub query_excerpt: Option<String>,
    pub query_age_secs: Option<f64>,
    pub transaction_age_secs: Option<f64>,
}

impl BlockedSession {
    pub fn query_age(&self) -> Option<Duration> {
        self.query_age_secs
            .filter(|s| *s >= 0.0)
            .map(Duration::from_secs_f64)
    }

    pub fn transaction_age(&self) -> Option<Duration> {
        self.transaction_age_secs
            .filter(|s| *s >= 0.0)
            .map(Duration::from_secs_f64)
    }
}

/// Point-in-time sample of lock aggregates and blocked sessions.
///
/// Waiters are ordered oldest query first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockerSnapshot {
    pub captured_at: DateTime<Utc>,
    pub lock_counts: Vec<LockCount>,
    pub waiters: Vec<BlockedSession>,
}

impl BlockerSnapshot {
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Every distinct blocking session id across all waiters, ascending.
    pub fn distinct_blockers(&self) -> Vec<i32> {
        self.waiters
            .iter()
            .flat_map(|w| w.blocking_pids.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Total lock count recorded for a `(locktype, mode)` pair.
    pub fn total_for(&self, locktype: &str, mode: &str) -> i64 {
        self.lock_counts
            .iter()
            .filter(|c| c.locktype == locktype && c.mode == mode)
            .map(|c| c.count)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiter(pid: i32, blockers: &[i32]) -> BlockedSession {
        BlockedSession {
            pid,
            blocking_pids: blockers.to_vec(),
            wait_event: Some("relation".into()),
            query_excerpt: None,
            query_age_secs: Some(1.5),
            transaction_age_secs: None,
        }
    }

    #[test]
    fn distinct_blockers_deduplicates_across_waiters() {
        let snapshot = BlockerSnapshot {
            captured_at: Utc::now(),
            lock_counts: vec![],
            waiters: vec![waiter(20, &[10, 11]), waiter(21, &[10]), waiter(22, &[11, 12])],
        };
        assert_eq!(snapshot.distinct_blockers(), vec![10, 11, 12]);
    }

    #[test]
    fn negative_ages_are_dropped() {
        let mut w = waiter(1, &[2]);
        w.query_age_secs = Some(-0.2);
        assert!(w.query_age().is_none());
        assert!(w.transaction_age().is_none());
    }
}
