//! Lock contention monitor.
//!
//! Each cycle samples lock counts by `(locktype, mode)`, a bounded sample of
//! fast-path usage per session, and the sessions currently blocked by other
//! sessions. With the kill switch on, the blockers chosen by a
//! [`TerminationStrategy`] are terminated, each at most once per cycle.
//! Failures inside a cycle are logged and the loop carries on.

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;

use crate::db::repository::{LockRepository, RepositoryError, RepositoryResult};
use crate::models::{BlockerSnapshot, FastPathUsage};

/// Lower bound on the polling interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);
/// Interval used when none is configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// Parse `2`, `2s`, `1.5s` or `500ms`; values below 100ms are raised to it.
pub fn parse_interval(raw: &str) -> RepositoryResult<Duration> {
    let s = raw.trim().to_lowercase();
    let (number, scale) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 0.001)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1.0)
    } else {
        (s.as_str(), 1.0)
    };
    let value: f64 = number.trim().parse().map_err(|_| {
        RepositoryError::configuration(format!("invalid monitor interval '{}'", raw))
    })?;
    let interval = Duration::try_from_secs_f64(value * scale).map_err(|_| {
        RepositoryError::configuration(format!("invalid monitor interval '{}'", raw))
    })?;
    Ok(interval.max(MIN_INTERVAL))
}

/// Chooses which blocking sessions to terminate for a snapshot.
pub trait TerminationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Distinct session ids to terminate, in the order to try them.
    fn select(&self, snapshot: &BlockerSnapshot) -> Vec<i32>;
}

/// Every distinct blocker of every waiter.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminateAllBlockers;

impl TerminationStrategy for TerminateAllBlockers {
    fn name(&self) -> &'static str {
        "terminate-all-blockers"
    }

    fn select(&self, snapshot: &BlockerSnapshot) -> Vec<i32> {
        snapshot.distinct_blockers()
    }
}

/// Only the blockers of the longest-waiting session.
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestWaiterBlockers;

impl TerminationStrategy for OldestWaiterBlockers {
    fn name(&self) -> &'static str {
        "oldest-waiter-blockers"
    }

    fn select(&self, snapshot: &BlockerSnapshot) -> Vec<i32> {
        let mut pids = snapshot
            .waiters
            .first()
            .map(|w| w.blocking_pids.clone())
            .unwrap_or_default();
        pids.sort_unstable();
        pids.dedup();
        pids
    }
}

/// Named strategies selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    #[default]
    TerminateAllBlockers,
    OldestWaiterBlockers,
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn TerminationStrategy> {
        match self {
            StrategyKind::TerminateAllBlockers => Box::new(TerminateAllBlockers),
            StrategyKind::OldestWaiterBlockers => Box::new(OldestWaiterBlockers),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "terminate-all-blockers" | "all" => Ok(Self::TerminateAllBlockers),
            "oldest-waiter-blockers" | "oldest" => Ok(Self::OldestWaiterBlockers),
            other => Err(format!("Unknown termination strategy: {}", other)),
        }
    }
}

/// Monitor settings.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub kill_blockers: bool,
    pub fastpath_limit: usize,
    pub excerpt_len: usize,
    pub display_limit: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            kill_blockers: false,
            fastpath_limit: 20,
            excerpt_len: 120,
            display_limit: 10,
        }
    }
}

/// Result of one termination attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminationOutcome {
    pub pid: i32,
    pub terminated: bool,
    pub error: Option<String>,
}

/// Everything one cycle observed and did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub snapshot: BlockerSnapshot,
    pub fastpath: Vec<FastPathUsage>,
    pub strategy: Option<&'static str>,
    pub terminations: Vec<TerminationOutcome>,
}

/// The polling loop.
pub struct ContentionMonitor<R: LockRepository + ?Sized> {
    repo: Arc<R>,
    settings: MonitorSettings,
    strategy: Box<dyn TerminationStrategy>,
}

impl<R: LockRepository + ?Sized> ContentionMonitor<R> {
    pub fn new(repo: Arc<R>, settings: MonitorSettings) -> Self {
        Self {
            repo,
            settings,
            strategy: Box::new(TerminateAllBlockers),
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn TerminationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Lock aggregates plus blocked sessions.
    pub async fn capture_snapshot(&self) -> RepositoryResult<BlockerSnapshot> {
        let lock_counts = self.repo.lock_counts().await?;
        let waiters = self.repo.blocked_sessions(self.settings.excerpt_len).await?;
        Ok(BlockerSnapshot {
            captured_at: Utc::now(),
            lock_counts,
            waiters,
        })
    }

    /// One sampling cycle, including termination when enabled.
    pub async fn run_cycle(&self) -> RepositoryResult<CycleReport> {
        let lock_counts = self.repo.lock_counts().await?;
        let fastpath = self.repo.fastpath_usage(self.settings.fastpath_limit).await?;
        let waiters = self.repo.blocked_sessions(self.settings.excerpt_len).await?;
        let snapshot = BlockerSnapshot {
            captured_at: Utc::now(),
            lock_counts,
            waiters,
        };

        let (strategy, terminations) = if self.settings.kill_blockers && !snapshot.is_empty() {
            (
                Some(self.strategy.name()),
                self.terminate_blockers(&snapshot).await,
            )
        } else {
            (None, Vec::new())
        };

        Ok(CycleReport {
            snapshot,
            fastpath,
            strategy,
            terminations,
        })
    }

    /// Terminate the sessions the strategy picks; failures are reported per
    /// session and never abort the remaining attempts.
    pub async fn terminate_blockers(&self, snapshot: &BlockerSnapshot) -> Vec<TerminationOutcome> {
        let targets = self.strategy.select(snapshot);
        log::warn!(
            "terminating {} blocking session(s) with {}",
            targets.len(),
            self.strategy.name()
        );
        let mut outcomes = Vec::with_capacity(targets.len());
        for pid in targets {
            let result = match self.repo.terminate_session(pid).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(RepositoryError::termination(
                    pid,
                    "session was not signalled (already gone?)",
                )),
                Err(e) => Err(e.with_entity_id(pid)),
            };
            match result {
                Ok(()) => outcomes.push(TerminationOutcome {
                    pid,
                    terminated: true,
                    error: None,
                }),
                Err(e) => {
                    log::warn!("failed to terminate session {}: {}", pid, e);
                    outcomes.push(TerminationOutcome {
                        pid,
                        terminated: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        outcomes
    }

    /// Poll until `shutdown` turns true or its sender goes away.
    ///
    /// `observer` sees every successful cycle. Returns the number of cycles
    /// attempted.
    pub async fn run<F>(&self, mut shutdown: watch::Receiver<bool>, mut observer: F) -> u64
    where
        F: FnMut(&CycleReport),
    {
        let mut cycles = 0u64;
        log::info!(
            "contention monitor started (every {:?}, kill_blockers={})",
            self.settings.interval,
            self.settings.kill_blockers
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            cycles += 1;
            match self.run_cycle().await {
                Ok(report) => observer(&report),
                Err(e) => log::warn!("monitor cycle {} failed: {}", cycles, e),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("contention monitor stopped after {} cycle(s)", cycles);
        cycles
    }
}

fn fmt_age(secs: Option<f64>) -> String {
    match secs {
        Some(s) => format!("{:.1}s", s),
        None => "-".to_string(),
    }
}

/// Human-readable view of a cycle, bounded by the display limits.
pub fn render_cycle(report: &CycleReport, settings: &MonitorSettings) -> String {
    let mut out = String::new();
    let snapshot = &report.snapshot;

    let _ = writeln!(out, "=== Lock snapshot ({}) ===", snapshot.captured_at);
    for c in &snapshot.lock_counts {
        let _ = writeln!(out, "  {:>12} | {:<24} | {}", c.locktype, c.mode, c.count);
    }

    let _ = writeln!(out, "=== Fast-path (sample) ===");
    for f in report.fastpath.iter().take(settings.fastpath_limit) {
        let _ = writeln!(
            out,
            "  pid={} mode={:<24} fastpath={} cnt={}",
            f.pid, f.mode, f.fastpath, f.count
        );
    }

    let _ = writeln!(out, "=== Blockers/Waiters ({}) ===", snapshot.waiters.len());
    for w in snapshot.waiters.iter().take(settings.display_limit) {
        let _ = writeln!(
            out,
            "  pid={} wait={} qage={} xage={} bpids={:?} :: {}",
            w.pid,
            w.wait_event.as_deref().unwrap_or("-"),
            fmt_age(w.query_age_secs),
            fmt_age(w.transaction_age_secs),
            w.blocking_pids,
            w.query_excerpt.as_deref().unwrap_or("")
        );
    }

    if let Some(strategy) = report.strategy {
        let _ = writeln!(out, "=== Terminations ({}) ===", strategy);
        for t in &report.terminations {
            match &t.error {
                None => {
                    let _ = writeln!(out, "  pid={} terminated", t.pid);
                }
                Some(e) => {
                    let _ = writeln!(out, "  pid={} failed: {}", t.pid, e);
                }
            }
        }
    }
    out
}
