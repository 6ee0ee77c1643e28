//! Contention monitor against the in-memory session table.

use std::sync::Arc;
use std::time::Duration;

use partition_lab::db::repositories::LocalRepository;
use partition_lab::services::{
    render_cycle, ContentionMonitor, MonitorSettings, OldestWaiterBlockers, StrategyKind,
};
use tokio::sync::watch;

const EXCLUSIVE: &str = "AccessExclusiveLock";

fn settings(kill_blockers: bool) -> MonitorSettings {
    MonitorSettings {
        interval: Duration::from_millis(100),
        kill_blockers,
        ..MonitorSettings::default()
    }
}

/// Session `holder` holds an exclusive relation lock that `waiter` wants.
fn blocked_pair(repo: &LocalRepository) -> (i32, i32) {
    let holder = repo.open_session("BEGIN; LOCK TABLE lab.orders", Duration::from_secs(60));
    let waiter = repo.open_session(
        "ALTER TABLE lab.orders ATTACH PARTITION lab.orders_wk_2025_01_01",
        Duration::from_secs(20),
    );
    repo.grant_lock(holder, "relation", EXCLUSIVE, false);
    repo.wait_for(waiter, "relation", EXCLUSIVE, &[holder]);
    (holder, waiter)
}

#[tokio::test]
async fn test_snapshot_lists_waiter_and_blocker() {
    let repo = Arc::new(LocalRepository::new());
    let (holder, waiter) = blocked_pair(&repo);
    let monitor = ContentionMonitor::new(repo.clone(), settings(false));

    let snapshot = monitor.capture_snapshot().await.unwrap();
    assert_eq!(snapshot.waiters.len(), 1);
    assert_eq!(snapshot.waiters[0].pid, waiter);
    assert_eq!(snapshot.waiters[0].blocking_pids, vec![holder]);
    assert!(snapshot.total_for("relation", EXCLUSIVE) >= 1);
    assert!(snapshot.waiters[0].query_age().unwrap() >= Duration::from_secs(19));
}

#[tokio::test]
async fn test_no_termination_without_kill_switch() {
    let repo = Arc::new(LocalRepository::new());
    let (holder, _) = blocked_pair(&repo);
    let monitor = ContentionMonitor::new(repo.clone(), settings(false));

    let report = monitor.run_cycle().await.unwrap();
    assert_eq!(report.snapshot.waiters.len(), 1);
    assert!(report.strategy.is_none());
    assert!(report.terminations.is_empty());
    assert!(repo.session_exists(holder));
}

#[tokio::test]
async fn test_kill_switch_terminates_each_distinct_blocker_once() {
    let repo = Arc::new(LocalRepository::new());
    let (holder, _) = blocked_pair(&repo);
    let other_holder = repo.open_session("VACUUM lab.orders_2025_01_01", Duration::from_secs(40));
    repo.grant_lock(other_holder, "relation", "ShareUpdateExclusiveLock", true);
    let second_waiter = repo.open_session("DETACH ...", Duration::from_secs(10));
    repo.wait_for(second_waiter, "relation", EXCLUSIVE, &[holder, other_holder]);

    let monitor = ContentionMonitor::new(repo.clone(), settings(true));
    let report = monitor.run_cycle().await.unwrap();
    assert_eq!(report.snapshot.waiters.len(), 2);
    assert_eq!(report.strategy, Some("terminate-all-blockers"));

    let pids: Vec<i32> = report.terminations.iter().map(|t| t.pid).collect();
    assert_eq!(pids, vec![holder, other_holder]);
    assert!(report.terminations.iter().all(|t| t.terminated));
    assert_eq!(repo.terminated_sessions(), vec![holder, other_holder]);

    let next = monitor.run_cycle().await.unwrap();
    assert!(next.snapshot.is_empty());
    assert!(next.strategy.is_none());
    assert_eq!(repo.terminated_sessions().len(), 2);
}

#[tokio::test]
async fn test_oldest_waiter_strategy_is_targeted() {
    let repo = Arc::new(LocalRepository::new());
    let (holder, _) = blocked_pair(&repo);
    let unrelated_holder = repo.open_session("LOCK TABLE lab.other", Duration::from_secs(90));
    let young_waiter = repo.open_session("SELECT ...", Duration::from_secs(1));
    repo.grant_lock(unrelated_holder, "relation", EXCLUSIVE, false);
    repo.wait_for(young_waiter, "relation", "AccessShareLock", &[unrelated_holder]);

    let monitor = ContentionMonitor::new(repo.clone(), settings(true))
        .with_strategy(Box::new(OldestWaiterBlockers));
    let report = monitor.run_cycle().await.unwrap();
    assert_eq!(report.strategy, Some("oldest-waiter-blockers"));
    assert_eq!(repo.terminated_sessions(), vec![holder]);
    assert!(repo.session_exists(unrelated_holder));
}

#[tokio::test]
async fn test_termination_failure_is_reported_and_others_proceed() {
    let repo = Arc::new(LocalRepository::new());
    let (holder, _) = blocked_pair(&repo);
    let other_holder = repo.open_session("LOCK TABLE lab.orders_2025_01_02", Duration::from_secs(5));
    let second_waiter = repo.open_session("DETACH ...", Duration::from_secs(2));
    repo.wait_for(second_waiter, "relation", EXCLUSIVE, &[other_holder]);
    repo.protect_session(holder);

    let monitor = ContentionMonitor::new(repo.clone(), settings(true))
        .with_strategy(StrategyKind::TerminateAllBlockers.build());
    let report = monitor.run_cycle().await.unwrap();

    assert_eq!(report.terminations.len(), 2);
    let failed = &report.terminations[0];
    assert_eq!(failed.pid, holder);
    assert!(!failed.terminated);
    assert!(failed.error.as_deref().unwrap().contains("Termination error"));
    assert!(report.terminations[1].terminated);
    assert!(repo.session_exists(holder));
    assert!(!repo.session_exists(other_holder));
}

#[tokio::test]
async fn test_render_cycle_limits_waiters() {
    let repo = Arc::new(LocalRepository::new());
    let holder = repo.open_session("LOCK TABLE lab.orders", Duration::from_secs(600));
    repo.grant_lock(holder, "relation", EXCLUSIVE, false);
    for i in 0..12 {
        let pid = repo.open_session(format!("SELECT {}", i), Duration::from_secs(i));
        repo.wait_for(pid, "relation", "AccessShareLock", &[holder]);
    }

    let settings = settings(false);
    let monitor = ContentionMonitor::new(repo.clone(), settings.clone());
    let report = monitor.run_cycle().await.unwrap();
    let text = render_cycle(&report, &settings);

    assert!(text.contains("=== Lock snapshot"));
    assert!(text.contains("=== Fast-path (sample) ==="));
    assert!(text.contains("=== Blockers/Waiters (12) ==="));
    assert_eq!(text.lines().filter(|l| l.contains("bpids=")).count(), 10);
    assert!(!text.contains("=== Terminations"));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["snapshot"]["waiters"].as_array().unwrap().len(), 12);
    assert!(json["strategy"].is_null());
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let repo = Arc::new(LocalRepository::new());
    blocked_pair(&repo);
    let monitor = ContentionMonitor::new(repo.clone(), settings(false));

    let (tx, rx) = watch::channel(false);
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        tx.send(true).unwrap();
    });

    let mut observed = 0u64;
    let cycles = monitor.run(rx, |_| observed += 1).await;
    stopper.await.unwrap();
    assert!(cycles >= 1);
    assert_eq!(observed, cycles);
}

#[tokio::test]
async fn test_run_does_not_start_after_shutdown() {
    let repo = Arc::new(LocalRepository::new());
    let monitor = ContentionMonitor::new(repo, settings(false));
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    assert_eq!(monitor.run(rx, |_| {}).await, 0);
}

#[tokio::test]
async fn test_run_survives_catalog_failures() {
    let repo = Arc::new(LocalRepository::new());
    repo.set_catalog_unavailable(true);
    let monitor = ContentionMonitor::new(repo.clone(), settings(false));
    assert!(monitor.run_cycle().await.is_err());

    let (tx, rx) = watch::channel(false);
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(350)).await;
        drop(tx);
    });

    let mut observed = 0u64;
    let cycles = monitor.run(rx, |_| observed += 1).await;
    stopper.await.unwrap();
    assert!(cycles >= 2);
    assert_eq!(observed, 0);
}
