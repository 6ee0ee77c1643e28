//! Partition lifecycle against the in-memory repository: child creation,
//! week rollups, attach/detach and seeding.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use partition_lab::db::repositories::LocalRepository;
use partition_lab::db::repository::{PartitionRepository, RepositoryError};
use partition_lab::db::{Ident, PartitionNaming};
use partition_lab::models::{GrainTag, OrderRow, TimeRange};
use partition_lab::planner::{start_of_day, Grain};
use partition_lab::services::rollup::week_range;
use partition_lab::services::{
    seed_orders, RollupCoordinator, RollupMode, SchemaManager, SeedPlan,
};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn ts(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
    date(y, m, d).and_hms_opt(h, 0, 0).unwrap()
}

fn schema() -> Ident {
    Ident::new("lab").unwrap()
}

fn naming() -> PartitionNaming {
    PartitionNaming::new(schema())
}

/// Parent plus day children for `[start, end)`.
async fn lab_with_days(start: NaiveDate, end: NaiveDate, dummy: u32) -> Arc<LocalRepository> {
    let repo = Arc::new(LocalRepository::new());
    let manager = SchemaManager::new(repo.clone());
    manager.create_parent(&schema()).await.unwrap();
    manager
        .create_partition_range(&schema(), start, end, Grain::Day, dummy)
        .await
        .unwrap();
    repo
}

/// First week of January, ten rows per day.
async fn seeded_first_week() -> Arc<LocalRepository> {
    let repo = lab_with_days(date(2025, 1, 1), date(2025, 1, 8), 0).await;
    let plan = SeedPlan::new(date(2025, 1, 1), date(2025, 1, 8), 70).with_batch_size(4);
    let report = seed_orders(repo.as_ref(), &schema(), &plan).await.unwrap();
    assert_eq!(report.inserted, 70);
    repo
}

fn order_at(order_time: NaiveDateTime) -> OrderRow {
    OrderRow {
        order_id: uuid::Uuid::new_v4(),
        customer_id: 1,
        store_id: 1,
        status: "new".to_string(),
        amount: 10.0,
        order_time,
        updated_at: order_time,
    }
}

// =========================================================
// Schema creation
// =========================================================

#[tokio::test]
async fn test_create_partition_range_is_idempotent() {
    let repo = lab_with_days(date(2025, 1, 1), date(2025, 1, 8), 2).await;
    let manager = SchemaManager::new(repo.clone());
    let child = naming().child("2025_01_03").unwrap();
    let indexes_before = repo.index_names(&child);
    assert_eq!(indexes_before.len(), 6);
    assert!(indexes_before.contains(&"idx_orders_2025_01_03_order_time".to_string()));
    assert!(indexes_before.contains(&"idx_orders_2025_01_03_dummy_1".to_string()));

    let report = manager
        .create_partition_range(&schema(), date(2025, 1, 1), date(2025, 1, 8), Grain::Day, 2)
        .await
        .unwrap();
    assert_eq!(report.windows, 7);
    assert_eq!(report.created, 0);
    assert_eq!(report.existing, 7);

    let partitions = repo.list_partitions(&naming()).await.unwrap();
    assert_eq!(partitions.len(), 7);
    assert_eq!(repo.index_names(&child), indexes_before);
}

#[tokio::test]
async fn test_every_child_carries_a_validated_range_constraint() {
    let repo = lab_with_days(date(2025, 1, 1), date(2025, 1, 3), 0).await;
    let child = naming().child("2025_01_02").unwrap();
    let constraints = repo.constraints_of(&child);
    assert_eq!(constraints.len(), 1);
    assert_eq!(constraints[0].name, "orders_2025_01_02_range");
    assert!(constraints[0].validated);

    let range = constraints[0].as_range().unwrap().range;
    assert_eq!(range, TimeRange::new(ts(2025, 1, 2, 0), ts(2025, 1, 3, 0)).unwrap());
}

#[tokio::test]
async fn test_week_grain_clips_last_window() {
    let repo = Arc::new(LocalRepository::new());
    let manager = SchemaManager::new(repo.clone());
    manager.create_parent(&schema()).await.unwrap();
    let report = manager
        .create_partition_range(&schema(), date(2025, 1, 1), date(2025, 1, 20), Grain::Week, 0)
        .await
        .unwrap();
    assert_eq!(report.created, 3);

    let partitions = repo.list_partitions(&naming()).await.unwrap();
    let names: Vec<_> = partitions.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["orders_wk_2025_01_01", "orders_wk_2025_01_08", "orders_wk_2025_01_15"]
    );
    assert!(partitions.iter().all(|p| p.grain == GrainTag::WeekRollup));
    assert_eq!(partitions[2].range.unwrap().hi, ts(2025, 1, 20, 0));
}

#[tokio::test]
async fn test_reversed_range_creates_nothing() {
    let repo = Arc::new(LocalRepository::new());
    let manager = SchemaManager::new(repo.clone());
    manager.create_parent(&schema()).await.unwrap();
    let result = manager
        .create_partition_range(&schema(), date(2025, 1, 8), date(2025, 1, 1), Grain::Day, 0)
        .await;
    assert!(matches!(result, Err(RepositoryError::InvalidRange { .. })));
    assert!(repo.list_partitions(&naming()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lock_timeout_surfaces_and_keeps_earlier_windows() {
    let repo = Arc::new(LocalRepository::with_lock_timeout(100));
    let manager = SchemaManager::new(repo.clone());
    manager.create_parent(&schema()).await.unwrap();
    let blocked = naming().child("2025_01_03").unwrap();
    repo.lock_relation(&blocked);

    let err = manager
        .create_partition_range(&schema(), date(2025, 1, 1), date(2025, 1, 5), Grain::Day, 0)
        .await
        .unwrap_err();
    assert!(err.is_lock_timeout());
    assert_eq!(err.context().entity_id.as_deref(), Some("lab.orders_2025_01_03"));
    assert!(!repo.relation_exists(&blocked));
    assert_eq!(repo.list_partitions(&naming()).await.unwrap().len(), 2);

    repo.unlock_relation(&blocked);
    let report = manager
        .create_partition_range(&schema(), date(2025, 1, 1), date(2025, 1, 5), Grain::Day, 0)
        .await
        .unwrap();
    assert_eq!(report.created, 2);
    assert_eq!(report.existing, 2);
}

// =========================================================
// Seeding and routing
// =========================================================

#[tokio::test]
async fn test_seed_routes_rows_to_day_children() {
    let repo = seeded_first_week().await;
    let parent = naming().parent();
    assert_eq!(repo.count_rows(&parent, None).await.unwrap(), 70);

    let day = naming().child("2025_01_03").unwrap();
    assert_eq!(repo.count_rows(&day, None).await.unwrap(), 10);

    let two_days = TimeRange::new(ts(2025, 1, 2, 0), ts(2025, 1, 4, 0)).unwrap();
    assert_eq!(repo.count_rows(&parent, Some(two_days)).await.unwrap(), 20);
}

#[tokio::test]
async fn test_insert_without_matching_partition_is_all_or_nothing() {
    let repo = lab_with_days(date(2025, 1, 1), date(2025, 1, 3), 0).await;
    let parent = naming().parent();
    let rows = vec![order_at(ts(2025, 1, 1, 9)), order_at(ts(2025, 3, 1, 9))];

    let err = repo.insert_orders(&parent, &rows).await.unwrap_err();
    assert!(matches!(err, RepositoryError::QueryError { .. }));
    assert!(err.to_string().contains("no partition"));
    assert_eq!(repo.count_rows(&parent, None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_count_unknown_relation_is_not_found() {
    let repo = lab_with_days(date(2025, 1, 1), date(2025, 1, 2), 0).await;
    let missing = naming().child("2030_01_01").unwrap();
    let err = repo.count_rows(&missing, None).await.unwrap_err();
    assert!(matches!(err, RepositoryError::NotFound { .. }));
}

// =========================================================
// Week rollup
// =========================================================

#[tokio::test]
async fn test_first_week_of_january_rollup() {
    let repo = seeded_first_week().await;
    let coordinator = RollupCoordinator::new(repo.clone());

    let report = coordinator
        .rollup_week(&schema(), date(2025, 1, 1), RollupMode::Commit)
        .await
        .unwrap();
    assert!(report.executed);
    assert_eq!(report.week_table, "orders_wk_2025_01_01");
    assert_eq!(report.range, week_range(date(2025, 1, 1)));
    assert_eq!(report.range.hi, start_of_day(date(2025, 1, 8)));
    assert_eq!(report.dropped_constraint.as_deref(), Some("orders_2025_01_01_range"));
    assert_eq!(report.copied.len(), 7);
    assert!(report.copied.iter().all(|c| c.rows == 10));
    assert_eq!(report.total_rows, 70);

    let week = naming().child("wk_2025_01_01").unwrap();
    assert_eq!(repo.count_rows(&week, None).await.unwrap(), 70);
    let constraints = repo.constraints_of(&week);
    assert_eq!(constraints.len(), 1);
    assert_eq!(constraints[0].name, "orders_wk_2025_01_01_range");
    assert!(constraints[0].validated);

    let weeks: Vec<_> = repo
        .list_partitions(&naming())
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.grain == GrainTag::WeekRollup)
        .collect();
    assert_eq!(weeks.len(), 1);
    assert_eq!(weeks[0].range, Some(report.range));
}

#[tokio::test]
async fn test_parent_double_counts_until_days_are_retired() {
    let repo = seeded_first_week().await;
    let coordinator = RollupCoordinator::new(repo.clone());
    let report = coordinator
        .rollup_week(&schema(), date(2025, 1, 1), RollupMode::Commit)
        .await
        .unwrap();
    assert_eq!(report.attached_sources.len(), 7);
    assert_eq!(report.attached_sources[6], "orders_2025_01_07");

    let parent = naming().parent();
    let week = week_range(date(2025, 1, 1));
    assert_eq!(repo.count_rows(&parent, Some(week)).await.unwrap(), 140);

    let detached = coordinator
        .detach_week_days(&schema(), date(2025, 1, 1))
        .await
        .unwrap();
    assert_eq!(detached.len(), 7);
    assert_eq!(detached[0], "orders_2025_01_01");
    assert_eq!(repo.count_rows(&parent, Some(week)).await.unwrap(), 70);

    // Detached, not dropped.
    let day = naming().child("2025_01_04").unwrap();
    assert!(repo.relation_exists(&day));
    assert_eq!(repo.count_rows(&day, None).await.unwrap(), 10);
    assert_eq!(repo.list_partitions(&naming()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_second_rollup_of_same_week_fails_cleanly() {
    let repo = seeded_first_week().await;
    let coordinator = RollupCoordinator::new(repo.clone());
    coordinator
        .rollup_week(&schema(), date(2025, 1, 1), RollupMode::Commit)
        .await
        .unwrap();

    let err = coordinator
        .rollup_week(&schema(), date(2025, 1, 1), RollupMode::Commit)
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::QueryError { .. }));
    assert!(err.to_string().contains("already exists"));

    let week = naming().child("wk_2025_01_01").unwrap();
    assert_eq!(repo.count_rows(&week, None).await.unwrap(), 70);
}

#[tokio::test]
async fn test_rollup_with_missing_day_rolls_back() {
    let repo = lab_with_days(date(2025, 1, 1), date(2025, 1, 6), 0).await;
    let coordinator = RollupCoordinator::new(repo.clone());

    let err = coordinator
        .rollup_week(&schema(), date(2025, 1, 1), RollupMode::Commit)
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::NotFound { .. }));
    assert!(!repo.relation_exists(&naming().child("wk_2025_01_01").unwrap()));
}

#[tokio::test]
async fn test_rollup_lock_timeout_rolls_back_every_step() {
    let repo = seeded_first_week().await;
    let coordinator = RollupCoordinator::new(repo.clone());
    // Steps 1-4 only touch the day and week tables; step 5 needs the parent.
    repo.lock_relation(&naming().parent());

    let err = coordinator
        .rollup_week(&schema(), date(2025, 1, 1), RollupMode::Commit)
        .await
        .unwrap_err();
    assert!(err.is_lock_timeout());
    let week = naming().child("wk_2025_01_01").unwrap();
    assert!(!repo.relation_exists(&week));
    assert!(repo.index_names(&week).is_empty());

    repo.unlock_relation(&naming().parent());
    let report = coordinator
        .rollup_week(&schema(), date(2025, 1, 1), RollupMode::Commit)
        .await
        .unwrap();
    assert_eq!(report.total_rows, 70);
}

#[tokio::test]
async fn test_dry_run_is_read_only_and_reports_missing_days() {
    let repo = lab_with_days(date(2025, 1, 1), date(2025, 1, 6), 0).await;
    let coordinator = RollupCoordinator::new(repo.clone());

    let report = coordinator
        .rollup_week(&schema(), date(2025, 1, 1), RollupMode::DryRun)
        .await
        .unwrap();
    assert!(!report.executed);
    assert_eq!(
        report.missing_sources,
        vec!["orders_2025_01_06".to_string(), "orders_2025_01_07".to_string()]
    );
    assert!(report.copied.is_empty());
    assert_eq!(report.total_rows, 0);
    assert_eq!(report.attached_sources.len(), 5);

    let steps: Vec<u8> = report.steps.iter().map(|s| s.step).collect();
    assert_eq!(steps.first(), Some(&1));
    assert_eq!(steps.last(), Some(&5));
    assert_eq!(steps.iter().filter(|s| **s == 3).count(), 7);
    assert!(report.steps[0].sql.contains("orders_wk_2025_01_01"));

    assert!(!repo.relation_exists(&naming().child("wk_2025_01_01").unwrap()));
    assert_eq!(repo.list_partitions(&naming()).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_rollup_reads_days_retired_beforehand() {
    let repo = seeded_first_week().await;
    let coordinator = RollupCoordinator::new(repo.clone());
    coordinator
        .detach_week_days(&schema(), date(2025, 1, 1))
        .await
        .unwrap();

    let dry = coordinator
        .rollup_week(&schema(), date(2025, 1, 1), RollupMode::DryRun)
        .await
        .unwrap();
    assert!(dry.missing_sources.is_empty());
    assert!(dry.attached_sources.is_empty());

    let report = coordinator
        .rollup_week(&schema(), date(2025, 1, 1), RollupMode::Commit)
        .await
        .unwrap();
    assert_eq!(report.total_rows, 70);
    assert!(report.attached_sources.is_empty());

    let week = week_range(date(2025, 1, 1));
    assert_eq!(
        repo.count_rows(&naming().parent(), Some(week)).await.unwrap(),
        70
    );
}

#[tokio::test]
async fn test_rollup_without_day_range_constraint_rolls_back() {
    let repo = seeded_first_week().await;
    let first_day = naming().child("2025_01_01").unwrap();
    assert!(repo.drop_check_constraint(&first_day, "orders_2025_01_01_range"));

    let err = RollupCoordinator::new(repo.clone())
        .rollup_week(&schema(), date(2025, 1, 1), RollupMode::Commit)
        .await
        .unwrap_err();
    match &err {
        RepositoryError::ConstraintDiscovery { context, .. } => {
            assert_eq!(context.entity_id.as_deref(), Some("lab.orders_wk_2025_01_01"));
        }
        other => panic!("expected a constraint discovery error, got {:?}", other),
    }

    let week = naming().child("wk_2025_01_01").unwrap();
    assert!(!repo.relation_exists(&week));
    assert!(repo.index_names(&week).is_empty());
    assert_eq!(repo.list_partitions(&naming()).await.unwrap().len(), 7);
}

// =========================================================
// Attach / detach
// =========================================================

#[tokio::test]
async fn test_attach_requires_matching_range() {
    let repo = lab_with_days(date(2025, 1, 1), date(2025, 1, 4), 0).await;
    let coordinator = RollupCoordinator::new(repo.clone());
    coordinator
        .detach_partition(&schema(), "orders_2025_01_02")
        .await
        .unwrap();
    assert_eq!(repo.list_partitions(&naming()).await.unwrap().len(), 2);

    let err = coordinator
        .attach_partition(&schema(), "orders_2025_01_02", ts(2025, 1, 2, 0), ts(2025, 1, 4, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::ValidationFailure { .. }));
    assert_eq!(err.context().entity_id.as_deref(), Some("lab.orders_2025_01_02"));

    coordinator
        .attach_partition(&schema(), "orders_2025_01_02", ts(2025, 1, 2, 0), ts(2025, 1, 3, 0))
        .await
        .unwrap();
    assert_eq!(repo.list_partitions(&naming()).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_attach_with_empty_range_is_rejected() {
    let repo = lab_with_days(date(2025, 1, 1), date(2025, 1, 2), 0).await;
    let coordinator = RollupCoordinator::new(repo);
    let err = coordinator
        .attach_partition(&schema(), "orders_2025_01_01", ts(2025, 1, 2, 0), ts(2025, 1, 1, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::InvalidRange { .. }));
}

#[tokio::test]
async fn test_attach_of_attached_child_fails() {
    let repo = lab_with_days(date(2025, 1, 1), date(2025, 1, 2), 0).await;
    let coordinator = RollupCoordinator::new(repo);
    let err = coordinator
        .attach_partition(&schema(), "orders_2025_01_01", ts(2025, 1, 1, 0), ts(2025, 1, 2, 0))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already a partition"));
}

#[tokio::test]
async fn test_detach_unknown_or_detached_child_fails() {
    let repo = lab_with_days(date(2025, 1, 1), date(2025, 1, 2), 0).await;
    let coordinator = RollupCoordinator::new(repo);

    let err = coordinator
        .detach_partition(&schema(), "orders_2031_01_01")
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::NotFound { .. }));

    coordinator
        .detach_partition(&schema(), "orders_2025_01_01")
        .await
        .unwrap();
    let err = coordinator
        .detach_partition(&schema(), "orders_2025_01_01")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("is not a partition"));
}

#[tokio::test]
async fn test_names_outside_identifier_rules_are_rejected() {
    let repo = lab_with_days(date(2025, 1, 1), date(2025, 1, 2), 0).await;
    let coordinator = RollupCoordinator::new(repo);
    let err = coordinator
        .detach_partition(&schema(), "orders; DROP TABLE orders")
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::ConfigurationError { .. }));
}
