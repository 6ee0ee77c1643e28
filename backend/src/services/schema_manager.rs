//! Parent table and child partition creation.
//!
//! The free functions run on an open transaction and are what
//! [`DdlCommand::apply`](crate::db::repository::DdlCommand::apply) calls;
//! [`SchemaManager`] is the async front-end that submits those commands.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;

use crate::db::repository::{
    DdlCommand, DdlOutcome, PartitionOps, PartitionRepository, RepositoryError, RepositoryResult,
};
use crate::db::sql::{child_index_set, Ident, PartitionNaming};
use crate::models::ConstraintState;
use crate::planner::{plan_date_windows, Grain, Window};

/// Drop and recreate the parent. Lab targets only.
pub fn recreate_parent(ops: &mut dyn PartitionOps, naming: &PartitionNaming) -> RepositoryResult<()> {
    let parent = naming.parent();
    log::warn!("recreating partitioned parent {} (destructive)", parent.key());
    ops.recreate_parent(&parent)
}

/// Create the child for `window` with its validated range constraint.
///
/// Returns `false` without touching anything when the child already exists.
pub fn create_child_partition(
    ops: &mut dyn PartitionOps,
    naming: &PartitionNaming,
    window: &Window,
) -> RepositoryResult<bool> {
    let child = naming.child(&window.suffix)?;
    if ops.relation_exists(&child)? {
        log::debug!("partition {} already exists", child.key());
        return Ok(false);
    }

    ops.create_child(&naming.parent(), &child, &window.range)?;
    // Empty table, so the validating add is instant.
    let constraint = PartitionNaming::range_constraint(&window.suffix)?;
    ops.add_range_constraint(&child, &constraint, &window.range, ConstraintState::Valid)?;
    log::info!("created partition {} for {}", child.key(), window.range);
    Ok(true)
}

/// Create the index set on the child named by `suffix`.
///
/// Returns the number of index statements issued.
pub fn create_indexes(
    ops: &mut dyn PartitionOps,
    naming: &PartitionNaming,
    suffix: &str,
    dummy_count: u32,
) -> RepositoryResult<usize> {
    let child = naming.child(suffix)?;
    let specs = child_index_set(&child, suffix, dummy_count)?;
    for spec in &specs {
        ops.create_index(spec)?;
    }
    Ok(specs.len())
}

/// Outcome of [`SchemaManager::create_partition_range`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionRangeReport {
    pub windows: usize,
    pub created: usize,
    pub existing: usize,
    pub indexes: usize,
}

/// Async front-end for schema creation.
pub struct SchemaManager<R: PartitionRepository + ?Sized> {
    repo: Arc<R>,
}

impl<R: PartitionRepository + ?Sized> SchemaManager<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Drop and recreate the parent in `schema`.
    ///
    /// Destructive; callers gate this to lab targets.
    pub async fn create_parent(&self, schema: &Ident) -> RepositoryResult<()> {
        self.repo
            .execute(DdlCommand::CreateParent {
                naming: PartitionNaming::new(schema.clone()),
            })
            .await?;
        Ok(())
    }

    /// Create the child for one window. Idempotent.
    ///
    /// # Returns
    /// * `Ok(true)` - The child was created
    /// * `Ok(false)` - It already existed
    pub async fn create_child_partition(
        &self,
        schema: &Ident,
        window: &Window,
    ) -> RepositoryResult<bool> {
        let outcome = self
            .repo
            .execute(DdlCommand::CreateChildPartition {
                naming: PartitionNaming::new(schema.clone()),
                window: window.clone(),
            })
            .await?;
        match outcome {
            DdlOutcome::ChildPartition { created } => Ok(created),
            other => Err(unexpected_outcome("create_child_partition", &other)),
        }
    }

    /// Create the index set on one child.
    pub async fn create_indexes(
        &self,
        schema: &Ident,
        suffix: &str,
        dummy_count: u32,
    ) -> RepositoryResult<usize> {
        let outcome = self
            .repo
            .execute(DdlCommand::CreateIndexes {
                naming: PartitionNaming::new(schema.clone()),
                suffix: suffix.to_string(),
                dummy_count,
            })
            .await?;
        match outcome {
            DdlOutcome::Indexes { count } => Ok(count),
            other => Err(unexpected_outcome("create_indexes", &other)),
        }
    }

    /// Create a child plus indexes for every window of `[start, end)`.
    ///
    /// Each window is its own pair of transactions, so a failure leaves the
    /// windows already processed intact; the first error is returned as is.
    pub async fn create_partition_range(
        &self,
        schema: &Ident,
        start: NaiveDate,
        end: NaiveDate,
        grain: Grain,
        dummy_count: u32,
    ) -> RepositoryResult<PartitionRangeReport> {
        let mut report = PartitionRangeReport::default();
        for window in plan_date_windows(start, end, grain)? {
            let created = self
                .create_child_partition(schema, &window)
                .await
                .map_err(|e| e.with_entity_id(&window.suffix))?;
            report.indexes += self
                .create_indexes(schema, &window.suffix, dummy_count)
                .await
                .map_err(|e| e.with_entity_id(&window.suffix))?;
            report.windows += 1;
            if created {
                report.created += 1;
            } else {
                report.existing += 1;
            }
        }
        log::info!(
            "partition range {}..{} ({}): {} windows, {} created, {} existing",
            start,
            end,
            grain,
            report.windows,
            report.created,
            report.existing
        );
        Ok(report)
    }
}

pub(crate) fn unexpected_outcome(operation: &str, outcome: &DdlOutcome) -> RepositoryError {
    RepositoryError::internal(format!(
        "{} returned unexpected outcome {:?}",
        operation, outcome
    ))
}
