//! Partition repository trait.

use async_trait::async_trait;

use super::command::{DdlCommand, DdlOutcome};
use super::error::RepositoryResult;
use crate::db::sql::{PartitionNaming, QualifiedName};
use crate::db::PoolStats;
use crate::models::{ChildPartition, OrderRow, TimeRange};

/// Repository trait for partition management.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` to work with async Rust.
#[async_trait]
pub trait PartitionRepository: Send + Sync {
    /// Check that the store answers.
    async fn health_check(&self) -> RepositoryResult<bool>;

    /// Connection pool statistics, for backends that pool connections.
    fn pool_stats(&self) -> Option<PoolStats> {
        None
    }

    /// Run one DDL command as a single all-or-nothing transaction.
    ///
    /// The connection is held for the duration of the command and released
    /// on every exit path. Failures roll back everything the command did.
    async fn execute(&self, command: DdlCommand) -> RepositoryResult<DdlOutcome>;

    /// Whether a table exists, attached to the parent or not.
    async fn relation_exists(&self, relation: &QualifiedName) -> RepositoryResult<bool>;

    /// Children currently attached to the parent, ordered by name.
    async fn list_partitions(
        &self,
        naming: &PartitionNaming,
    ) -> RepositoryResult<Vec<ChildPartition>>;

    /// Count rows in a relation, optionally restricted to `[lo, hi)`.
    async fn count_rows(
        &self,
        relation: &QualifiedName,
        range: Option<TimeRange>,
    ) -> RepositoryResult<i64>;

    /// Insert rows through the parent, which routes them to children.
    ///
    /// # Returns
    /// * `Ok(usize)` - Number of rows inserted
    async fn insert_orders(
        &self,
        parent: &QualifiedName,
        rows: &[OrderRow],
    ) -> RepositoryResult<usize>;
}
