//! Statement-level primitives run inside one transaction.

use super::error::{ErrorContext, RepositoryError, RepositoryResult};
use crate::db::sql::{Ident, IndexSpec, QualifiedName};
use crate::models::{CheckConstraint, ConstraintState, RangeConstraint, TimeRange};

/// Primitives a backend executes on a transaction it already holds.
///
/// Implementations run each call as exactly one statement (or one catalog
/// query) and never commit; the caller's transaction decides the outcome.
pub trait PartitionOps {
    fn relation_exists(&mut self, table: &QualifiedName) -> RepositoryResult<bool>;

    /// Create the schema if needed, drop any previous parent, create it again.
    fn recreate_parent(&mut self, parent: &QualifiedName) -> RepositoryResult<()>;

    fn create_child(
        &mut self,
        parent: &QualifiedName,
        child: &QualifiedName,
        range: &TimeRange,
    ) -> RepositoryResult<()>;

    /// `CREATE INDEX IF NOT EXISTS`.
    fn create_index(&mut self, spec: &IndexSpec) -> RepositoryResult<()>;

    /// Copy columns, indexes and constraints of `source` into a new `target`.
    fn clone_structure(
        &mut self,
        source: &QualifiedName,
        target: &QualifiedName,
    ) -> RepositoryResult<()>;

    /// CHECK constraints of a relation, from the catalog, ordered by name.
    fn check_constraints(&mut self, table: &QualifiedName)
        -> RepositoryResult<Vec<CheckConstraint>>;

    fn add_range_constraint(
        &mut self,
        table: &QualifiedName,
        name: &Ident,
        range: &TimeRange,
        state: ConstraintState,
    ) -> RepositoryResult<()>;

    fn drop_constraint(&mut self, table: &QualifiedName, name: &Ident) -> RepositoryResult<()>;

    fn validate_constraint(&mut self, table: &QualifiedName, name: &Ident)
        -> RepositoryResult<()>;

    /// Append every row of `from` to `to`; returns the number copied.
    fn copy_rows(&mut self, from: &QualifiedName, to: &QualifiedName) -> RepositoryResult<u64>;

    fn attach(
        &mut self,
        parent: &QualifiedName,
        child: &QualifiedName,
        range: &TimeRange,
    ) -> RepositoryResult<()>;

    fn detach(&mut self, parent: &QualifiedName, child: &QualifiedName) -> RepositoryResult<()>;

    /// The first CHECK constraint on `table` that encodes a time range.
    fn find_range_constraint(
        &mut self,
        table: &QualifiedName,
    ) -> RepositoryResult<Option<RangeConstraint>> {
        Ok(self
            .check_constraints(table)?
            .iter()
            .find_map(CheckConstraint::as_range))
    }

    /// Like [`find_range_constraint`](Self::find_range_constraint), but a
    /// missing constraint is a `ConstraintDiscovery` error.
    fn require_range_constraint(
        &mut self,
        table: &QualifiedName,
    ) -> RepositoryResult<RangeConstraint> {
        self.find_range_constraint(table)?.ok_or_else(|| {
            RepositoryError::constraint_discovery(
                format!("no range CHECK constraint on {}", table.key()),
                ErrorContext::new("find_range_constraint")
                    .with_entity("relation")
                    .with_entity_id(table.key()),
            )
        })
    }
}
