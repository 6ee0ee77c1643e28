//! DDL commands accepted by [`PartitionRepository::execute`].
//!
//! [`PartitionRepository::execute`]: super::PartitionRepository::execute

use serde::Serialize;

use super::error::RepositoryResult;
use super::ops::PartitionOps;
use crate::db::sql::PartitionNaming;
use crate::models::TimeRange;
use crate::planner::Window;
use crate::services::rollup::{self, RollupPlan, RollupReport};
use crate::services::schema_manager;

/// One unit of DDL work. Each command runs in its own transaction.
#[derive(Debug, Clone)]
pub enum DdlCommand {
    /// Drop and recreate the partitioned parent.
    CreateParent { naming: PartitionNaming },
    /// Create one child for a window, with its range constraint.
    CreateChildPartition {
        naming: PartitionNaming,
        window: Window,
    },
    /// Create the fixed index set plus `dummy_count` redundant indexes.
    CreateIndexes {
        naming: PartitionNaming,
        suffix: String,
        dummy_count: u32,
    },
    /// Steps 1-5 of the week rollup.
    RollupWeek { plan: RollupPlan },
    AttachPartition {
        naming: PartitionNaming,
        name: String,
        range: TimeRange,
    },
    DetachPartition {
        naming: PartitionNaming,
        name: String,
    },
}

impl DdlCommand {
    /// Short name used in logs and error contexts.
    pub fn operation(&self) -> &'static str {
        match self {
            DdlCommand::CreateParent { .. } => "create_parent",
            DdlCommand::CreateChildPartition { .. } => "create_child_partition",
            DdlCommand::CreateIndexes { .. } => "create_indexes",
            DdlCommand::RollupWeek { .. } => "rollup_week",
            DdlCommand::AttachPartition { .. } => "attach_partition",
            DdlCommand::DetachPartition { .. } => "detach_partition",
        }
    }

    /// Run the command's statements on an open transaction.
    pub fn apply(&self, ops: &mut dyn PartitionOps) -> RepositoryResult<DdlOutcome> {
        let outcome = match self {
            DdlCommand::CreateParent { naming } => {
                schema_manager::recreate_parent(ops, naming)?;
                DdlOutcome::ParentCreated
            }
            DdlCommand::CreateChildPartition { naming, window } => DdlOutcome::ChildPartition {
                created: schema_manager::create_child_partition(ops, naming, window)?,
            },
            DdlCommand::CreateIndexes {
                naming,
                suffix,
                dummy_count,
            } => DdlOutcome::Indexes {
                count: schema_manager::create_indexes(ops, naming, suffix, *dummy_count)?,
            },
            DdlCommand::RollupWeek { plan } => DdlOutcome::Rollup(rollup::build_week(ops, plan)?),
            DdlCommand::AttachPartition {
                naming,
                name,
                range,
            } => {
                rollup::attach_partition(ops, naming, name, range)?;
                DdlOutcome::Attached
            }
            DdlCommand::DetachPartition { naming, name } => {
                rollup::detach_partition(ops, naming, name)?;
                DdlOutcome::Detached
            }
        };
        log::debug!("{} applied: {:?}", self.operation(), outcome);
        Ok(outcome)
    }
}

/// Result of a [`DdlCommand`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DdlOutcome {
    ParentCreated,
    /// `created` is false when the child already existed.
    ChildPartition { created: bool },
    Indexes { count: usize },
    Rollup(RollupReport),
    Attached,
    Detached,
}
