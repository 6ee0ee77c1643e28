//! Week rollup: consolidate seven day partitions into one week partition.
//!
//! Steps 1-5 run as one transaction (see [`build_week`]):
//!
//! 1. clone the first day child's structure into `orders_wk_<date>`;
//! 2. look up the day-range CHECK on the clone, drop it, add the week range
//!    `NOT VALID`;
//! 3. copy all rows of the seven days into the week table;
//! 4. `VALIDATE CONSTRAINT`, which scans only the week table;
//! 5. attach the week table, which skips the scan because step 4 proved the
//!    constraint.
//!
//! The rollup never detaches day partitions. While any of them are still
//! attached next to the week table, every row they hold is visible twice
//! through the parent until [`RollupCoordinator::detach_week_days`] runs.
//! Source days are read by name, so they may also be detached beforehand.
//! Two rollups of the same week must not run at the same time; the only
//! guard is the unique table name created in step 1.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use super::schema_manager::unexpected_outcome;
use crate::db::repository::{
    DdlCommand, DdlOutcome, ErrorContext, PartitionOps, PartitionRepository, RepositoryError,
    RepositoryResult,
};
use crate::db::sql::{ddl, Ident, PartitionNaming, QualifiedName};
use crate::models::{ConstraintState, TimeRange};
use crate::planner::{start_of_day, Window};

/// Number of day partitions in one week rollup.
pub const DAYS_PER_WEEK: usize = 7;

/// Names and bounds of one week rollup, derived from the week start.
#[derive(Debug, Clone, PartialEq)]
pub struct RollupPlan {
    pub naming: PartitionNaming,
    pub week: Window,
    pub week_table: QualifiedName,
    pub week_constraint: Ident,
    /// Day child whose structure is cloned.
    pub clone_source: QualifiedName,
    pub days: Vec<QualifiedName>,
}

impl RollupPlan {
    pub fn for_week(schema: &Ident, week_start: NaiveDate) -> RepositoryResult<Self> {
        let naming = PartitionNaming::new(schema.clone());
        let week = Window::week(week_start);
        let week_table = naming.child(&week.suffix)?;
        let week_constraint = PartitionNaming::range_constraint(&week.suffix)?;
        let days = (0..DAYS_PER_WEEK as i64)
            .map(|offset| {
                let day = Window::day(week_start + Duration::days(offset));
                naming.child(&day.suffix)
            })
            .collect::<RepositoryResult<Vec<_>>>()?;
        Ok(Self {
            naming,
            week,
            week_table,
            week_constraint,
            clone_source: days[0].clone(),
            days,
        })
    }

    pub fn range(&self) -> &TimeRange {
        &self.week.range
    }

    /// The statements the rollup issues, in order.
    ///
    /// The name of the constraint dropped in step 2 is only known once the
    /// catalog has been read, so it is shown as a placeholder.
    pub fn describe(&self) -> Vec<RollupStep> {
        let mut steps = vec![
            RollupStep::new(
                1,
                "clone structure",
                ddl::clone_like(&self.clone_source, &self.week_table),
            ),
            RollupStep::new(
                2,
                "drop day range constraint",
                format!(
                    "ALTER TABLE {} DROP CONSTRAINT <discovered from catalog>",
                    self.week_table
                ),
            ),
            RollupStep::new(
                2,
                "add week range constraint",
                ddl::add_range_constraint(
                    &self.week_table,
                    &self.week_constraint,
                    self.range(),
                    ConstraintState::NotValid,
                ),
            ),
        ];
        for day in &self.days {
            steps.push(RollupStep::new(
                3,
                "copy day rows",
                ddl::copy_rows(day, &self.week_table),
            ));
        }
        steps.push(RollupStep::new(
            4,
            "validate week range constraint",
            ddl::validate_constraint(&self.week_table, &self.week_constraint),
        ));
        steps.push(RollupStep::new(
            5,
            "attach week partition",
            ddl::attach(&self.naming.parent(), &self.week_table, self.range()),
        ));
        steps
    }
}

/// One narrated rollup statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollupStep {
    pub step: u8,
    pub name: &'static str,
    pub sql: String,
}

impl RollupStep {
    fn new(step: u8, name: &'static str, sql: String) -> Self {
        Self { step, name, sql }
    }
}

/// Rows copied from one day partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayCopy {
    pub table: String,
    pub rows: u64,
}

/// Outcome of a rollup (or of its dry run).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupReport {
    pub week_table: String,
    pub range: TimeRange,
    /// False for a dry run: nothing was executed.
    pub executed: bool,
    pub dropped_constraint: Option<String>,
    pub copied: Vec<DayCopy>,
    pub total_rows: u64,
    /// Source day tables that do not exist.
    pub missing_sources: Vec<String>,
    /// Source day tables still attached to the parent.
    pub attached_sources: Vec<String>,
    pub steps: Vec<RollupStep>,
}

/// Steps 1-5 on an open transaction.
pub fn build_week(ops: &mut dyn PartitionOps, plan: &RollupPlan) -> RepositoryResult<RollupReport> {
    let week = &plan.week_table;
    let in_step = |step: &str| ErrorContext::new("rollup_week").with_details(step.to_string());

    // 1
    ops.clone_structure(&plan.clone_source, week)?;

    // 2
    let inherited = ops.find_range_constraint(week)?.ok_or_else(|| {
        RepositoryError::constraint_discovery(
            format!(
                "clone source {} carries no range CHECK constraint",
                plan.clone_source.key()
            ),
            in_step("discover day range constraint").with_entity_id(week.key()),
        )
    })?;
    let inherited_name = Ident::new(inherited.name.clone()).map_err(|_| {
        RepositoryError::constraint_discovery(
            format!("unexpected constraint name '{}'", inherited.name),
            in_step("discover day range constraint").with_entity_id(week.key()),
        )
    })?;
    ops.drop_constraint(week, &inherited_name)?;
    ops.add_range_constraint(
        week,
        &plan.week_constraint,
        plan.range(),
        ConstraintState::NotValid,
    )?;

    // 3
    let mut copied = Vec::with_capacity(plan.days.len());
    for day in &plan.days {
        let rows = ops.copy_rows(day, week)?;
        log::debug!("copied {} rows from {} into {}", rows, day.key(), week.key());
        copied.push(DayCopy {
            table: day.name.as_str().to_string(),
            rows,
        });
    }

    // 4
    ops.validate_constraint(week, &plan.week_constraint)?;

    // 5
    attach_partition(ops, &plan.naming, week.name.as_str(), plan.range())?;

    Ok(RollupReport {
        week_table: week.name.as_str().to_string(),
        range: *plan.range(),
        executed: true,
        dropped_constraint: Some(inherited.name),
        total_rows: copied.iter().map(|c| c.rows).sum(),
        copied,
        missing_sources: Vec::new(),
        attached_sources: Vec::new(),
        steps: plan.describe(),
    })
}

/// Attach `name` for `range` once its validated range constraint proves
/// the rows fit, so the store does not rescan.
///
/// # Errors
/// * `ConstraintDiscovery` - the child has no range constraint
/// * `ValidationFailure` - the constraint is `NOT VALID` or its bounds differ
///   from `range`
pub fn attach_partition(
    ops: &mut dyn PartitionOps,
    naming: &PartitionNaming,
    name: &str,
    range: &TimeRange,
) -> RepositoryResult<()> {
    let child = naming.relation(name)?;
    let constraint = ops.require_range_constraint(&child)?;
    if !constraint.permits_attach(range) {
        return Err(RepositoryError::validation_with_context(
            format!(
                "constraint {} ({:?}, {}) does not match attach range {}",
                constraint.name, constraint.state, constraint.range, range
            ),
            ErrorContext::new("attach_partition")
                .with_entity("partition")
                .with_entity_id(child.key()),
        ));
    }
    ops.attach(&naming.parent(), &child, range)?;
    log::info!("attached {} for {}", child.key(), range);
    Ok(())
}

/// Remove `name` from the parent's partition map without dropping it.
pub fn detach_partition(
    ops: &mut dyn PartitionOps,
    naming: &PartitionNaming,
    name: &str,
) -> RepositoryResult<()> {
    let child = naming.relation(name)?;
    ops.detach(&naming.parent(), &child)?;
    log::info!("detached {}", child.key());
    Ok(())
}

/// Whether a rollup executes or only narrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupMode {
    /// Read-only: report the statements and missing sources.
    DryRun,
    Commit,
}

/// Async front-end for rollups and attach/detach.
pub struct RollupCoordinator<R: PartitionRepository + ?Sized> {
    repo: Arc<R>,
}

impl<R: PartitionRepository + ?Sized> RollupCoordinator<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Consolidate the seven days starting at `week_start`.
    pub async fn rollup_week(
        &self,
        schema: &Ident,
        week_start: NaiveDate,
        mode: RollupMode,
    ) -> RepositoryResult<RollupReport> {
        let plan = RollupPlan::for_week(schema, week_start)?;

        if mode == RollupMode::DryRun {
            let mut missing_sources = Vec::new();
            for day in &plan.days {
                if !self.repo.relation_exists(day).await? {
                    missing_sources.push(day.name.as_str().to_string());
                }
            }
            let attached_sources = self.attached_sources(&plan).await?;
            let steps = plan.describe();
            for step in &steps {
                log::info!("[dry run] step {} {}: {}", step.step, step.name, step.sql);
            }
            return Ok(RollupReport {
                week_table: plan.week_table.name.as_str().to_string(),
                range: *plan.range(),
                executed: false,
                dropped_constraint: None,
                copied: Vec::new(),
                total_rows: 0,
                missing_sources,
                attached_sources,
                steps,
            });
        }

        let outcome = self
            .repo
            .execute(DdlCommand::RollupWeek { plan: plan.clone() })
            .await
            .map_err(|e| e.with_entity_id(plan.week_table.key()))?;
        match outcome {
            DdlOutcome::Rollup(mut report) => {
                log::info!(
                    "week partition {} attached for {} with {} rows",
                    report.week_table,
                    report.range,
                    report.total_rows
                );
                report.attached_sources = self.attached_sources(&plan).await?;
                if !report.attached_sources.is_empty() {
                    log::warn!(
                        "{} day partition(s) of {} are still attached; parent scans count their rows twice until they are detached",
                        report.attached_sources.len(),
                        week_start
                    );
                }
                Ok(report)
            }
            other => Err(unexpected_outcome("rollup_week", &other)),
        }
    }

    async fn attached_sources(&self, plan: &RollupPlan) -> RepositoryResult<Vec<String>> {
        let attached: HashSet<String> = self
            .repo
            .list_partitions(&plan.naming)
            .await?
            .into_iter()
            .map(|p| p.name)
            .collect();
        Ok(plan
            .days
            .iter()
            .map(|d| d.name.as_str().to_string())
            .filter(|name| attached.contains(name))
            .collect())
    }

    /// Attach a previously detached child for `[lo, hi)`.
    pub async fn attach_partition(
        &self,
        schema: &Ident,
        name: &str,
        lo: chrono::NaiveDateTime,
        hi: chrono::NaiveDateTime,
    ) -> RepositoryResult<()> {
        let range = TimeRange::new(lo, hi)?;
        self.repo
            .execute(DdlCommand::AttachPartition {
                naming: PartitionNaming::new(schema.clone()),
                name: name.to_string(),
                range,
            })
            .await?;
        Ok(())
    }

    /// Detach a child from the parent without dropping it.
    pub async fn detach_partition(&self, schema: &Ident, name: &str) -> RepositoryResult<()> {
        self.repo
            .execute(DdlCommand::DetachPartition {
                naming: PartitionNaming::new(schema.clone()),
                name: name.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Detach the seven day children of a week, one transaction each.
    ///
    /// Stops at the first failure; days detached before it stay detached.
    pub async fn detach_week_days(
        &self,
        schema: &Ident,
        week_start: NaiveDate,
    ) -> RepositoryResult<Vec<String>> {
        let plan = RollupPlan::for_week(schema, week_start)?;
        let mut detached = Vec::with_capacity(plan.days.len());
        for day in &plan.days {
            self.detach_partition(schema, day.name.as_str()).await?;
            detached.push(day.name.as_str().to_string());
        }
        Ok(detached)
    }
}

/// Convenience for callers holding a calendar date.
pub fn week_range(week_start: NaiveDate) -> TimeRange {
    let lo = start_of_day(week_start);
    TimeRange {
        lo,
        hi: lo + Duration::days(DAYS_PER_WEEK as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_names_week_and_days() {
        let schema = Ident::new("public").unwrap();
        let plan = RollupPlan::for_week(&schema, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap())
            .unwrap();
        assert_eq!(plan.week_table.name.as_str(), "orders_wk_2025_01_01");
        assert_eq!(plan.week_constraint.as_str(), "orders_wk_2025_01_01_range");
        assert_eq!(plan.days.len(), DAYS_PER_WEEK);
        assert_eq!(plan.days[0].name.as_str(), "orders_2025_01_01");
        assert_eq!(plan.days[6].name.as_str(), "orders_2025_01_07");
        assert_eq!(plan.clone_source, plan.days[0]);
        assert_eq!(*plan.range(), week_range(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()));
    }

    #[test]
    fn described_steps_follow_protocol_order() {
        let schema = Ident::new("public").unwrap();
        let plan = RollupPlan::for_week(&schema, NaiveDate::from_ymd_opt(2025, 3, 3).unwrap())
            .unwrap();
        let steps = plan.describe();
        let order: Vec<u8> = steps.iter().map(|s| s.step).collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
        assert_eq!(steps.iter().filter(|s| s.step == 3).count(), DAYS_PER_WEEK);
        assert!(steps[2].sql.ends_with("NOT VALID"));
        assert!(steps.last().unwrap().sql.contains("ATTACH PARTITION"));
    }
}
