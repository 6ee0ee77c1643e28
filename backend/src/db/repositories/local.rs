//! In-memory repository for tests and offline runs.
//!
//! Models the parts of the store the partition lifecycle depends on:
//! relations with CHECK constraints, a partitioned parent routing rows to
//! attached children, schema-wide index names, and a session table with
//! held and awaited locks. DDL commands run against a draft copy of the
//! state that replaces the live state only when the command succeeds.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::db::repository::{
    DdlCommand, DdlOutcome, ErrorContext, LockRepository, PartitionOps, PartitionRepository,
    RepositoryError, RepositoryResult,
};
use crate::db::sql::{Ident, IndexSpec, PartitionNaming, QualifiedName, ORDERING_KEY};
use crate::models::{
    format_timestamp, BlockedSession, CheckConstraint, ChildPartition, ConstraintState,
    FastPathUsage, GrainTag, LockCount, OrderRow, TimeRange,
};

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;
const FIRST_PID: i32 = 1000;

#[derive(Debug, Clone)]
struct LocalConstraint {
    name: String,
    range: TimeRange,
    validated: bool,
}

impl LocalConstraint {
    /// Rendered the way `pg_get_constraintdef` prints a range CHECK.
    fn definition(&self) -> String {
        format!(
            "CHECK ((({key} >= '{lo}'::timestamp without time zone) AND ({key} < '{hi}'::timestamp without time zone)))",
            key = ORDERING_KEY,
            lo = format_timestamp(&self.range.lo),
            hi = format_timestamp(&self.range.hi)
        )
    }
}

#[derive(Debug, Clone)]
struct Attachment {
    parent: String,
    range: TimeRange,
}

#[derive(Debug, Clone)]
struct LocalRelation {
    partitioned: bool,
    attachment: Option<Attachment>,
    constraints: Vec<LocalConstraint>,
    rows: Vec<OrderRow>,
}

impl LocalRelation {
    fn table() -> Self {
        Self {
            partitioned: false,
            attachment: None,
            constraints: Vec::new(),
            rows: Vec::new(),
        }
    }

    fn violated_constraint(&self, row: &OrderRow) -> Option<&LocalConstraint> {
        self.constraints
            .iter()
            .find(|c| !c.range.contains(&row.order_time))
    }
}

#[derive(Debug, Clone)]
struct HeldLock {
    locktype: String,
    mode: String,
    fastpath: bool,
}

#[derive(Debug, Clone)]
struct LocalSession {
    query: String,
    query_start: DateTime<Utc>,
    xact_start: DateTime<Utc>,
    locks: Vec<HeldLock>,
    waiting: Option<(HeldLock, Vec<i32>)>,
    protected: bool,
}

#[derive(Debug, Clone, Default)]
struct LocalState {
    relations: BTreeMap<String, LocalRelation>,
    /// Index name (`schema.index`) to owning relation key.
    indexes: BTreeMap<String, String>,
    /// Relations held exclusively by some other session.
    locked: HashSet<String>,
    sessions: BTreeMap<i32, LocalSession>,
    next_pid: i32,
    terminated: Vec<i32>,
    catalog_unavailable: bool,
}

/// In-memory repository.
#[derive(Clone)]
pub struct LocalRepository {
    state: Arc<RwLock<LocalState>>,
    lock_timeout_ms: u64,
}

impl Default for LocalRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRepository {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT_MS)
    }

    pub fn with_lock_timeout(lock_timeout_ms: u64) -> Self {
        Self {
            state: Arc::new(RwLock::new(LocalState {
                next_pid: FIRST_PID,
                ..Default::default()
            })),
            lock_timeout_ms,
        }
    }

    /// Make every DDL statement touching `relation` fail with a lock timeout,
    /// as if another session held it in an exclusive mode.
    pub fn lock_relation(&self, relation: &QualifiedName) {
        self.state.write().locked.insert(relation.key());
    }

    pub fn unlock_relation(&self, relation: &QualifiedName) {
        self.state.write().locked.remove(&relation.key());
    }

    /// Whether a relation exists, attached or not.
    pub fn relation_exists(&self, relation: &QualifiedName) -> bool {
        self.state.read().relations.contains_key(&relation.key())
    }

    /// Index names recorded for a relation, sorted.
    pub fn index_names(&self, relation: &QualifiedName) -> Vec<String> {
        let key = relation.key();
        let schema_prefix = format!("{}.", relation.schema.as_str());
        self.state
            .read()
            .indexes
            .iter()
            .filter(|(_, owner)| **owner == key)
            .map(|(name, _)| name.trim_start_matches(&schema_prefix).to_string())
            .collect()
    }

    /// CHECK constraints of a relation as the catalog would report them.
    pub fn constraints_of(&self, relation: &QualifiedName) -> Vec<CheckConstraint> {
        self.state
            .read()
            .relations
            .get(&relation.key())
            .map(|r| r.constraints.iter().map(to_check_constraint).collect())
            .unwrap_or_default()
    }

    /// Drop a CHECK constraint outside any command, as another session's
    /// `ALTER TABLE ... DROP CONSTRAINT` would. Returns whether it existed.
    pub fn drop_check_constraint(&self, relation: &QualifiedName, name: &str) -> bool {
        let mut state = self.state.write();
        match state.relations.get_mut(&relation.key()) {
            Some(rel) => {
                let before = rel.constraints.len();
                rel.constraints.retain(|c| c.name != name);
                rel.constraints.len() != before
            }
            None => false,
        }
    }

    /// Start a session whose current query has been running for `query_age`.
    pub fn open_session(&self, query: impl Into<String>, query_age: Duration) -> i32 {
        let mut state = self.state.write();
        let pid = state.next_pid;
        state.next_pid += 1;
        let started = Utc::now()
            - chrono::Duration::from_std(query_age).unwrap_or_else(|_| chrono::Duration::zero());
        state.sessions.insert(
            pid,
            LocalSession {
                query: query.into(),
                query_start: started,
                xact_start: started,
                locks: Vec::new(),
                waiting: None,
                protected: false,
            },
        );
        pid
    }

    /// Record a granted lock for a session.
    pub fn grant_lock(&self, pid: i32, locktype: &str, mode: &str, fastpath: bool) {
        if let Some(session) = self.state.write().sessions.get_mut(&pid) {
            session.locks.push(HeldLock {
                locktype: locktype.to_string(),
                mode: mode.to_string(),
                fastpath,
            });
        }
    }

    /// Make `pid` wait for a `mode` lock currently held by `blockers`.
    pub fn wait_for(&self, pid: i32, locktype: &str, mode: &str, blockers: &[i32]) {
        if let Some(session) = self.state.write().sessions.get_mut(&pid) {
            session.waiting = Some((
                HeldLock {
                    locktype: locktype.to_string(),
                    mode: mode.to_string(),
                    fastpath: false,
                },
                blockers.to_vec(),
            ));
        }
    }

    /// Sessions the store refuses to terminate (termination returns false).
    pub fn protect_session(&self, pid: i32) {
        if let Some(session) = self.state.write().sessions.get_mut(&pid) {
            session.protected = true;
        }
    }

    /// Make lock/session catalog reads fail with a connection error.
    pub fn set_catalog_unavailable(&self, unavailable: bool) {
        self.state.write().catalog_unavailable = unavailable;
    }

    /// Session ids terminated so far, in order.
    pub fn terminated_sessions(&self) -> Vec<i32> {
        self.state.read().terminated.clone()
    }

    pub fn session_exists(&self, pid: i32) -> bool {
        self.state.read().sessions.contains_key(&pid)
    }

    fn check_catalog(&self, operation: &str) -> RepositoryResult<()> {
        if self.state.read().catalog_unavailable {
            return Err(RepositoryError::connection_with_context(
                "server closed the connection unexpectedly",
                ErrorContext::new(operation),
            ));
        }
        Ok(())
    }
}

fn to_check_constraint(c: &LocalConstraint) -> CheckConstraint {
    CheckConstraint {
        name: c.name.clone(),
        definition: c.definition(),
        validated: c.validated,
    }
}

fn query_error(operation: &str, table: &QualifiedName, message: String) -> RepositoryError {
    RepositoryError::query_with_context(
        message,
        ErrorContext::new(operation)
            .with_entity("relation")
            .with_entity_id(table.key()),
    )
}

fn missing_relation(operation: &str, table: &QualifiedName) -> RepositoryError {
    RepositoryError::not_found_with_context(
        format!("relation \"{}\" does not exist", table.key()),
        ErrorContext::new(operation)
            .with_entity("relation")
            .with_entity_id(table.key()),
    )
}

/// [`PartitionOps`] over a draft of the local state.
struct LocalOps<'a> {
    state: &'a mut LocalState,
    lock_timeout_ms: u64,
}

impl LocalOps<'_> {
    fn acquire(&self, operation: &str, tables: &[&QualifiedName]) -> RepositoryResult<()> {
        for table in tables {
            if self.state.locked.contains(&table.key()) {
                return Err(RepositoryError::LockTimeout {
                    message: "canceling statement due to lock timeout".to_string(),
                    context: ErrorContext::new(operation)
                        .with_entity("relation")
                        .with_entity_id(table.key())
                        .with_details(format!("lock_timeout={}ms", self.lock_timeout_ms)),
                });
            }
        }
        Ok(())
    }

    fn relation(&self, operation: &str, table: &QualifiedName) -> RepositoryResult<&LocalRelation> {
        self.state
            .relations
            .get(&table.key())
            .ok_or_else(|| missing_relation(operation, table))
    }

    fn relation_mut(
        &mut self,
        operation: &str,
        table: &QualifiedName,
    ) -> RepositoryResult<&mut LocalRelation> {
        self.state
            .relations
            .get_mut(&table.key())
            .ok_or_else(|| missing_relation(operation, table))
    }

    fn ensure_absent(&self, operation: &str, table: &QualifiedName) -> RepositoryResult<()> {
        if self.state.relations.contains_key(&table.key()) {
            return Err(query_error(
                operation,
                table,
                format!("relation \"{}\" already exists", table.name.as_str()),
            ));
        }
        Ok(())
    }

    fn require_parent(&self, operation: &str, parent: &QualifiedName) -> RepositoryResult<()> {
        if !self.relation(operation, parent)?.partitioned {
            return Err(query_error(
                operation,
                parent,
                format!("table \"{}\" is not partitioned", parent.name.as_str()),
            ));
        }
        Ok(())
    }

    /// Fails when `range` overlaps a partition already attached to `parent`.
    ///
    /// With `allow_rolled_up_days`, a week child may cover day children that
    /// lie entirely inside its range; that is the rollup's double-count state,
    /// which lasts until the days are retired.
    fn check_overlap(
        &self,
        operation: &str,
        parent: &QualifiedName,
        child: &QualifiedName,
        range: &TimeRange,
        allow_rolled_up_days: bool,
    ) -> RepositoryResult<()> {
        let parent_key = parent.key();
        let prefix = format!("{}.", parent.schema.as_str());
        let clash = self.state.relations.iter().find(|(key, rel)| {
            rel.attachment.as_ref().is_some_and(|a| {
                let name = key.trim_start_matches(&prefix);
                let rolled_up = allow_rolled_up_days
                    && GrainTag::from_table_name(name) == GrainTag::Day
                    && range.lo <= a.range.lo
                    && a.range.hi <= range.hi;
                a.parent == parent_key && a.range.overlaps(range) && !rolled_up
            })
        });
        if let Some((name, _)) = clash {
            return Err(query_error(
                operation,
                child,
                format!(
                    "partition \"{}\" would overlap partition \"{}\"",
                    child.name.as_str(),
                    name
                ),
            ));
        }
        Ok(())
    }

    fn drop_relation(&mut self, key: &str) {
        self.state.relations.remove(key);
        self.state.indexes.retain(|_, owner| owner != key);
    }
}

impl PartitionOps for LocalOps<'_> {
    fn relation_exists(&mut self, table: &QualifiedName) -> RepositoryResult<bool> {
        Ok(self.state.relations.contains_key(&table.key()))
    }

    fn recreate_parent(&mut self, parent: &QualifiedName) -> RepositoryResult<()> {
        self.acquire("recreate_parent", &[parent])?;

        let parent_key = parent.key();
        let doomed: Vec<String> = self
            .state
            .relations
            .iter()
            .filter(|(key, rel)| {
                **key == parent_key
                    || rel.attachment.as_ref().is_some_and(|a| a.parent == parent_key)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            self.drop_relation(&key);
        }

        self.state.relations.insert(
            parent_key,
            LocalRelation {
                partitioned: true,
                ..LocalRelation::table()
            },
        );
        Ok(())
    }

    fn create_child(
        &mut self,
        parent: &QualifiedName,
        child: &QualifiedName,
        range: &TimeRange,
    ) -> RepositoryResult<()> {
        let op = "create_child_partition";
        self.acquire(op, &[parent, child])?;
        self.require_parent(op, parent)?;
        self.ensure_absent(op, child)?;
        self.check_overlap(op, parent, child, range, false)?;
        self.state.relations.insert(
            child.key(),
            LocalRelation {
                attachment: Some(Attachment {
                    parent: parent.key(),
                    range: *range,
                }),
                ..LocalRelation::table()
            },
        );
        Ok(())
    }

    fn create_index(&mut self, spec: &IndexSpec) -> RepositoryResult<()> {
        self.acquire("create_index", &[&spec.table])?;
        self.relation("create_index", &spec.table)?;
        let index_key = format!("{}.{}", spec.table.schema.as_str(), spec.name.as_str());
        self.state
            .indexes
            .entry(index_key)
            .or_insert_with(|| spec.table.key());
        Ok(())
    }

    fn clone_structure(
        &mut self,
        source: &QualifiedName,
        target: &QualifiedName,
    ) -> RepositoryResult<()> {
        let op = "clone_structure";
        self.acquire(op, &[source])?;
        let constraints = self.relation(op, source)?.constraints.clone();
        self.ensure_absent(op, target)?;

        let source_key = source.key();
        let schema = target.schema.as_str();
        let copied = self
            .state
            .indexes
            .values()
            .filter(|owner| **owner == source_key)
            .count();
        for i in 0..copied {
            let name = format!("{}.{}_idx{}", schema, target.name.as_str(), i);
            self.state.indexes.insert(name, target.key());
        }

        self.state.relations.insert(
            target.key(),
            LocalRelation {
                constraints,
                ..LocalRelation::table()
            },
        );
        Ok(())
    }

    fn check_constraints(
        &mut self,
        table: &QualifiedName,
    ) -> RepositoryResult<Vec<CheckConstraint>> {
        let rel = self.relation("check_constraints", table)?;
        let mut found: Vec<CheckConstraint> =
            rel.constraints.iter().map(to_check_constraint).collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    fn add_range_constraint(
        &mut self,
        table: &QualifiedName,
        name: &Ident,
        range: &TimeRange,
        state: ConstraintState,
    ) -> RepositoryResult<()> {
        let op = "add_range_constraint";
        self.acquire(op, &[table])?;
        let rel = self.relation_mut(op, table)?;
        if rel.constraints.iter().any(|c| c.name == name.as_str()) {
            return Err(query_error(
                op,
                table,
                format!(
                    "constraint \"{}\" for relation \"{}\" already exists",
                    name.as_str(),
                    table.name.as_str()
                ),
            ));
        }
        let validated = state == ConstraintState::Valid;
        if validated && rel.rows.iter().any(|r| !range.contains(&r.order_time)) {
            return Err(RepositoryError::validation_with_context(
                format!(
                    "check constraint \"{}\" of relation \"{}\" is violated by some row",
                    name.as_str(),
                    table.name.as_str()
                ),
                ErrorContext::new(op).with_entity_id(table.key()),
            ));
        }
        rel.constraints.push(LocalConstraint {
            name: name.as_str().to_string(),
            range: *range,
            validated,
        });
        Ok(())
    }

    fn drop_constraint(&mut self, table: &QualifiedName, name: &Ident) -> RepositoryResult<()> {
        let op = "drop_constraint";
        self.acquire(op, &[table])?;
        let rel = self.relation_mut(op, table)?;
        let before = rel.constraints.len();
        rel.constraints.retain(|c| c.name != name.as_str());
        if rel.constraints.len() == before {
            return Err(query_error(
                op,
                table,
                format!(
                    "constraint \"{}\" of relation \"{}\" does not exist",
                    name.as_str(),
                    table.name.as_str()
                ),
            ));
        }
        Ok(())
    }

    fn validate_constraint(
        &mut self,
        table: &QualifiedName,
        name: &Ident,
    ) -> RepositoryResult<()> {
        let op = "validate_constraint";
        self.acquire(op, &[table])?;
        let rel = self.relation_mut(op, table)?;
        let rows = &rel.rows;
        let constraint = rel
            .constraints
            .iter_mut()
            .find(|c| c.name == name.as_str())
            .ok_or_else(|| {
                query_error(
                    op,
                    table,
                    format!(
                        "constraint \"{}\" of relation \"{}\" does not exist",
                        name.as_str(),
                        table.name.as_str()
                    ),
                )
            })?;
        if rows.iter().any(|r| !constraint.range.contains(&r.order_time)) {
            return Err(RepositoryError::validation_with_context(
                format!(
                    "check constraint \"{}\" of relation \"{}\" is violated by some row",
                    name.as_str(),
                    table.name.as_str()
                ),
                ErrorContext::new(op).with_entity_id(table.key()),
            ));
        }
        constraint.validated = true;
        Ok(())
    }

    fn copy_rows(&mut self, from: &QualifiedName, to: &QualifiedName) -> RepositoryResult<u64> {
        let op = "copy_rows";
        self.acquire(op, &[from, to])?;
        let rows = self.relation(op, from)?.rows.clone();
        let target = self.relation_mut(op, to)?;
        if let Some((row, c)) = rows
            .iter()
            .find_map(|r| target.violated_constraint(r).map(|c| (r, c)))
        {
            return Err(RepositoryError::validation_with_context(
                format!(
                    "new row for relation \"{}\" violates check constraint \"{}\" (order_time {})",
                    to.name.as_str(),
                    c.name,
                    format_timestamp(&row.order_time)
                ),
                ErrorContext::new(op).with_entity_id(to.key()),
            ));
        }
        let copied = rows.len() as u64;
        target.rows.extend(rows);
        Ok(copied)
    }

    fn attach(
        &mut self,
        parent: &QualifiedName,
        child: &QualifiedName,
        range: &TimeRange,
    ) -> RepositoryResult<()> {
        let op = "attach_partition";
        self.acquire(op, &[parent, child])?;
        self.require_parent(op, parent)?;
        let rel = self.relation(op, child)?;
        if rel.partitioned {
            return Err(query_error(
                op,
                child,
                format!("\"{}\" is a partitioned table", child.name.as_str()),
            ));
        }
        if rel.attachment.is_some() {
            return Err(query_error(
                op,
                child,
                format!("\"{}\" is already a partition", child.name.as_str()),
            ));
        }
        if rel.rows.iter().any(|r| !range.contains(&r.order_time)) {
            return Err(RepositoryError::validation_with_context(
                format!(
                    "partition constraint of relation \"{}\" is violated by some row",
                    child.name.as_str()
                ),
                ErrorContext::new(op).with_entity_id(child.key()),
            ));
        }
        let is_week = GrainTag::from_table_name(child.name.as_str()) == GrainTag::WeekRollup;
        self.check_overlap(op, parent, child, range, is_week)?;
        self.relation_mut(op, child)?.attachment = Some(Attachment {
            parent: parent.key(),
            range: *range,
        });
        Ok(())
    }

    fn detach(&mut self, parent: &QualifiedName, child: &QualifiedName) -> RepositoryResult<()> {
        let op = "detach_partition";
        self.acquire(op, &[parent, child])?;
        let parent_key = parent.key();
        let rel = self.relation_mut(op, child)?;
        let attached_here = rel
            .attachment
            .as_ref()
            .is_some_and(|a| a.parent == parent_key);
        if !attached_here {
            return Err(query_error(
                op,
                child,
                format!(
                    "relation \"{}\" is not a partition of relation \"{}\"",
                    child.name.as_str(),
                    parent.name.as_str()
                ),
            ));
        }
        rel.attachment = None;
        Ok(())
    }
}

fn lock_row(held: &HeldLock) -> (String, String) {
    (held.locktype.clone(), held.mode.clone())
}

#[async_trait]
impl PartitionRepository for LocalRepository {
    async fn health_check(&self) -> RepositoryResult<bool> {
        Ok(true)
    }

    async fn execute(&self, command: DdlCommand) -> RepositoryResult<DdlOutcome> {
        let mut state = self.state.write();
        let mut draft = state.clone();
        let outcome = command.apply(&mut LocalOps {
            state: &mut draft,
            lock_timeout_ms: self.lock_timeout_ms,
        });
        match &outcome {
            Ok(_) => *state = draft,
            Err(e) => log::debug!("{} rolled back: {}", command.operation(), e),
        }
        outcome
    }

    async fn relation_exists(&self, relation: &QualifiedName) -> RepositoryResult<bool> {
        Ok(LocalRepository::relation_exists(self, relation))
    }

    async fn list_partitions(
        &self,
        naming: &PartitionNaming,
    ) -> RepositoryResult<Vec<ChildPartition>> {
        let parent_key = naming.parent().key();
        let prefix = format!("{}.", naming.schema().as_str());
        let state = self.state.read();
        Ok(state
            .relations
            .iter()
            .filter_map(|(key, rel)| {
                let a = rel.attachment.as_ref().filter(|a| a.parent == parent_key)?;
                let name = key.trim_start_matches(&prefix).to_string();
                Some(ChildPartition {
                    grain: GrainTag::from_table_name(&name),
                    range: Some(a.range),
                    name,
                    attached: true,
                })
            })
            .collect())
    }

    async fn count_rows(
        &self,
        relation: &QualifiedName,
        range: Option<TimeRange>,
    ) -> RepositoryResult<i64> {
        let state = self.state.read();
        let key = relation.key();
        let rel = state
            .relations
            .get(&key)
            .ok_or_else(|| missing_relation("count_rows", relation))?;
        let in_range = |r: &OrderRow| range.as_ref().map_or(true, |w| w.contains(&r.order_time));

        let count = if rel.partitioned {
            state
                .relations
                .values()
                .filter(|c| c.attachment.as_ref().is_some_and(|a| a.parent == key))
                .flat_map(|c| c.rows.iter())
                .filter(|r| in_range(*r))
                .count()
        } else {
            rel.rows.iter().filter(|r| in_range(*r)).count()
        };
        Ok(count as i64)
    }

    async fn insert_orders(
        &self,
        parent: &QualifiedName,
        rows: &[OrderRow],
    ) -> RepositoryResult<usize> {
        let op = "insert_orders";
        let mut state = self.state.write();
        let parent_key = parent.key();
        if !state
            .relations
            .get(&parent_key)
            .ok_or_else(|| missing_relation(op, parent))?
            .partitioned
        {
            return Err(query_error(
                op,
                parent,
                format!("table \"{}\" is not partitioned", parent.name.as_str()),
            ));
        }

        let mut draft = state.clone();
        for row in rows {
            let (name, child) = draft
                .relations
                .iter_mut()
                .find(|(_, rel)| {
                    rel.attachment
                        .as_ref()
                        .is_some_and(|a| a.parent == parent_key && a.range.contains(&row.order_time))
                })
                .ok_or_else(|| {
                    query_error(
                        op,
                        parent,
                        format!(
                            "no partition of relation \"{}\" found for row (order_time {})",
                            parent.name.as_str(),
                            format_timestamp(&row.order_time)
                        ),
                    )
                })?;
            if let Some(c) = child.violated_constraint(row) {
                return Err(RepositoryError::validation_with_context(
                    format!(
                        "new row for relation \"{}\" violates check constraint \"{}\"",
                        name, c.name
                    ),
                    ErrorContext::new(op).with_entity_id(name),
                ));
            }
            if child
                .rows
                .iter()
                .any(|r| r.order_id == row.order_id && r.order_time == row.order_time)
            {
                return Err(RepositoryError::query_with_context(
                    format!(
                        "duplicate key value violates unique constraint (order_id {})",
                        row.order_id
                    ),
                    ErrorContext::new(op).with_entity_id(name),
                ));
            }
            child.rows.push(row.clone());
        }
        *state = draft;
        Ok(rows.len())
    }
}

#[async_trait]
impl LockRepository for LocalRepository {
    async fn lock_counts(&self) -> RepositoryResult<Vec<LockCount>> {
        self.check_catalog("lock_counts")?;
        let state = self.state.read();
        let mut counts: BTreeMap<(String, String), i64> = BTreeMap::new();
        for session in state.sessions.values() {
            let waiting = session.waiting.iter().map(|(lock, _)| lock);
            for held in session.locks.iter().chain(waiting) {
                *counts.entry(lock_row(held)).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|((locktype, mode), count)| LockCount {
                locktype,
                mode,
                count,
            })
            .collect())
    }

    async fn fastpath_usage(&self, limit: usize) -> RepositoryResult<Vec<FastPathUsage>> {
        self.check_catalog("fastpath_usage")?;
        let state = self.state.read();
        let mut usage: BTreeMap<(i32, String, bool), i64> = BTreeMap::new();
        for (pid, session) in &state.sessions {
            for held in &session.locks {
                *usage
                    .entry((*pid, held.mode.clone(), held.fastpath))
                    .or_default() += 1;
            }
        }
        Ok(usage
            .into_iter()
            .take(limit)
            .map(|((pid, mode, fastpath), count)| FastPathUsage {
                pid,
                mode,
                fastpath,
                count,
            })
            .collect())
    }

    async fn blocked_sessions(&self, excerpt_len: usize) -> RepositoryResult<Vec<BlockedSession>> {
        self.check_catalog("blocked_sessions")?;
        let state = self.state.read();
        let now = Utc::now();
        let age = |t: DateTime<Utc>| (now - t).num_milliseconds() as f64 / 1000.0;
        let mut waiters: Vec<BlockedSession> = state
            .sessions
            .iter()
            .filter_map(|(pid, s)| {
                let (lock, blockers) = s.waiting.as_ref().filter(|(_, b)| !b.is_empty())?;
                Some(BlockedSession {
                    pid: *pid,
                    blocking_pids: blockers.clone(),
                    wait_event: Some(lock.locktype.clone()),
                    query_excerpt: Some(s.query.chars().take(excerpt_len).collect()),
                    query_age_secs: Some(age(s.query_start)),
                    transaction_age_secs: Some(age(s.xact_start)),
                })
            })
            .collect();
        waiters.sort_by(|a, b| {
            b.query_age_secs
                .partial_cmp(&a.query_age_secs)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(waiters)
    }

    async fn terminate_session(&self, pid: i32) -> RepositoryResult<bool> {
        let mut state = self.state.write();
        match state.sessions.get(&pid) {
            None => return Ok(false),
            Some(s) if s.protected => return Ok(false),
            Some(_) => {}
        }
        state.sessions.remove(&pid);
        for session in state.sessions.values_mut() {
            let released = match session.waiting.as_mut() {
                Some((_, blockers)) => {
                    blockers.retain(|b| *b != pid);
                    blockers.is_empty()
                }
                None => false,
            };
            if released {
                if let Some((lock, _)) = session.waiting.take() {
                    session.locks.push(lock);
                }
            }
        }
        state.terminated.push(pid);
        log::info!("terminated session {}", pid);
        Ok(true)
    }
}
