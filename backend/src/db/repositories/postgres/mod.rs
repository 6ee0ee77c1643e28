//! Postgres repository implementation using Diesel.
//!
//! DDL goes through [`ddl`] and runs with `batch_execute`, since utility
//! statements take no bind parameters; catalog reads and row access use
//! `sql_query` with bound values.
//!
//! ## Features
//!
//! - Connection pooling with r2d2
//! - Retry of connection checkout (never of statements)
//! - `SET LOCAL lock_timeout` at the start of every DDL transaction
//! - Connection health monitoring
//!
//! ## Configuration
//!
//! Environment variables:
//! - `DATABASE_URL` or `PG_DATABASE_URL`: Connection string (required)
//! - `PG_POOL_MAX`: Maximum pool size (default: 10)
//! - `PG_POOL_MIN`: Minimum pool size (default: 1)
//! - `PG_CONN_TIMEOUT_SEC`: Connection timeout in seconds (default: 30)
//! - `PG_IDLE_TIMEOUT_SEC`: Idle connection timeout in seconds (default: 600)
//! - `PG_MAX_RETRIES`: Maximum checkout retry attempts (default: 3)
//! - `PG_RETRY_DELAY_MS`: Initial retry delay in milliseconds (default: 100)
//! - `LOCK_TIMEOUT_MS`: Lock wait bound for DDL in milliseconds (default: 5000)

use async_trait::async_trait;
use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_query;
use diesel::sql_types::{BigInt, Double, Integer, Text, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task;

use crate::db::repository::{
    DdlCommand, DdlOutcome, ErrorContext, LockRepository, PartitionOps, PartitionRepository,
    RepositoryError, RepositoryResult,
};
use crate::db::sql::{ddl, Ident, IndexSpec, PartitionNaming, QualifiedName, ORDERING_KEY};
use crate::models::{
    BlockedSession, CheckConstraint, ChildPartition, ConstraintState, FastPathUsage, GrainTag,
    LockCount, OrderRow, TimeRange,
};

mod models;

use models::*;

type PgPool = Pool<ConnectionManager<PgConnection>>;

/// Rows per multi-row INSERT.
const INSERT_CHUNK: usize = 500;

/// Configuration for connecting to Postgres.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Database connection URL
    pub database_url: String,
    /// Maximum number of connections in the pool
    pub max_pool_size: u32,
    /// Minimum number of connections in the pool
    pub min_pool_size: u32,
    /// Connection timeout in seconds
    pub connection_timeout_sec: u64,
    /// Idle connection timeout in seconds
    pub idle_timeout_sec: u64,
    /// Maximum number of checkout retry attempts
    pub max_retries: u32,
    /// Initial retry delay in milliseconds (doubles with each retry)
    pub retry_delay_ms: u64,
    /// Upper bound on lock waits inside DDL transactions
    pub lock_timeout_ms: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_pool_size: 10,
            min_pool_size: 1,
            connection_timeout_sec: 30,
            idle_timeout_sec: 600,
            max_retries: 3,
            retry_delay_ms: 100,
            lock_timeout_ms: 5000,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl PostgresConfig {
    /// Create configuration from environment variables.
    ///
    /// See the module documentation for the variables and defaults.
    pub fn from_env() -> Result<Self, String> {
        let database_url = std::env::var("DATABASE_URL")
            .or_else(|_| std::env::var("PG_DATABASE_URL"))
            .map_err(|_| "DATABASE_URL or PG_DATABASE_URL must be set".to_string())?;
        let defaults = Self::default();

        Ok(Self {
            database_url,
            max_pool_size: env_or("PG_POOL_MAX", defaults.max_pool_size),
            min_pool_size: env_or("PG_POOL_MIN", defaults.min_pool_size),
            connection_timeout_sec: env_or("PG_CONN_TIMEOUT_SEC", defaults.connection_timeout_sec),
            idle_timeout_sec: env_or("PG_IDLE_TIMEOUT_SEC", defaults.idle_timeout_sec),
            max_retries: env_or("PG_MAX_RETRIES", defaults.max_retries),
            retry_delay_ms: env_or("PG_RETRY_DELAY_MS", defaults.retry_delay_ms),
            lock_timeout_ms: env_or("LOCK_TIMEOUT_MS", defaults.lock_timeout_ms),
        })
    }

    /// Create a new configuration with a database URL.
    pub fn with_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }
}

/// Pool health statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Number of connections currently in use
    pub connections_in_use: u32,
    /// Number of idle connections
    pub idle_connections: u32,
    /// Total number of connections in the pool
    pub total_connections: u32,
    /// Maximum pool size
    pub max_size: u32,
    /// Total operations that obtained a connection
    pub total_queries: u64,
    /// Total failed operations
    pub failed_queries: u64,
    /// Total checkout retries
    pub retried_operations: u64,
}

/// Diesel-backed repository for Postgres.
#[derive(Clone, Debug)]
pub struct PostgresRepository {
    pool: PgPool,
    config: PostgresConfig,
    total_queries: std::sync::Arc<AtomicU64>,
    failed_queries: std::sync::Arc<AtomicU64>,
    retried_operations: std::sync::Arc<AtomicU64>,
}

impl PostgresRepository {
    /// Create a new repository with a connection pool.
    ///
    /// # Arguments
    /// * `config` - Database configuration
    ///
    /// # Returns
    /// * `Ok(PostgresRepository)` on success
    /// * `Err(RepositoryError)` if the pool cannot be built
    pub fn new(config: PostgresConfig) -> RepositoryResult<Self> {
        let manager = ConnectionManager::<PgConnection>::new(&config.database_url);

        let pool = Pool::builder()
            .max_size(config.max_pool_size)
            .min_idle(Some(config.min_pool_size))
            .connection_timeout(Duration::from_secs(config.connection_timeout_sec))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_sec)))
            .test_on_check_out(true)
            .build(manager)
            .map_err(|e| {
                RepositoryError::connection_with_context(
                    e.to_string(),
                    ErrorContext::new("create_pool")
                        .with_details(format!("max_size={}", config.max_pool_size)),
                )
            })?;

        Ok(Self {
            pool,
            config,
            total_queries: std::sync::Arc::new(AtomicU64::new(0)),
            failed_queries: std::sync::Arc::new(AtomicU64::new(0)),
            retried_operations: std::sync::Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }

    /// Run `f` on a pooled connection on the blocking thread pool.
    ///
    /// Only connection checkout is retried. Statements are never re-run: a
    /// DDL transaction that failed half way has been rolled back and must be
    /// resubmitted by the caller if at all.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> RepositoryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> RepositoryResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let max_retries = self.config.max_retries;
        let retry_delay_ms = self.config.retry_delay_ms;
        let total_queries = self.total_queries.clone();
        let failed_queries = self.failed_queries.clone();
        let retried_operations = self.retried_operations.clone();

        task::spawn_blocking(move || {
            let mut retry_delay = Duration::from_millis(retry_delay_ms);
            let mut attempt = 0;

            let mut conn = loop {
                match pool.get() {
                    Ok(c) => break c,
                    Err(e) => {
                        let err = RepositoryError::connection_with_context(
                            e.to_string(),
                            ErrorContext::new(operation)
                                .with_details(format!("checkout attempt={}", attempt + 1))
                                .retryable(),
                        );
                        if attempt >= max_retries {
                            failed_queries.fetch_add(1, Ordering::Relaxed);
                            return Err(err);
                        }
                        log::debug!("{}; retrying in {:?}", err, retry_delay);
                        retried_operations.fetch_add(1, Ordering::Relaxed);
                        std::thread::sleep(retry_delay);
                        retry_delay *= 2;
                        attempt += 1;
                    }
                }
            };

            total_queries.fetch_add(1, Ordering::Relaxed);
            let result = f(&mut conn);
            if result.is_err() {
                failed_queries.fetch_add(1, Ordering::Relaxed);
            }
            result
        })
        .await
        .map_err(|e| {
            RepositoryError::internal_with_context(
                format!("Task join error: {}", e),
                ErrorContext::new("spawn_blocking"),
            )
        })?
    }

    /// Get pool health statistics.
    pub fn get_pool_stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            connections_in_use: state.connections - state.idle_connections,
            idle_connections: state.idle_connections,
            total_connections: state.connections,
            max_size: self.config.max_pool_size,
            total_queries: self.total_queries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            retried_operations: self.retried_operations.load(Ordering::Relaxed),
        }
    }
}

fn map_diesel_error(err: diesel::result::Error) -> RepositoryError {
    RepositoryError::from(err)
}

fn relation_present(conn: &mut PgConnection, table: &QualifiedName) -> RepositoryResult<bool> {
    let row: ExistsRow = sql_query(
        "SELECT EXISTS (\
           SELECT 1 FROM pg_class c \
           JOIN pg_namespace n ON n.oid = c.relnamespace \
           WHERE n.nspname = $1 AND c.relname = $2\
         ) AS present",
    )
    .bind::<Text, _>(table.schema.as_str())
    .bind::<Text, _>(table.name.as_str())
    .get_result(conn)
    .map_err(|e| map_diesel_error(e).with_operation("relation_exists"))?;
    Ok(row.present)
}

/// [`PartitionOps`] over a connection that is inside a transaction.
struct PgOps<'a> {
    conn: &'a mut PgConnection,
}

impl PgOps<'_> {
    fn run(&mut self, operation: &str, table: &QualifiedName, sql: &str) -> RepositoryResult<()> {
        log::debug!("{}: {}", operation, sql);
        self.conn.batch_execute(sql).map_err(|e| {
            map_diesel_error(e)
                .with_operation(operation)
                .with_entity_id(table.key())
        })
    }
}

impl PartitionOps for PgOps<'_> {
    fn relation_exists(&mut self, table: &QualifiedName) -> RepositoryResult<bool> {
        relation_present(self.conn, table)
    }

    fn recreate_parent(&mut self, parent: &QualifiedName) -> RepositoryResult<()> {
        self.run(
            "create_schema",
            parent,
            &ddl::create_schema(&parent.schema),
        )?;
        self.run("drop_parent", parent, &ddl::drop_parent(parent))?;
        self.run("create_parent", parent, &ddl::create_parent(parent))
    }

    fn create_child(
        &mut self,
        parent: &QualifiedName,
        child: &QualifiedName,
        range: &TimeRange,
    ) -> RepositoryResult<()> {
        self.run(
            "create_child_partition",
            child,
            &ddl::create_child(parent, child, range),
        )
    }

    fn create_index(&mut self, spec: &IndexSpec) -> RepositoryResult<()> {
        self.run("create_index", &spec.table, &spec.create_sql())
    }

    fn clone_structure(
        &mut self,
        source: &QualifiedName,
        target: &QualifiedName,
    ) -> RepositoryResult<()> {
        self.run("clone_structure", target, &ddl::clone_like(source, target))
    }

    fn check_constraints(
        &mut self,
        table: &QualifiedName,
    ) -> RepositoryResult<Vec<CheckConstraint>> {
        let rows: Vec<CheckConstraintRow> = sql_query(
            "SELECT con.conname::text AS name, \
                    pg_get_constraintdef(con.oid) AS definition, \
                    con.convalidated AS validated \
             FROM pg_constraint con \
             JOIN pg_class c ON c.oid = con.conrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relname = $2 AND con.contype = 'c' \
             ORDER BY con.conname",
        )
        .bind::<Text, _>(table.schema.as_str())
        .bind::<Text, _>(table.name.as_str())
        .load(self.conn)
        .map_err(|e| {
            map_diesel_error(e)
                .with_operation("check_constraints")
                .with_entity_id(table.key())
        })?;
        Ok(rows.into_iter().map(CheckConstraint::from).collect())
    }

    fn add_range_constraint(
        &mut self,
        table: &QualifiedName,
        name: &Ident,
        range: &TimeRange,
        state: ConstraintState,
    ) -> RepositoryResult<()> {
        self.run(
            "add_range_constraint",
            table,
            &ddl::add_range_constraint(table, name, range, state),
        )
    }

    fn drop_constraint(&mut self, table: &QualifiedName, name: &Ident) -> RepositoryResult<()> {
        self.run("drop_constraint", table, &ddl::drop_constraint(table, name))
    }

    fn validate_constraint(
        &mut self,
        table: &QualifiedName,
        name: &Ident,
    ) -> RepositoryResult<()> {
        self.run(
            "validate_constraint",
            table,
            &ddl::validate_constraint(table, name),
        )
    }

    fn copy_rows(&mut self, from: &QualifiedName, to: &QualifiedName) -> RepositoryResult<u64> {
        let sql = ddl::copy_rows(from, to);
        log::debug!("copy_rows: {}", sql);
        let copied = sql_query(sql).execute(self.conn).map_err(|e| {
            map_diesel_error(e)
                .with_operation("copy_rows")
                .with_entity_id(from.key())
        })?;
        Ok(copied as u64)
    }

    fn attach(
        &mut self,
        parent: &QualifiedName,
        child: &QualifiedName,
        range: &TimeRange,
    ) -> RepositoryResult<()> {
        self.run(
            "attach_partition",
            child,
            &ddl::attach(parent, child, range),
        )
    }

    fn detach(&mut self, parent: &QualifiedName, child: &QualifiedName) -> RepositoryResult<()> {
        self.run("detach_partition", child, &ddl::detach(parent, child))
    }
}

#[async_trait]
impl PartitionRepository for PostgresRepository {
    async fn health_check(&self) -> RepositoryResult<bool> {
        self.with_conn("health_check", |conn| {
            sql_query("SELECT 1")
                .execute(conn)
                .map(|_| true)
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn execute(&self, command: DdlCommand) -> RepositoryResult<DdlOutcome> {
        let lock_timeout_ms = self.config.lock_timeout_ms;
        let operation = command.operation();
        let started = Instant::now();
        let outcome = self
            .with_conn(operation, move |conn| {
                conn.transaction::<_, RepositoryError, _>(|tx| {
                    tx.batch_execute(&ddl::set_lock_timeout(lock_timeout_ms))?;
                    let mut ops = PgOps { conn: tx };
                    command.apply(&mut ops)
                })
            })
            .await;
        match &outcome {
            Ok(_) => log::debug!("{} committed in {:?}", operation, started.elapsed()),
            Err(e) => log::debug!("{} rolled back: {}", operation, e),
        }
        outcome
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        Some(self.get_pool_stats())
    }

    async fn relation_exists(&self, relation: &QualifiedName) -> RepositoryResult<bool> {
        let relation = relation.clone();
        self.with_conn("relation_exists", move |conn| relation_present(conn, &relation))
            .await
    }

    async fn list_partitions(
        &self,
        naming: &PartitionNaming,
    ) -> RepositoryResult<Vec<ChildPartition>> {
        let parent = naming.parent();
        self.with_conn("list_partitions", move |conn| {
            let rows: Vec<PartitionRow> = sql_query(
                "SELECT c.relname::text AS name, \
                        pg_get_expr(c.relpartbound, c.oid) AS bound \
                 FROM pg_inherits i \
                 JOIN pg_class c ON c.oid = i.inhrelid \
                 JOIN pg_class p ON p.oid = i.inhparent \
                 JOIN pg_namespace n ON n.oid = p.relnamespace \
                 WHERE n.nspname = $1 AND p.relname = $2 \
                 ORDER BY c.relname",
            )
            .bind::<Text, _>(parent.schema.as_str())
            .bind::<Text, _>(parent.name.as_str())
            .load(conn)
            .map_err(map_diesel_error)?;

            Ok(rows
                .into_iter()
                .map(|row| ChildPartition {
                    grain: GrainTag::from_table_name(&row.name),
                    range: row.bound.as_deref().and_then(TimeRange::from_quoted_bounds),
                    name: row.name,
                    attached: true,
                })
                .collect())
        })
        .await
    }

    async fn count_rows(
        &self,
        relation: &QualifiedName,
        range: Option<TimeRange>,
    ) -> RepositoryResult<i64> {
        let relation = relation.clone();
        self.with_conn("count_rows", move |conn| {
            let row: CountRow = match range {
                Some(r) => sql_query(format!(
                    "SELECT count(*) AS n FROM {} WHERE {key} >= $1 AND {key} < $2",
                    relation,
                    key = ORDERING_KEY
                ))
                .bind::<Timestamp, _>(r.lo)
                .bind::<Timestamp, _>(r.hi)
                .get_result::<CountRow>(conn),
                None => sql_query(format!("SELECT count(*) AS n FROM {}", relation))
                    .get_result::<CountRow>(conn),
            }
            .map_err(|e| map_diesel_error(e).with_entity_id(relation.key()))?;
            Ok(row.n)
        })
        .await
    }

    async fn insert_orders(
        &self,
        parent: &QualifiedName,
        rows: &[OrderRow],
    ) -> RepositoryResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let parent = parent.clone();
        let rows = rows.to_vec();
        self.with_conn("insert_orders", move |conn| {
            conn.transaction::<_, RepositoryError, _>(|tx| {
                let mut inserted = 0;
                for chunk in rows.chunks(INSERT_CHUNK) {
                    let placeholders: Vec<String> = (0..chunk.len())
                        .map(|i| {
                            let b = i * 7;
                            format!(
                                "(${}::uuid, ${}, ${}, ${}, ${}::numeric, ${}, ${})",
                                b + 1,
                                b + 2,
                                b + 3,
                                b + 4,
                                b + 5,
                                b + 6,
                                b + 7
                            )
                        })
                        .collect();
                    let mut query = sql_query(format!(
                        "INSERT INTO {} (order_id, customer_id, store_id, status, amount, \
                         order_time, updated_at) VALUES {}",
                        parent,
                        placeholders.join(", ")
                    ))
                    .into_boxed::<diesel::pg::Pg>();
                    for row in chunk {
                        query = query
                            .bind::<Text, _>(row.order_id.to_string())
                            .bind::<Integer, _>(row.customer_id)
                            .bind::<Integer, _>(row.store_id)
                            .bind::<Text, _>(row.status.clone())
                            .bind::<Double, _>(row.amount)
                            .bind::<Timestamp, _>(row.order_time)
                            .bind::<Timestamp, _>(row.updated_at);
                    }
                    inserted += query.execute(tx)?;
                }
                Ok(inserted)
            })
        })
        .await
    }
}

#[async_trait]
impl LockRepository for PostgresRepository {
    async fn lock_counts(&self) -> RepositoryResult<Vec<LockCount>> {
        self.with_conn("lock_counts", |conn| {
            let rows: Vec<LockCountRow> = sql_query(
                "SELECT locktype::text AS locktype, mode::text AS mode, count(*)::bigint AS count \
                 FROM pg_locks \
                 GROUP BY locktype, mode \
                 ORDER BY locktype, mode",
            )
            .load(conn)
            .map_err(map_diesel_error)?;
            Ok(rows.into_iter().map(LockCount::from).collect())
        })
        .await
    }

    async fn fastpath_usage(&self, limit: usize) -> RepositoryResult<Vec<FastPathUsage>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn("fastpath_usage", move |conn| {
            let rows: Vec<FastPathRow> = sql_query(
                "SELECT pid, mode::text AS mode, fastpath, count(*)::bigint AS count \
                 FROM pg_locks \
                 WHERE pid IS NOT NULL \
                 GROUP BY pid, mode, fastpath \
                 ORDER BY pid, mode \
                 LIMIT $1",
            )
            .bind::<BigInt, _>(limit)
            .load(conn)
            .map_err(map_diesel_error)?;
            Ok(rows.into_iter().map(FastPathUsage::from).collect())
        })
        .await
    }

    async fn blocked_sessions(&self, excerpt_len: usize) -> RepositoryResult<Vec<BlockedSession>> {
        let excerpt_len = i32::try_from(excerpt_len).unwrap_or(i32::MAX);
        self.with_conn("blocked_sessions", move |conn| {
            let rows: Vec<BlockedSessionRow> = sql_query(
                "SELECT a.pid, \
                        pg_blocking_pids(a.pid) AS blocking_pids, \
                        a.wait_event::text AS wait_event, \
                        left(a.query, $1) AS query_excerpt, \
                        EXTRACT(EPOCH FROM now() - a.query_start)::float8 AS query_age_secs, \
                        EXTRACT(EPOCH FROM now() - a.xact_start)::float8 AS transaction_age_secs \
                 FROM pg_stat_activity a \
                 WHERE cardinality(pg_blocking_pids(a.pid)) > 0 \
                 ORDER BY query_age_secs DESC NULLS LAST",
            )
            .bind::<Integer, _>(excerpt_len)
            .load(conn)
            .map_err(map_diesel_error)?;
            Ok(rows.into_iter().map(BlockedSession::from).collect())
        })
        .await
    }

    async fn terminate_session(&self, pid: i32) -> RepositoryResult<bool> {
        self.with_conn("terminate_session", move |conn| {
            let row: TerminateRow = sql_query("SELECT pg_terminate_backend($1) AS terminated")
                .bind::<Integer, _>(pid)
                .get_result(conn)
                .map_err(|e| {
                    let cause = map_diesel_error(e);
                    RepositoryError::termination(pid, cause.to_string())
                })?;
            Ok(row.terminated)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = PostgresConfig::with_url("postgres://localhost/lab");
        assert_eq!(config.database_url, "postgres://localhost/lab");
        assert_eq!(config.max_pool_size, 10);
        assert_eq!(config.lock_timeout_ms, 5000);
    }
}
