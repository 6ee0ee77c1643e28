//! Database module: statement builder, repository traits and backends.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  CLI (bin/partition_lab.rs)                             │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │
//! ┌───────────────────▼─────────────────────────────────────┐
//! │  Services: SchemaManager, RollupCoordinator,            │
//! │            ContentionMonitor, seed                      │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │  DdlCommand / catalog reads
//! ┌───────────────────▼─────────────────────────────────────┐
//! │  Repository traits (repository/)                        │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │
//!     ┌───────────────┴──────────────────┐
//!     │ Postgres (Diesel)   │ Local       │
//!     │                     │ (in-memory) │
//!     └──────────────────────────────────┘
//! ```
//!
//! - `sql`: identifiers, naming rules and DDL rendering
//! - `repository`: traits, commands and the error type
//! - `repositories::postgres`: Postgres implementation with Diesel ORM
//! - `repositories::local`: in-memory implementation for tests and offline runs
//! - `factory`: creation of repository instances from configuration

#[cfg(not(any(feature = "postgres-repo", feature = "local-repo")))]
compile_error!("Enable at least one repository backend feature.");

pub mod factory;
pub mod repositories;
pub mod repository;
pub mod sql;

// Postgres config is colocated with the repository implementation.
#[cfg(feature = "postgres-repo")]
pub use repositories::postgres::{PoolStats, PostgresConfig};
#[cfg(not(feature = "postgres-repo"))]
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    _private: (),
}
#[cfg(not(feature = "postgres-repo"))]
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    _private: (),
}

pub use factory::{RepositoryBuilder, RepositoryFactory, RepositoryType};
pub use repositories::LocalRepository;
#[cfg(feature = "postgres-repo")]
pub use repositories::PostgresRepository;
pub use repository::{
    DdlCommand, DdlOutcome, ErrorContext, FullRepository, LockRepository, PartitionOps,
    PartitionRepository, RepositoryError, RepositoryResult,
};
pub use sql::{Ident, PartitionNaming, QualifiedName};
