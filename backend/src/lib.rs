//! # Partition Lab
//!
//! Lifecycle management for a range-partitioned `orders` table, plus a lock
//! contention monitor for the same database.
//!
//! ## Features
//!
//! - **Window planning**: split a date range into day or week windows
//! - **Schema management**: create the parent, its children and their indexes
//! - **Rollups**: consolidate seven day partitions into one week partition
//!   and attach it without a validation scan
//! - **Contention monitoring**: lock counts, fast-path usage, blocked
//!   sessions, and optional termination of blockers
//!
//! ## Architecture
//!
//! - [`planner`]: window planning
//! - [`models`]: domain types shared by every layer
//! - [`config`]: environment and `lab.toml` configuration
//! - [`db`]: statement builder, repository traits and backends
//! - [`services`]: schema manager, rollup coordinator, monitor and seeding
//!
//! The library logs through the `log` facade; the binary decides where the
//! records go.

// Allow large error types - RepositoryError contains rich context for debugging
#![allow(clippy::result_large_err)]

pub mod config;
pub mod db;
pub mod models;
pub mod planner;
pub mod services;

pub use config::LabConfig;
pub use db::{
    FullRepository, Ident, LocalRepository, PartitionNaming, RepositoryError, RepositoryFactory,
    RepositoryResult,
};
pub use planner::{plan_date_windows, plan_windows, Grain, Window};
