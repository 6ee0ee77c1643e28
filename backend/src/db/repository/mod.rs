//! Repository layer: traits implemented by every store backend.
//!
//! - [`PartitionRepository`]: DDL commands, partition catalog, row access.
//! - [`LockRepository`]: lock and session catalogs, session termination.
//! - [`PartitionOps`]: statement-level primitives executed inside one
//!   transaction; the services drive these in a fixed order.

pub mod command;
pub mod error;
pub mod locks;
pub mod ops;
pub mod partition;

pub use command::{DdlCommand, DdlOutcome};
pub use error::{ErrorContext, RepositoryError, RepositoryResult};
pub use locks::LockRepository;
pub use ops::PartitionOps;
pub use partition::PartitionRepository;

/// Everything a backend offers; implemented automatically.
pub trait FullRepository: PartitionRepository + LockRepository {}

impl<T: PartitionRepository + LockRepository> FullRepository for T {}
