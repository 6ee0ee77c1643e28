//! Service layer: the partition lifecycle and the contention monitor.
//!
//! Services are generic over the repository traits so they run unchanged on
//! the Postgres backend and on the in-memory one.

pub mod monitor;
pub mod rollup;
pub mod schema_manager;
pub mod seed;

pub use monitor::{
    parse_interval, render_cycle, ContentionMonitor, CycleReport, MonitorSettings,
    OldestWaiterBlockers, StrategyKind, TerminateAllBlockers, TerminationOutcome,
    TerminationStrategy,
};
pub use rollup::{RollupCoordinator, RollupMode, RollupPlan, RollupReport};
pub use schema_manager::{PartitionRangeReport, SchemaManager};
pub use seed::{seed_orders, SeedPlan, SeedReport};
