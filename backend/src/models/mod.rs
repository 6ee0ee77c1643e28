//! Domain types shared by the planner, the repositories and the services.

pub mod locks;
pub mod partition;

pub use locks::*;
pub use partition::*;
