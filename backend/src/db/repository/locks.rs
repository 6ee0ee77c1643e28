//! Lock and session catalog trait.

use async_trait::async_trait;

use super::error::RepositoryResult;
use crate::models::{BlockedSession, FastPathUsage, LockCount};

/// Read access to the store's lock/session catalogs plus session
/// termination.
#[async_trait]
pub trait LockRepository: Send + Sync {
    /// Lock counts grouped by `(locktype, mode)`, ordered by both.
    async fn lock_counts(&self) -> RepositoryResult<Vec<LockCount>>;

    /// Per-session fast-path vs. regular lock usage, ordered by pid then
    /// mode, at most `limit` rows.
    async fn fastpath_usage(&self, limit: usize) -> RepositoryResult<Vec<FastPathUsage>>;

    /// Sessions waiting on at least one other session, oldest query first.
    /// Query text is cut to `excerpt_len` characters.
    async fn blocked_sessions(&self, excerpt_len: usize) -> RepositoryResult<Vec<BlockedSession>>;

    /// Ask the store to terminate a session.
    ///
    /// # Returns
    /// * `Ok(true)` - The session was signalled
    /// * `Ok(false)` - The store refused or the session no longer exists
    async fn terminate_session(&self, pid: i32) -> RepositoryResult<bool>;
}
