//! Error types for repository operations.
//!
//! Every operation against the store (DDL, catalog lookups, lock sampling,
//! session termination) reports failures through [`RepositoryError`], with a
//! structured [`ErrorContext`] describing where the failure happened.

use std::fmt;

/// Result type for repository operations
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Structured context for repository errors.
///
/// Provides additional information about where and why an error occurred.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// The operation being performed (e.g., "create_child_partition", "rollup_week")
    pub operation: Option<String>,
    /// The entity type involved (e.g., "partition", "constraint", "session")
    pub entity: Option<String>,
    /// The entity ID if applicable (table name, pid, ...)
    pub entity_id: Option<String>,
    /// Additional details about the error
    pub details: Option<String>,
    /// Whether this error is retryable
    pub retryable: bool,
}

impl ErrorContext {
    /// Create a new error context with an operation name.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Default::default()
        }
    }

    /// Set the entity type.
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    /// Set the entity ID.
    pub fn with_entity_id(mut self, id: impl ToString) -> Self {
        self.entity_id = Some(id.to_string());
        self
    }

    /// Set additional details.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Mark this error as retryable.
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(ref op) = self.operation {
            parts.push(format!("operation={}", op));
        }
        if let Some(ref entity) = self.entity {
            parts.push(format!("entity={}", entity));
        }
        if let Some(ref id) = self.entity_id {
            parts.push(format!("id={}", id));
        }
        if let Some(ref details) = self.details {
            parts.push(format!("details={}", details));
        }
        if self.retryable {
            parts.push("retryable=true".to_string());
        }
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Error type for repository operations
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Connection pool or database connection errors.
    /// These are typically transient and may be retried.
    #[error("Connection error: {message} {context}")]
    ConnectionError {
        message: String,
        context: ErrorContext,
    },

    /// SQL statement execution errors not covered by a more specific kind.
    #[error("Query error: {message} {context}")]
    QueryError {
        message: String,
        context: ErrorContext,
    },

    /// Requested relation, partition or session was not found.
    #[error("Not found: {message} {context}")]
    NotFound {
        message: String,
        context: ErrorContext,
    },

    /// Configuration or initialization error.
    #[error("Configuration error: {message} {context}")]
    ConfigurationError {
        message: String,
        context: ErrorContext,
    },

    /// Internal/unexpected errors.
    #[error("Internal error: {message} {context}")]
    InternalError {
        message: String,
        context: ErrorContext,
    },

    /// Transaction error (commit/rollback failed).
    #[error("Transaction error: {message} {context}")]
    TransactionError {
        message: String,
        context: ErrorContext,
    },

    /// A time range whose end does not lie after its start.
    #[error("Invalid range: {message} {context}")]
    InvalidRange {
        message: String,
        context: ErrorContext,
    },

    /// DDL waited on a lock longer than the configured `lock_timeout`.
    #[error("Lock timeout: {message} {context}")]
    LockTimeout {
        message: String,
        context: ErrorContext,
    },

    /// An expected range constraint is absent from a relation.
    #[error("Constraint discovery error: {message} {context}")]
    ConstraintDiscovery {
        message: String,
        context: ErrorContext,
    },

    /// Rows violate a range constraint, or an attach range does not match
    /// the child's validated constraint.
    #[error("Validation failure: {message} {context}")]
    ValidationFailure {
        message: String,
        context: ErrorContext,
    },

    /// A session termination attempt failed (e.g. the session is gone).
    #[error("Termination error: {message} {context}")]
    Termination {
        message: String,
        context: ErrorContext,
    },
}

impl RepositoryError {
    /// Create a connection error with context.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
            context: ErrorContext::default().retryable(),
        }
    }

    /// Create a connection error with full context.
    pub fn connection_with_context(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::ConnectionError {
            message: message.into(),
            context: context.retryable(),
        }
    }

    /// Create a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::QueryError {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    /// Create a query error with context.
    pub fn query_with_context(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::QueryError {
            message: message.into(),
            context,
        }
    }

    /// Create a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    /// Create a not found error with context.
    pub fn not_found_with_context(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::NotFound {
            message: message.into(),
            context,
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    /// Create a configuration error with context.
    pub fn configuration_with_context(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            context,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    /// Create an internal error with context.
    pub fn internal_with_context(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::InternalError {
            message: message.into(),
            context,
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::TransactionError {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    /// Create an invalid range error.
    pub fn invalid_range(message: impl Into<String>) -> Self {
        Self::InvalidRange {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    /// Create a lock timeout error.
    ///
    /// Not retryable: retrying DDL against the lock queue that just timed out
    /// adds another waiter to it.
    pub fn lock_timeout(message: impl Into<String>) -> Self {
        Self::LockTimeout {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    /// Create a constraint discovery error with context.
    pub fn constraint_discovery(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::ConstraintDiscovery {
            message: message.into(),
            context,
        }
    }

    /// Create a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailure {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    /// Create a validation failure with context.
    pub fn validation_with_context(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::ValidationFailure {
            message: message.into(),
            context,
        }
    }

    /// Create a termination error for a session id.
    pub fn termination(pid: i32, message: impl Into<String>) -> Self {
        Self::Termination {
            message: message.into(),
            context: ErrorContext::new("terminate_session")
                .with_entity("session")
                .with_entity_id(pid),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionError { context, .. } => context.retryable,
            Self::QueryError { context, .. } => context.retryable,
            Self::TransactionError { context, .. } => context.retryable,
            _ => false,
        }
    }

    /// Check if this error is a lock-wait timeout.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Get the error context.
    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::ConnectionError { context, .. }
            | Self::QueryError { context, .. }
            | Self::NotFound { context, .. }
            | Self::ConfigurationError { context, .. }
            | Self::InternalError { context, .. }
            | Self::TransactionError { context, .. }
            | Self::InvalidRange { context, .. }
            | Self::LockTimeout { context, .. }
            | Self::ConstraintDiscovery { context, .. }
            | Self::ValidationFailure { context, .. }
            | Self::Termination { context, .. } => context,
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            Self::ConnectionError { context, .. }
            | Self::QueryError { context, .. }
            | Self::NotFound { context, .. }
            | Self::ConfigurationError { context, .. }
            | Self::InternalError { context, .. }
            | Self::TransactionError { context, .. }
            | Self::InvalidRange { context, .. }
            | Self::LockTimeout { context, .. }
            | Self::ConstraintDiscovery { context, .. }
            | Self::ValidationFailure { context, .. }
            | Self::Termination { context, .. } => context,
        }
    }

    /// Add or update the operation in the error context.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.context_mut().operation = Some(operation.into());
        self
    }

    /// Add or update the entity id in the error context, keeping an id that
    /// was already set closer to the failure.
    pub fn with_entity_id(mut self, id: impl ToString) -> Self {
        let context = self.context_mut();
        if context.entity_id.is_none() {
            context.entity_id = Some(id.to_string());
        }
        self
    }
}

/// Classify a server error message into a repository error kind.
///
/// Lock-wait timeouts (SQLSTATE 55P03) and partition/check constraint
/// violations (23514) get dedicated kinds; everything else is a query error.
pub(crate) fn classify_server_message(message: &str, context: ErrorContext) -> RepositoryError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("lock timeout") {
        RepositoryError::LockTimeout {
            message: message.to_string(),
            context,
        }
    } else if lower.contains("violated by some row") || lower.contains("violates check constraint")
    {
        RepositoryError::ValidationFailure {
            message: message.to_string(),
            context,
        }
    } else {
        RepositoryError::QueryError {
            message: message.to_string(),
            context,
        }
    }
}

#[cfg(feature = "postgres-repo")]
impl From<diesel::result::Error> for RepositoryError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => RepositoryError::not_found("Record not found"),
            diesel::result::Error::DatabaseError(kind, info) => {
                let message = info.message().to_string();
                let context =
                    ErrorContext::default().with_details(format!("db_error_kind={:?}", kind));

                match kind {
                    diesel::result::DatabaseErrorKind::CheckViolation => {
                        RepositoryError::ValidationFailure { message, context }
                    }
                    diesel::result::DatabaseErrorKind::ClosedConnection
                    | diesel::result::DatabaseErrorKind::UnableToSendCommand => {
                        RepositoryError::connection_with_context(message, context)
                    }
                    _ => classify_server_message(&message, context),
                }
            }
            diesel::result::Error::QueryBuilderError(e) => {
                RepositoryError::query(format!("Query builder error: {}", e))
            }
            diesel::result::Error::DeserializationError(e) => {
                RepositoryError::internal(format!("Deserialization error: {}", e))
            }
            diesel::result::Error::SerializationError(e) => {
                RepositoryError::internal(format!("Serialization error: {}", e))
            }
            diesel::result::Error::RollbackTransaction => {
                RepositoryError::transaction("Transaction rolled back")
            }
            other => RepositoryError::query(other.to_string()),
        }
    }
}

#[cfg(feature = "postgres-repo")]
impl From<diesel::r2d2::PoolError> for RepositoryError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        RepositoryError::connection_with_context(
            err.to_string(),
            ErrorContext::default()
                .with_details("pool_error")
                .retryable(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_message_is_classified() {
        let err = classify_server_message(
            "canceling statement due to lock timeout",
            ErrorContext::new("attach_partition"),
        );
        assert!(err.is_lock_timeout());
        assert!(!err.is_retryable());
    }

    #[test]
    fn partition_constraint_violation_is_validation_failure() {
        let err = classify_server_message(
            "partition constraint of relation \"orders_wk_2025_01_01\" is violated by some row",
            ErrorContext::default(),
        );
        assert!(matches!(err, RepositoryError::ValidationFailure { .. }));
    }

    #[test]
    fn other_messages_are_query_errors() {
        let err = classify_server_message(
            "relation \"orders_2025_01_03\" does not exist",
            ErrorContext::default(),
        );
        assert!(matches!(err, RepositoryError::QueryError { .. }));
    }

    #[test]
    fn with_entity_id_keeps_inner_id() {
        let err = RepositoryError::termination(42, "session already gone").with_entity_id(7);
        assert_eq!(err.context().entity_id.as_deref(), Some("42"));
        assert_eq!(err.context().operation.as_deref(), Some("terminate_session"));
    }
}
