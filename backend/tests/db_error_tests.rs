//! Tests for db::repository::error module.

use partition_lab::db::repository::{ErrorContext, RepositoryError, RepositoryResult};

#[test]
fn test_error_context_new() {
    let ctx = ErrorContext::new("rollup_week");
    assert_eq!(ctx.operation, Some("rollup_week".to_string()));
    assert!(ctx.entity.is_none());
    assert!(ctx.entity_id.is_none());
    assert!(ctx.details.is_none());
    assert!(!ctx.retryable);
}

#[test]
fn test_error_context_chaining() {
    let ctx = ErrorContext::new("attach_partition")
        .with_entity("partition")
        .with_entity_id("lab.orders_wk_2025_01_01")
        .with_details("step 5")
        .retryable();

    assert_eq!(ctx.operation, Some("attach_partition".to_string()));
    assert_eq!(ctx.entity, Some("partition".to_string()));
    assert_eq!(ctx.entity_id, Some("lab.orders_wk_2025_01_01".to_string()));
    assert_eq!(ctx.details, Some("step 5".to_string()));
    assert!(ctx.retryable);
}

#[test]
fn test_error_context_display() {
    let ctx = ErrorContext::new("detach_partition")
        .with_entity("partition")
        .with_entity_id(7);

    let display = format!("{}", ctx);
    assert!(display.contains("operation=detach_partition"));
    assert!(display.contains("entity=partition"));
    assert!(display.contains("id=7"));
    assert!(!display.contains("retryable"));
}

#[test]
fn test_error_context_default() {
    let ctx = ErrorContext::default();
    assert!(ctx.operation.is_none());
    assert_eq!(format!("{}", ctx), "[]");
}

#[test]
fn test_repository_error_display() {
    let cases = [
        (RepositoryError::connection("pool exhausted"), "Connection error"),
        (RepositoryError::query("syntax error"), "Query error"),
        (RepositoryError::not_found("no such relation"), "Not found"),
        (RepositoryError::configuration("bad SCHEMA"), "Configuration error"),
        (RepositoryError::internal("unexpected outcome"), "Internal error"),
        (RepositoryError::transaction("rolled back"), "Transaction error"),
        (RepositoryError::invalid_range("end before start"), "Invalid range"),
        (
            RepositoryError::lock_timeout("canceling statement due to lock timeout"),
            "Lock timeout",
        ),
        (RepositoryError::validation("violated by some row"), "Validation failure"),
        (RepositoryError::termination(4242, "already gone"), "Termination error"),
    ];
    for (err, prefix) in cases {
        assert!(err.to_string().starts_with(prefix), "{}", err);
    }
}

#[test]
fn test_constraint_discovery_carries_context() {
    let err = RepositoryError::constraint_discovery(
        "no range CHECK constraint",
        ErrorContext::new("rollup_week").with_entity_id("lab.orders_wk_2025_01_01"),
    );
    let text = err.to_string();
    assert!(text.contains("Constraint discovery error"));
    assert!(text.contains("id=lab.orders_wk_2025_01_01"));
}

#[test]
fn test_only_connection_errors_are_retryable() {
    assert!(RepositoryError::connection("temp failure").is_retryable());
    assert!(!RepositoryError::lock_timeout("lock timeout").is_retryable());
    assert!(!RepositoryError::validation("invalid").is_retryable());
    assert!(!RepositoryError::not_found("missing").is_retryable());
    assert!(!RepositoryError::termination(1, "gone").is_retryable());
}

#[test]
fn test_is_lock_timeout() {
    assert!(RepositoryError::lock_timeout("lock timeout").is_lock_timeout());
    assert!(!RepositoryError::query("lock timeout").is_lock_timeout());
}

#[test]
fn test_with_operation_overrides() {
    let err = RepositoryError::query("error").with_operation("count_rows");
    assert_eq!(err.context().operation.as_deref(), Some("count_rows"));
    assert!(err.to_string().contains("operation=count_rows"));
}

#[test]
fn test_with_entity_id_fills_only_when_absent() {
    let err = RepositoryError::query("error").with_entity_id("2025_01_02");
    assert_eq!(err.context().entity_id.as_deref(), Some("2025_01_02"));

    let err = err.with_entity_id("outer");
    assert_eq!(err.context().entity_id.as_deref(), Some("2025_01_02"));
}

#[test]
fn test_termination_error_names_session() {
    let err = RepositoryError::termination(4242, "session was not signalled");
    let ctx = err.context();
    assert_eq!(ctx.operation.as_deref(), Some("terminate_session"));
    assert_eq!(ctx.entity.as_deref(), Some("session"));
    assert_eq!(ctx.entity_id.as_deref(), Some("4242"));
}

#[test]
fn test_repository_result_err() {
    let result: RepositoryResult<i32> = Err(RepositoryError::not_found("test"));
    assert!(matches!(result, Err(RepositoryError::NotFound { .. })));
}
