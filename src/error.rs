//! Error types for the durable execution engine.
//!
//! `DurableError` is the single error type returned across the public
//! surface of [`crate::service::DurableService`] and friends; it wraps the
//! backend-specific [`StoreError`]/[`QueueError`]/[`EventBusError`] enums
//! via `#[from]` so callers can match on one type regardless of which
//! optional capability produced the failure.

use crate::model::{ExecutionId, TaskId};

/// Errors surfaced by a [`crate::store::Store`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("optional store capability not supported: {0}")]
    Unsupported(&'static str),

    #[error("store backend error: {0}")]
    Backend(#[source] anyhow::Error),

    #[error("stored payload has unexpected shape: {0}")]
    ShapeError(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Errors surfaced by a [`crate::queue::Queue`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(#[source] anyhow::Error),

    #[error("queue is closed")]
    Closed,
}

/// Errors surfaced by an [`crate::eventbus::EventBus`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("event bus backend error: {0}")]
    Backend(#[source] anyhow::Error),

    #[error("no such subscription")]
    NoSuchSubscription,
}

/// Extra context attached to a failed/cancelled/timed-out wait, matching
/// the `{executionId, taskId, attempt, causeInfo?}` shape from the wait
/// manager's contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CauseInfo {
    pub execution_id: ExecutionId,
    pub task_id: TaskId,
    pub attempt: u32,
    pub cause: Option<String>,
}

/// The unified error type for the durable execution engine's public API.
///
/// Variant names track the exit/failure codes named in the specification
/// verbatim so operator tooling and log greps can key off them directly.
#[derive(Debug, thiserror::Error)]
pub enum DurableError {
    #[error("execution-not-found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("execution-completed-without-result: {info:?}")]
    ExecutionCompletedWithoutResult { info: CauseInfo },

    #[error("execution-failed: {info:?}: {message}")]
    ExecutionFailed { info: CauseInfo, message: String },

    #[error("compensation-failed: {info:?}: {message}")]
    CompensationFailed { info: CauseInfo, message: String },

    #[error("execution-cancelled: {info:?}: {message}")]
    ExecutionCancelled { info: CauseInfo, message: String },

    #[error("wait-timeout waiting on {0}")]
    WaitTimeout(ExecutionId),

    #[error("signal-timeout waiting for signal on {0}")]
    SignalTimeout(ExecutionId),

    #[error("determinism-violation: {0}")]
    DeterminismViolation(String),

    #[error("idempotency-not-supported: store does not implement idempotency key mapping")]
    IdempotencyNotSupported,

    #[error("idempotency-lock-failed: {0}")]
    IdempotencyLockFailed(String),

    #[error("store-shape-error: {0}")]
    StoreShapeError(String),

    #[error("task not registered: {0}")]
    TaskNotRegistered(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    EventBus(#[from] EventBusError),
}
