//! # Durable Execution Engine
//!
//! A crash-safe, at-least-once durable task execution engine: runs
//! user-supplied workflow functions that persist every externally
//! visible decision (step result, sleep, signal wait, switch branch)
//! to a pluggable [`Store`](store::Store) so a fresh attempt after any
//! crash or restart deterministically re-derives prior outcomes and
//! only executes what has not yet been recorded.
//!
//! ## Features
//!
//! - **Replayable workflows**: workflows are `async fn(DurableContext,
//!   Value) -> Result<Value, ExecOutcome>` closures; every durable
//!   decision routes through the context so replay is deterministic.
//! - **Long-running suspension**: sleeps, external signals (with
//!   optional timeout), and scheduled recurrence (interval/cron/once)
//!   all suspend an attempt without holding a worker thread.
//! - **Compensating rollback**: steps may register a `down` function;
//!   on workflow failure compensations run LIFO, each as its own
//!   durable `rollback:<stepId>` step.
//! - **Pluggable backends**: `Store`/`Queue`/`EventBus` are traits with
//!   a required/optional capability split; `memory` ships an in-process
//!   reference implementation good enough to run this crate's own test
//!   suite and small deployments.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DurableService                          │
//! │  (façade: start/execute/wait/signal/schedule/recover)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!            ┌─────────────────┼─────────────────┐
//!            ▼                 ▼                 ▼
//! ┌─────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │ ExecutionManager │ │  PollingManager  │ │  SignalHandler   │
//! │ (runExecution    │ │ (sleeps, retries,│ │ (deliver payload │
//! │  Attempt funnel) │ │  schedule fires) │ │  to waiting slot)│
//! └─────────────────┘ └──────────────────┘ └──────────────────┘
//!            │
//!            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DurableContext                          │
//! │  (step/sleep/waitForSignal/switch/emit/note, replayed        │
//! │   against the Store on every attempt)                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Store / Queue / EventBus                     │
//! │  (executions, step results, timers, schedules, audit trail)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use durable_runtime::prelude::*;
//! use std::sync::Arc;
//!
//! let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
//! let charge_card: TaskFn = Arc::new(|ctx, input| Box::pin(async move {
//!     let amount = input["amount"].as_i64().unwrap_or(0);
//!     let charge_id: String = ctx.step("charge", move || async move {
//!         Ok(format!("ch_{amount}"))
//!     }).await?;
//!     Ok(serde_json::json!({ "chargeId": charge_id }))
//! }));
//!
//! let service = DurableService::builder(store)
//!     .register("charge_card", charge_card)
//!     .build();
//! ```

pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod eventbus;
pub mod execution;
pub mod memory;
pub mod model;
pub mod operator;
pub mod polling;
pub mod queue;
pub mod registry;
pub mod reliability;
pub mod schedule;
pub mod service;
pub mod signal;
pub mod store;
pub mod wait;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::audit::AuditLogger;
    pub use crate::config::{DeterminismPolicy, DurableConfig};
    pub use crate::context::{DurableContext, ExecOutcome, StepOptions, SuspendReason};
    pub use crate::error::{CauseInfo, DurableError, EventBusError, QueueError, StoreError};
    pub use crate::eventbus::{Event, EventBus};
    pub use crate::execution::{ExecutionManager, StartOptions};
    pub use crate::memory::{InMemoryBackend, InMemoryEventBus, InMemoryQueue, InMemoryStore};
    pub use crate::model::{
        AuditEntry, AuditKind, Execution, ExecutionError, ExecutionId, ExecutionStatus, Schedule,
        ScheduleId, ScheduleStatus, ScheduleType, StepId, StepResult, StepState, TaskId, Timer,
        TimerId, TimerStatus, TimerType,
    };
    pub use crate::operator::{DurableOperator, ExecutionDetail};
    pub use crate::polling::PollingManager;
    pub use crate::queue::{Delivery, MessageType, Queue, QueueMessage};
    pub use crate::registry::{ExternalResolver, TaskFn, TaskRegistry};
    pub use crate::schedule::{ScheduleManager, ScheduleSpec};
    pub use crate::service::{DurableService, DurableServiceBuilder};
    pub use crate::signal::{Resumer, SignalHandler};
    pub use crate::store::{ListExecutionsOptions, LockHandle, Store, StoreCapabilities};
    pub use crate::wait::WaitManager;
}

// Re-export key types at crate root.
pub use config::DurableConfig;
pub use context::{DurableContext, ExecOutcome, SuspendReason};
pub use error::DurableError;
pub use execution::{ExecutionManager, StartOptions};
pub use model::{Execution, ExecutionId, ExecutionStatus};
pub use operator::DurableOperator;
pub use registry::{TaskFn, TaskRegistry};
pub use service::{DurableService, DurableServiceBuilder};
pub use store::Store;
