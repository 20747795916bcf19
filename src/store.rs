//! The `Store` trait: the engine's sole persistence contract. See §6
//! EXTERNAL INTERFACES. Required methods return `Result<_, StoreError>`
//! directly; optional methods carry a default body that returns
//! `StoreError::Unsupported` (or an empty/`None` value where that reads
//! more naturally) so an implementor only overrides what it actually
//! backs — the same required-vs-optional split as the donor crate's
//! `WorkflowEventStore` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{AuditEntry, Execution, ExecutionId, Schedule, StepResult, TaskId, Timer};

/// What a particular `Store` implementation actually backs, so callers
/// can fail fast instead of discovering `Unsupported` mid-call.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCapabilities {
    pub list_executions: bool,
    pub list_step_results: bool,
    pub audit: bool,
    pub claim_timer: bool,
    pub locks: bool,
    pub idempotency: bool,
    pub operator_surface: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListExecutionsOptions {
    pub task_id: Option<TaskId>,
    pub limit: Option<usize>,
}

/// A held distributed lock. `release`/`renew` must be owner-checked
/// (compare-and-delete / compare-and-update) so an expired holder can
/// never affect a successor's lock.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub resource: String,
    pub lock_id: String,
}

#[async_trait]
pub trait Store: Send + Sync {
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::default()
    }

    // --- required: executions ---------------------------------------
    async fn save_execution(&self, execution: &Execution) -> Result<(), StoreError>;
    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>, StoreError>;
    async fn update_execution(&self, execution: &Execution) -> Result<(), StoreError>;
    async fn list_incomplete_executions(&self) -> Result<Vec<Execution>, StoreError>;

    // --- required: step results --------------------------------------
    async fn get_step_result(&self, execution_id: ExecutionId, step_id: &str) -> Result<Option<StepResult>, StoreError>;
    async fn save_step_result(&self, step: &StepResult) -> Result<(), StoreError>;

    // --- required: timers ---------------------------------------------
    async fn create_timer(&self, timer: &Timer) -> Result<(), StoreError>;
    async fn get_ready_timers(&self, now: DateTime<Utc>) -> Result<Vec<Timer>, StoreError>;
    async fn mark_timer_fired(&self, id: &str) -> Result<(), StoreError>;
    async fn delete_timer(&self, id: &str) -> Result<(), StoreError>;

    // --- required: schedules -------------------------------------------
    async fn create_schedule(&self, schedule: &Schedule) -> Result<(), StoreError>;
    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>, StoreError>;
    async fn update_schedule(&self, schedule: &Schedule) -> Result<(), StoreError>;
    async fn delete_schedule(&self, id: &str) -> Result<(), StoreError>;
    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError>;
    async fn list_active_schedules(&self) -> Result<Vec<Schedule>, StoreError>;

    // --- optional: listing / introspection ------------------------------
    async fn list_executions(&self, _opts: ListExecutionsOptions) -> Result<Vec<Execution>, StoreError> {
        Err(StoreError::Unsupported("list_executions"))
    }

    async fn list_step_results(&self, _execution_id: ExecutionId) -> Result<Vec<StepResult>, StoreError> {
        Err(StoreError::Unsupported("list_step_results"))
    }

    // --- optional: audit -----------------------------------------------
    async fn append_audit_entry(&self, _entry: &AuditEntry) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("append_audit_entry"))
    }

    async fn list_audit_entries(&self, _execution_id: ExecutionId) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(Vec::new())
    }

    // --- optional: timer claiming ----------------------------------------
    async fn claim_timer(&self, _id: &str, _worker_id: &str, _ttl: std::time::Duration) -> Result<bool, StoreError> {
        // Without claim support every poller "wins"; safe only with a
        // single active worker, per §5's shared-resource policy.
        Ok(true)
    }

    // --- optional: locks ---------------------------------------------------
    async fn acquire_lock(&self, _resource: &str, _ttl: std::time::Duration) -> Result<Option<LockHandle>, StoreError> {
        Ok(None)
    }

    async fn release_lock(&self, _handle: &LockHandle) -> Result<(), StoreError> {
        Ok(())
    }

    async fn renew_lock(&self, _handle: &LockHandle, _ttl: std::time::Duration) -> Result<bool, StoreError> {
        Ok(false)
    }

    // --- optional: idempotency -----------------------------------------------
    async fn get_execution_id_by_idempotency_key(
        &self,
        _task_id: &str,
        _key: &str,
    ) -> Result<Option<ExecutionId>, StoreError> {
        Err(StoreError::Unsupported("get_execution_id_by_idempotency_key"))
    }

    /// Compare-and-set: returns `true` iff this call created the mapping.
    async fn set_execution_id_by_idempotency_key(
        &self,
        _task_id: &str,
        _key: &str,
        _execution_id: ExecutionId,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Unsupported("set_execution_id_by_idempotency_key"))
    }

    // --- optional: operator surface -----------------------------------------
    async fn retry_rollback(&self, _execution_id: ExecutionId) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("retry_rollback"))
    }

    async fn skip_step(&self, _execution_id: ExecutionId, _step_id: &str) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("skip_step"))
    }

    async fn force_fail(&self, _execution_id: ExecutionId, _reason: &str) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("force_fail"))
    }

    async fn edit_step_result(&self, _step: &StepResult) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("edit_step_result"))
    }

    async fn list_stuck_executions(&self, _older_than: std::time::Duration) -> Result<Vec<Execution>, StoreError> {
        Err(StoreError::Unsupported("list_stuck_executions"))
    }

    // --- optional: lifecycle -------------------------------------------------
    async fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn dispose(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
