//! `DurableOperator`: the administrative surface over the Store. See
//! §4.10. Every method requires the matching optional capability and
//! fails clearly rather than silently no-op'ing when it is absent.

use std::sync::Arc;
use std::time::Duration;

use crate::error::DurableError;
use crate::model::{AuditEntry, Execution, ExecutionId, StepResult};
use crate::store::{ListExecutionsOptions, Store};

#[derive(Debug, Clone)]
pub struct ExecutionDetail {
    pub execution: Execution,
    pub steps: Vec<StepResult>,
    pub audit: Vec<AuditEntry>,
}

pub struct DurableOperator {
    store: Arc<dyn Store>,
}

fn require(capable: bool, name: &'static str) -> Result<(), DurableError> {
    if capable {
        Ok(())
    } else {
        Err(DurableError::Store(crate::error::StoreError::Unsupported(name)))
    }
}

impl DurableOperator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn retry_rollback(&self, execution_id: ExecutionId) -> Result<(), DurableError> {
        require(self.store.capabilities().operator_surface, "retry_rollback")?;
        Ok(self.store.retry_rollback(execution_id).await?)
    }

    pub async fn skip_step(&self, execution_id: ExecutionId, step_id: &str) -> Result<(), DurableError> {
        require(self.store.capabilities().operator_surface, "skip_step")?;
        Ok(self.store.skip_step(execution_id, step_id).await?)
    }

    /// `editState`: overwrite an already-persisted step's result, e.g.
    /// to unblock a replay stuck on a bad cached value.
    pub async fn edit_state(&self, step: &StepResult) -> Result<(), DurableError> {
        require(self.store.capabilities().operator_surface, "edit_step_result")?;
        Ok(self.store.edit_step_result(step).await?)
    }

    pub async fn force_fail(&self, execution_id: ExecutionId, reason: &str) -> Result<(), DurableError> {
        require(self.store.capabilities().operator_surface, "force_fail")?;
        Ok(self.store.force_fail(execution_id, reason).await?)
    }

    pub async fn list_stuck_executions(&self, older_than: Duration) -> Result<Vec<Execution>, DurableError> {
        require(self.store.capabilities().operator_surface, "list_stuck_executions")?;
        Ok(self.store.list_stuck_executions(older_than).await?)
    }

    pub async fn list_executions(&self, opts: ListExecutionsOptions) -> Result<Vec<Execution>, DurableError> {
        require(self.store.capabilities().list_executions, "list_executions")?;
        Ok(self.store.list_executions(opts).await?)
    }

    pub async fn get_execution_detail(&self, execution_id: ExecutionId) -> Result<ExecutionDetail, DurableError> {
        let execution = self.store.get_execution(execution_id).await?.ok_or(DurableError::ExecutionNotFound(execution_id))?;
        let steps = if self.store.capabilities().list_step_results {
            self.store.list_step_results(execution_id).await?
        } else {
            Vec::new()
        };
        let audit = self.store.list_audit_entries(execution_id).await?;
        Ok(ExecutionDetail { execution, steps, audit })
    }
}
