//! `WaitManager`: block a caller until an execution reaches a terminal
//! state, using the EventBus plus a polling fallback. See §4.3.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{interval, timeout};

use crate::error::{CauseInfo, DurableError};
use crate::eventbus::{execution_channel, EventBus};
use crate::model::{Execution, ExecutionId, ExecutionStatus};
use crate::store::Store;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct WaitManager {
    store: Arc<dyn Store>,
    event_bus: Option<Arc<dyn EventBus>>,
}

fn cause_info(execution: Option<&Execution>, execution_id: ExecutionId) -> CauseInfo {
    match execution {
        Some(e) => CauseInfo { execution_id, task_id: e.task_id.clone(), attempt: e.attempt, cause: e.error.as_ref().map(|err| err.message.clone()) },
        None => CauseInfo { execution_id, task_id: "unknown".to_string(), attempt: 0, cause: None },
    }
}

fn terminal_outcome(execution: Execution) -> Result<Value, DurableError> {
    let info = cause_info(Some(&execution), execution.id);
    match execution.status {
        ExecutionStatus::Completed => execution
            .result
            .clone()
            .ok_or(DurableError::ExecutionCompletedWithoutResult { info }),
        ExecutionStatus::Failed => Err(DurableError::ExecutionFailed {
            message: execution.error.map(|e| e.message).unwrap_or_default(),
            info,
        }),
        ExecutionStatus::CompensationFailed => Err(DurableError::CompensationFailed {
            message: execution.error.map(|e| e.message).unwrap_or_default(),
            info,
        }),
        ExecutionStatus::Cancelled => Err(DurableError::ExecutionCancelled {
            message: execution.error.map(|e| e.message).unwrap_or_default(),
            info,
        }),
        _ => unreachable!("terminal_outcome called on a non-terminal execution"),
    }
}

impl WaitManager {
    pub fn new(store: Arc<dyn Store>, event_bus: Option<Arc<dyn EventBus>>) -> Self {
        Self { store, event_bus }
    }

    /// Resolves with the execution's result, or fails with a durable
    /// error carrying `{executionId, taskId, attempt, causeInfo?}`, per
    /// the outcome mapping in §4.3.
    pub async fn wait_for_result(&self, execution_id: ExecutionId, wait_timeout: Option<Duration>) -> Result<Value, DurableError> {
        let fut = self.wait_for_result_inner(execution_id);
        match wait_timeout {
            Some(budget) => match timeout(budget, fut).await {
                Ok(result) => result,
                Err(_) => Err(DurableError::WaitTimeout(execution_id)),
            },
            None => fut.await,
        }
    }

    async fn wait_for_result_inner(&self, execution_id: ExecutionId) -> Result<Value, DurableError> {
        if let Some(execution) = self.store.get_execution(execution_id).await? {
            if execution.status.is_terminal() {
                return terminal_outcome(execution);
            }
        } else {
            return Err(DurableError::ExecutionNotFound(execution_id));
        }

        let mut subscription = match &self.event_bus {
            Some(bus) => bus.subscribe(&execution_channel(execution_id)).await.ok(),
            None => None,
        };
        let mut poll = interval(DEFAULT_POLL_INTERVAL);
        poll.tick().await; // first tick fires immediately; consume it

        loop {
            if let Some(rx) = subscription.as_mut() {
                tokio::select! {
                    notification = rx.recv() => {
                        if notification.is_ok() {
                            if let Some(result) = self.check_terminal(execution_id).await? {
                                return result;
                            }
                        }
                        // A lagged/closed subscription just falls through to
                        // the next poll tick below.
                    }
                    _ = poll.tick() => {
                        if let Some(result) = self.check_terminal(execution_id).await? {
                            return result;
                        }
                    }
                }
            } else {
                poll.tick().await;
                if let Some(result) = self.check_terminal(execution_id).await? {
                    return result;
                }
            }
        }
    }

    async fn check_terminal(&self, execution_id: ExecutionId) -> Result<Option<Result<Value, DurableError>>, DurableError> {
        match self.store.get_execution(execution_id).await? {
            Some(execution) if execution.status.is_terminal() => Ok(Some(terminal_outcome(execution))),
            Some(_) => Ok(None),
            None => Ok(Some(Err(DurableError::ExecutionNotFound(execution_id)))),
        }
    }
}
