//! `SignalHandler`: delivers an external signal payload to the correct
//! waiting step slot. See §4.5.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;

use crate::audit::AuditLogger;
use crate::error::DurableError;
use crate::model::{AuditKind, ExecutionId, StepResult, StepState};
use crate::store::Store;

/// Resumes a suspended execution, either by enqueueing a `resume`
/// message (queue mode) or by driving the attempt inline (embedded
/// mode). Implemented by [`crate::service::DurableService`].
#[async_trait]
pub trait Resumer: Send + Sync {
    async fn resume(&self, execution_id: ExecutionId);
}

const LOCK_ACQUIRE_RETRIES: u32 = 20;
const LOCK_ACQUIRE_INTERVAL: Duration = Duration::from_millis(5);

pub struct SignalHandler {
    store: Arc<dyn Store>,
    audit: Arc<AuditLogger>,
}

/// One candidate waiting slot found while scanning for the best match.
/// Ordering mirrors the three tie-break groups named in §4.5 and §9's
/// "signal fairness" open question: exact base id, then numeric index
/// ascending, then lexicographic custom id — each group strictly
/// precedes the next regardless of value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SlotRank {
    Base,
    Numeric(u64),
    Custom(String),
}

fn rank_for(step_id: &str, signal_id: &str) -> Option<SlotRank> {
    let base = format!("__signal:{signal_id}");
    if step_id == base {
        return Some(SlotRank::Base);
    }
    let prefix = format!("{base}:");
    if let Some(rest) = step_id.strip_prefix(&prefix) {
        if let Ok(n) = rest.parse::<u64>() {
            return Some(SlotRank::Numeric(n));
        }
        return Some(SlotRank::Custom(step_id.to_string()));
    }
    None
}

const MAX_SCAN_SLOTS: u32 = 1000;

impl SignalHandler {
    pub fn new(store: Arc<dyn Store>, audit: Arc<AuditLogger>) -> Self {
        Self { store, audit }
    }

    /// Finds the best candidate waiting slot for `signal_id`, per the
    /// tie-break order documented on [`SlotRank`]. Uses `list_step_results`
    /// when the store supports it; otherwise falls back to scanning
    /// indices `__signal:<id>`, `__signal:<id>:1`, … up to 1000 slots.
    async fn find_best_waiting_slot(&self, execution_id: ExecutionId, signal_id: &str) -> Result<Option<StepResult>, DurableError> {
        if self.store.capabilities().list_step_results {
            let rows = self.store.list_step_results(execution_id).await?;
            let mut candidates: Vec<(SlotRank, StepResult)> = rows
                .into_iter()
                .filter(|row| matches!(&row.result, StepState::Waiting { signal_id: sid, .. } if sid == signal_id))
                .filter_map(|row| rank_for(&row.step_id, signal_id).map(|rank| (rank, row)))
                .collect();
            candidates.sort_by(|a, b| a.0.cmp(&b.0));
            return Ok(candidates.into_iter().next().map(|(_, row)| row));
        }

        let base_id = format!("__signal:{signal_id}");
        if let Some(row) = self.store.get_step_result(execution_id, &base_id).await? {
            if matches!(&row.result, StepState::Waiting { signal_id: sid, .. } if sid == signal_id) {
                return Ok(Some(row));
            }
        }
        for n in 1..MAX_SCAN_SLOTS {
            let id = format!("{base_id}:{n}");
            if let Some(row) = self.store.get_step_result(execution_id, &id).await? {
                if matches!(&row.result, StepState::Waiting { signal_id: sid, .. } if sid == signal_id) {
                    return Ok(Some(row));
                }
            }
        }
        Ok(None)
    }

    /// Buffers a payload into the first never-used slot so repeated
    /// signals on already-completed/timed-out slots still arrive in
    /// FIFO order when a `waitForSignal` eventually claims them.
    async fn buffer_into_next_free_slot(&self, execution_id: ExecutionId, signal_id: &str, payload: Value) -> Result<String, DurableError> {
        let base_id = format!("__signal:{signal_id}");
        if self.store.get_step_result(execution_id, &base_id).await?.is_none() {
            self.write_completed(execution_id, &base_id, signal_id, payload).await?;
            return Ok(base_id);
        }
        for n in 1..MAX_SCAN_SLOTS {
            let id = format!("{base_id}:{n}");
            if self.store.get_step_result(execution_id, &id).await?.is_none() {
                self.write_completed(execution_id, &id, signal_id, payload).await?;
                return Ok(id);
            }
        }
        Err(DurableError::StoreShapeError(format!("no free signal slot for '{signal_id}' after scanning {MAX_SCAN_SLOTS} indices")))
    }

    async fn write_completed(&self, execution_id: ExecutionId, step_id: &str, _signal_id: &str, payload: Value) -> Result<(), DurableError> {
        let step = StepResult {
            execution_id,
            step_id: step_id.to_string(),
            result: StepState::SignalCompleted { payload },
            created_at: chrono::Utc::now(),
        };
        self.store.save_step_result(&step).await?;
        Ok(())
    }

    /// Delivers `payload` for `signal_id` to `execution_id`, per the
    /// five ordered steps in §4.5.
    pub async fn signal(
        &self,
        execution_id: ExecutionId,
        signal_id: &str,
        payload: Value,
        resumer: &(dyn Resumer),
    ) -> Result<(), DurableError> {
        let lock_resource = format!("signal:{execution_id}:{signal_id}");
        let mut handle = None;
        if self.store.capabilities().locks {
            for _ in 0..LOCK_ACQUIRE_RETRIES {
                if let Some(h) = self.store.acquire_lock(&lock_resource, Duration::from_secs(5)).await? {
                    handle = Some(h);
                    break;
                }
                sleep(LOCK_ACQUIRE_INTERVAL).await;
            }
        }

        let slot = self.find_best_waiting_slot(execution_id, signal_id).await?;
        let delivered_step_id = match slot {
            Some(row) => {
                if let StepState::Waiting { timer_id, .. } = &row.result {
                    if let Some(timer_id) = timer_id {
                        self.store.delete_timer(timer_id).await.map_err(DurableError::from)?;
                    }
                }
                self.write_completed(execution_id, &row.step_id, signal_id, payload).await?;
                row.step_id
            }
            None => self.buffer_into_next_free_slot(execution_id, signal_id, payload).await?,
        };

        if let Some(handle) = &handle {
            self.store.release_lock(handle).await?;
        }

        let attempt = self.store.get_execution(execution_id).await?.map(|e| e.attempt).unwrap_or(0);
        self.audit.record(execution_id, attempt, AuditKind::SignalDelivered { step_id: delivered_step_id, signal_id: signal_id.to_string() }).await;

        if let Some(execution) = self.store.get_execution(execution_id).await? {
            if !execution.status.is_terminal() {
                resumer.resume(execution_id).await;
            }
        }
        Ok(())
    }
}
