//! In-memory reference implementation of `Store`, `Queue`, and
//! `EventBus`. Grounded in the donor crate's `InMemoryWorkflowEventStore`:
//! `parking_lot::RwLock<HashMap<...>>` fields, linear-scan-with-filter
//! queries, and test-only inspection helpers (`execution_count`, etc).
//! Good enough to run this crate's own test suite and small embedded
//! deployments; not a substitute for a real backend (see DESIGN.md for
//! why Postgres/Redis-backed stores are out of scope here).

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::error::{EventBusError, QueueError, StoreError};
use crate::eventbus::{Event, EventBus};
use crate::model::{AuditEntry, Execution, ExecutionId, Schedule, ScheduleStatus, StepResult, Timer, TimerStatus};
use crate::queue::{Delivery, Queue, QueueMessage};
use crate::store::{ListExecutionsOptions, LockHandle, Store, StoreCapabilities};

#[derive(Default)]
struct StoreState {
    executions: std::collections::HashMap<ExecutionId, Execution>,
    steps: std::collections::HashMap<(ExecutionId, String), StepResult>,
    timers: std::collections::HashMap<String, Timer>,
    schedules: std::collections::HashMap<String, Schedule>,
    audit: Vec<AuditEntry>,
    locks: std::collections::HashMap<String, String>,
    idempotency: std::collections::HashMap<(String, String), ExecutionId>,
    claimed_timers: std::collections::HashMap<String, String>,
}

/// A single-process `Store` implementation backed by `RwLock`-guarded
/// hash maps. All optional capabilities are supported, so this is also
/// the reference backend exercised by every invariant/scenario test in
/// this crate.
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { state: RwLock::new(StoreState::default()) }
    }

    pub fn execution_count(&self) -> usize {
        self.state.read().executions.len()
    }

    pub fn timer_count(&self) -> usize {
        self.state.read().timers.len()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            list_executions: true,
            list_step_results: true,
            audit: true,
            claim_timer: true,
            locks: true,
            idempotency: true,
            operator_surface: true,
        }
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        self.state.write().executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>, StoreError> {
        Ok(self.state.read().executions.get(&id).cloned())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if !state.executions.contains_key(&execution.id) {
            return Err(StoreError::ExecutionNotFound(execution.id));
        }
        state.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn list_incomplete_executions(&self) -> Result<Vec<Execution>, StoreError> {
        Ok(self.state.read().executions.values().filter(|e| !e.status.is_terminal()).cloned().collect())
    }

    async fn get_step_result(&self, execution_id: ExecutionId, step_id: &str) -> Result<Option<StepResult>, StoreError> {
        Ok(self.state.read().steps.get(&(execution_id, step_id.to_string())).cloned())
    }

    async fn save_step_result(&self, step: &StepResult) -> Result<(), StoreError> {
        self.state.write().steps.insert((step.execution_id, step.step_id.clone()), step.clone());
        Ok(())
    }

    async fn create_timer(&self, timer: &Timer) -> Result<(), StoreError> {
        self.state.write().timers.insert(timer.id.clone(), timer.clone());
        Ok(())
    }

    async fn get_ready_timers(&self, now: DateTime<Utc>) -> Result<Vec<Timer>, StoreError> {
        Ok(self
            .state
            .read()
            .timers
            .values()
            .filter(|t| t.status == TimerStatus::Pending && t.fire_at <= now)
            .cloned()
            .collect())
    }

    async fn mark_timer_fired(&self, id: &str) -> Result<(), StoreError> {
        if let Some(timer) = self.state.write().timers.get_mut(id) {
            timer.status = TimerStatus::Fired;
        }
        Ok(())
    }

    async fn delete_timer(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.timers.remove(id);
        state.claimed_timers.remove(id);
        Ok(())
    }

    async fn create_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        self.state.write().schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>, StoreError> {
        Ok(self.state.read().schedules.get(id).cloned())
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        self.state.write().schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn delete_schedule(&self, id: &str) -> Result<(), StoreError> {
        self.state.write().schedules.remove(id);
        Ok(())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        Ok(self.state.read().schedules.values().cloned().collect())
    }

    async fn list_active_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        Ok(self
            .state
            .read()
            .schedules
            .values()
            .filter(|s| s.status == ScheduleStatus::Active)
            .cloned()
            .collect())
    }

    async fn list_executions(&self, opts: ListExecutionsOptions) -> Result<Vec<Execution>, StoreError> {
        let state = self.state.read();
        let mut rows: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| opts.task_id.as_deref().map(|t| t == e.task_id).unwrap_or(true))
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.created_at);
        if let Some(limit) = opts.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn list_step_results(&self, execution_id: ExecutionId) -> Result<Vec<StepResult>, StoreError> {
        Ok(self
            .state
            .read()
            .steps
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn append_audit_entry(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.state.write().audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit_entries(&self, execution_id: ExecutionId) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self.state.read().audit.iter().filter(|a| a.execution_id == execution_id).cloned().collect())
    }

    async fn claim_timer(&self, id: &str, worker_id: &str, _ttl: std::time::Duration) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        match state.claimed_timers.get(id) {
            Some(owner) if owner != worker_id => Ok(false),
            _ => {
                state.claimed_timers.insert(id.to_string(), worker_id.to_string());
                Ok(true)
            }
        }
    }

    async fn acquire_lock(&self, resource: &str, _ttl: std::time::Duration) -> Result<Option<LockHandle>, StoreError> {
        let mut state = self.state.write();
        if state.locks.contains_key(resource) {
            return Ok(None);
        }
        let lock_id = uuid::Uuid::now_v7().to_string();
        state.locks.insert(resource.to_string(), lock_id.clone());
        Ok(Some(LockHandle { resource: resource.to_string(), lock_id }))
    }

    async fn release_lock(&self, handle: &LockHandle) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.locks.get(&handle.resource) == Some(&handle.lock_id) {
            state.locks.remove(&handle.resource);
        }
        Ok(())
    }

    async fn renew_lock(&self, handle: &LockHandle, _ttl: std::time::Duration) -> Result<bool, StoreError> {
        let state = self.state.read();
        Ok(state.locks.get(&handle.resource) == Some(&handle.lock_id))
    }

    async fn get_execution_id_by_idempotency_key(&self, task_id: &str, key: &str) -> Result<Option<ExecutionId>, StoreError> {
        Ok(self.state.read().idempotency.get(&(task_id.to_string(), key.to_string())).copied())
    }

    async fn set_execution_id_by_idempotency_key(
        &self,
        task_id: &str,
        key: &str,
        execution_id: ExecutionId,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let map_key = (task_id.to_string(), key.to_string());
        if state.idempotency.contains_key(&map_key) {
            return Ok(false);
        }
        state.idempotency.insert(map_key, execution_id);
        Ok(true)
    }

    async fn retry_rollback(&self, execution_id: ExecutionId) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let exec = state.executions.get_mut(&execution_id).ok_or(StoreError::ExecutionNotFound(execution_id))?;
        exec.status = crate::model::ExecutionStatus::Retrying;
        exec.attempt += 1;
        exec.updated_at = Utc::now();
        Ok(())
    }

    async fn skip_step(&self, execution_id: ExecutionId, step_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.steps.insert(
            (execution_id, step_id.to_string()),
            StepResult {
                execution_id,
                step_id: step_id.to_string(),
                result: crate::model::StepState::Completed { value: serde_json::Value::Null },
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn force_fail(&self, execution_id: ExecutionId, reason: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let exec = state.executions.get_mut(&execution_id).ok_or(StoreError::ExecutionNotFound(execution_id))?;
        exec.status = crate::model::ExecutionStatus::Failed;
        exec.error = Some(crate::model::ExecutionError::new(reason));
        exec.completed_at = Some(Utc::now());
        exec.updated_at = Utc::now();
        Ok(())
    }

    async fn edit_step_result(&self, step: &StepResult) -> Result<(), StoreError> {
        self.state.write().steps.insert((step.execution_id, step.step_id.clone()), step.clone());
        Ok(())
    }

    async fn list_stuck_executions(&self, older_than: std::time::Duration) -> Result<Vec<Execution>, StoreError> {
        let threshold = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        Ok(self
            .state
            .read()
            .executions
            .values()
            .filter(|e| !e.status.is_terminal() && e.updated_at < threshold)
            .cloned()
            .collect())
    }
}

/// A single-process FIFO `Queue`. Delivered messages are not durable
/// across process restarts; that tradeoff is acceptable for the
/// reference/test backend, where `recover()` re-discovers incomplete
/// executions directly from the `Store` instead.
pub struct InMemoryQueue {
    messages: RwLock<VecDeque<QueueMessage>>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self { messages: RwLock::new(VecDeque::new()) }
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        self.messages.write().push_back(message);
        Ok(())
    }

    async fn poll(&self) -> Result<Option<Delivery>, QueueError> {
        Ok(self.messages.write().pop_front().map(|message| Delivery { message }))
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        Ok(())
    }

    async fn nack(&self, delivery: Delivery, requeue: bool) -> Result<(), QueueError> {
        if requeue {
            self.messages.write().push_back(delivery.message);
        }
        Ok(())
    }
}

/// A single-process `EventBus` backed by one `tokio::sync::broadcast`
/// channel per channel name. A lagged receiver (slow WaitManager poll
/// loop) simply falls back to its next store re-read, per §4.3.
pub struct InMemoryEventBus {
    channels: RwLock<std::collections::HashMap<String, broadcast::Sender<Event>>>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self { channels: RwLock::new(std::collections::HashMap::new()) }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Event> {
        if let Some(tx) = self.channels.read().get(channel) {
            return tx.clone();
        }
        let mut channels = self.channels.write();
        channels.entry(channel.to_string()).or_insert_with(|| broadcast::channel(256).0).clone()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, channel: &str, event: Event) -> Result<(), EventBusError> {
        // No subscribers is not an error: publish is fire-and-forget.
        let _ = self.sender_for(channel).send(event);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Event>, EventBusError> {
        Ok(self.sender_for(channel).subscribe())
    }
}

/// Convenience bundle used by tests and small embedded deployments that
/// want all three collaborators backed by the same in-memory state.
pub struct InMemoryBackend {
    pub store: Arc<InMemoryStore>,
    pub queue: Arc<InMemoryQueue>,
    pub event_bus: Arc<InMemoryEventBus>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self { store: Arc::new(InMemoryStore::new()), queue: Arc::new(InMemoryQueue::new()), event_bus: Arc::new(InMemoryEventBus::new()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionStatus, StepState};

    #[tokio::test]
    async fn save_and_get_execution_round_trips() {
        let store = InMemoryStore::new();
        let exec = Execution::new_pending("double".into(), serde_json::json!({"v": 2}), 3, None);
        store.save_execution(&exec).await.unwrap();
        let fetched = store.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(fetched.task_id, "double");
        assert_eq!(fetched.status, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn update_execution_requires_prior_save() {
        let store = InMemoryStore::new();
        let exec = Execution::new_pending("double".into(), serde_json::Value::Null, 3, None);
        assert!(matches!(store.update_execution(&exec).await, Err(StoreError::ExecutionNotFound(_))));
    }

    #[tokio::test]
    async fn claim_timer_grants_only_the_first_claimant() {
        let store = InMemoryStore::new();
        let ttl = std::time::Duration::from_millis(30_000);
        assert!(store.claim_timer("t1", "worker-a", ttl).await.unwrap());
        assert!(!store.claim_timer("t1", "worker-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn idempotency_mapping_is_compare_and_set() {
        let store = InMemoryStore::new();
        let id = uuid::Uuid::now_v7();
        assert!(store.set_execution_id_by_idempotency_key("double", "K", id).await.unwrap());
        assert!(!store.set_execution_id_by_idempotency_key("double", "K", uuid::Uuid::now_v7()).await.unwrap());
        assert_eq!(store.get_execution_id_by_idempotency_key("double", "K").await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn lock_release_is_owner_checked() {
        let store = InMemoryStore::new();
        let handle = store.acquire_lock("execution:1", std::time::Duration::from_secs(30)).await.unwrap().unwrap();
        let impostor = LockHandle { resource: handle.resource.clone(), lock_id: "not-the-owner".into() };
        store.release_lock(&impostor).await.unwrap();
        // Lock must still be held: a non-owner release is a no-op.
        assert!(store.acquire_lock("execution:1", std::time::Duration::from_secs(30)).await.unwrap().is_none());
        store.release_lock(&handle).await.unwrap();
        assert!(store.acquire_lock("execution:1", std::time::Duration::from_secs(30)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn queue_fifo_and_nack_requeue() {
        let queue = InMemoryQueue::new();
        let id = uuid::Uuid::now_v7();
        queue.enqueue(QueueMessage::execute(id)).await.unwrap();
        let delivery = queue.poll().await.unwrap().unwrap();
        assert_eq!(delivery.message.execution_id, id);
        queue.nack(delivery, true).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn event_bus_delivers_to_subscriber() {
        let bus = InMemoryEventBus::new();
        let mut rx = bus.subscribe("execution:1").await.unwrap();
        bus.publish("execution:1", Event::finished(serde_json::json!({"ok": true}))).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "finished");
    }

    #[tokio::test]
    async fn list_step_results_filters_by_execution() {
        let store = InMemoryStore::new();
        let a = uuid::Uuid::now_v7();
        let b = uuid::Uuid::now_v7();
        store
            .save_step_result(&StepResult { execution_id: a, step_id: "s1".into(), result: StepState::Completed { value: serde_json::Value::Null }, created_at: Utc::now() })
            .await
            .unwrap();
        store
            .save_step_result(&StepResult { execution_id: b, step_id: "s1".into(), result: StepState::Completed { value: serde_json::Value::Null }, created_at: Utc::now() })
            .await
            .unwrap();
        let rows = store.list_step_results(a).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].execution_id, a);
    }
}
