//! `ExecutionManager`: start executions, run attempts, retry with
//! backoff, fail, cancel, recover after a restart. See §4.7 — this is
//! the single funnel that classifies a workflow attempt's outcome and
//! writes the execution's next state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::config::DurableConfig;
use crate::context::{DurableContext, ExecOutcome, SuspendReason};
use crate::error::DurableError;
use crate::eventbus::{execution_channel, Event, EventBus};
use crate::model::{AuditKind, Execution, ExecutionError, ExecutionId, ExecutionStatus, TaskId, Timer, TimerStatus, TimerType};
use crate::queue::{Queue, QueueMessage};
use crate::reliability::execution_retry_delay;
use crate::signal::Resumer;
use crate::store::Store;

const EXECUTION_LOCK_TTL: Duration = Duration::from_secs(30);

/// How long the queue consumer backs off after an empty poll or a poll
/// error, before trying again.
const QUEUE_POLL_IDLE_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub idempotency_key: Option<String>,
    pub max_attempts: Option<u32>,
    pub timeout_ms: Option<i64>,
}

pub struct ExecutionManager {
    store: Arc<dyn Store>,
    queue: Option<Arc<dyn Queue>>,
    event_bus: Option<Arc<dyn EventBus>>,
    registry: Arc<crate::registry::TaskRegistry>,
    config: DurableConfig,
    audit: Arc<AuditLogger>,
    worker_id: String,
    queue_shutdown: watch::Sender<bool>,
}

impl ExecutionManager {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Option<Arc<dyn Queue>>,
        event_bus: Option<Arc<dyn EventBus>>,
        registry: Arc<crate::registry::TaskRegistry>,
        config: DurableConfig,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let (queue_shutdown, _) = watch::channel(false);
        Self { store, queue, event_bus, registry, config, audit, worker_id: Uuid::now_v7().to_string(), queue_shutdown }
    }

    /// `start(taskRef, input, opts)`. `taskRef` here is always a
    /// registry id — Rust closures have no ambient identity to pass
    /// inline, so the donor's "else the object" branch collapses to
    /// pre-registering the closure via `TaskRegistry::register` before
    /// calling `start`.
    pub async fn start(&self, task_id: TaskId, input: Value, opts: StartOptions) -> Result<ExecutionId, DurableError> {
        if let Some(key) = &opts.idempotency_key {
            if !self.store.capabilities().idempotency {
                return Err(DurableError::IdempotencyNotSupported);
            }
            if let Some(existing) = self.store.get_execution_id_by_idempotency_key(&task_id, key).await? {
                return Ok(existing);
            }
            let execution_id = Uuid::now_v7();
            let created = self.store.set_execution_id_by_idempotency_key(&task_id, key, execution_id).await?;
            if !created {
                return match self.store.get_execution_id_by_idempotency_key(&task_id, key).await? {
                    Some(existing) => Ok(existing),
                    None => Err(DurableError::IdempotencyLockFailed(format!("failed to set idempotency mapping for '{task_id}'/{key}"))),
                };
            }
            self.persist_and_kickoff(execution_id, task_id, input, opts).await?;
            return Ok(execution_id);
        }

        let execution_id = Uuid::now_v7();
        self.persist_and_kickoff(execution_id, task_id, input, opts).await?;
        Ok(execution_id)
    }

    async fn persist_and_kickoff(&self, execution_id: ExecutionId, task_id: TaskId, input: Value, opts: StartOptions) -> Result<(), DurableError> {
        let default_timeout_ms = self.config.execution_timeout.map(|d| d.as_millis() as i64);
        let mut execution = Execution::new_pending(task_id, input, opts.max_attempts.unwrap_or(self.config.max_attempts), opts.timeout_ms.or(default_timeout_ms));
        execution.id = execution_id;
        // Persisted before any enqueue/kickoff call, per the enqueue-before-save
        // race decision: a save failure here is fatal to the caller, and the
        // worker handling a (hypothetically already-enqueued) message would
        // otherwise find no row to act on.
        self.store.save_execution(&execution).await?;
        self.kickoff_with_failsafe(execution_id).await;
        Ok(())
    }

    async fn kickoff_with_failsafe(&self, execution_id: ExecutionId) {
        match &self.queue {
            Some(queue) => {
                let timer = Timer {
                    id: format!("kickoff:{execution_id}"),
                    timer_type: TimerType::Retry,
                    fire_at: chrono::Utc::now() + chrono::Duration::from_std(self.config.kickoff_failsafe_delay).unwrap(),
                    status: TimerStatus::Pending,
                    execution_id: Some(execution_id),
                    step_id: None,
                    task_id: None,
                    input: None,
                    schedule_id: None,
                };
                if let Err(err) = self.store.create_timer(&timer).await {
                    tracing::warn!(execution_id = %execution_id, error = %err, "failed to arm kickoff failsafe timer");
                }
                match queue.enqueue(QueueMessage::execute(execution_id)).await {
                    Ok(()) => {
                        if let Err(err) = self.store.delete_timer(&timer.id).await {
                            tracing::warn!(execution_id = %execution_id, error = %err, "failed to delete kickoff failsafe timer after successful enqueue");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(execution_id = %execution_id, error = %err, "enqueue execute failed, leaving failsafe timer for the poller");
                    }
                }
            }
            None => {
                if let Err(err) = self.process_execution(execution_id).await {
                    tracing::warn!(execution_id = %execution_id, error = %err, "inline processExecution failed during kickoff");
                }
            }
        }
    }

    /// `processExecution(id)`: load, resolve task, lock, run one attempt.
    pub async fn process_execution(&self, execution_id: ExecutionId) -> Result<(), DurableError> {
        let execution = match self.store.get_execution(execution_id).await? {
            Some(e) => e,
            None => return Ok(()),
        };
        if execution.status.is_terminal() {
            return Ok(());
        }

        let task = match self.registry.find(&execution.task_id) {
            Some(task) => task,
            None => {
                self.finalize_failed(execution, format!("task_not_registered: {}", execution.task_id)).await?;
                return Ok(());
            }
        };

        let lock_resource = format!("execution:{execution_id}");
        let mut handle = None;
        if self.store.capabilities().locks {
            handle = self.store.acquire_lock(&lock_resource, EXECUTION_LOCK_TTL).await?;
            if handle.is_none() {
                return Ok(());
            }
        }

        let result = self.run_execution_attempt(execution_id, task).await;

        if let Some(handle) = &handle {
            self.store.release_lock(handle).await?;
        }
        result
    }

    async fn is_cancelled(&self, execution_id: ExecutionId) -> Result<bool, DurableError> {
        Ok(matches!(self.store.get_execution(execution_id).await?, Some(e) if e.status == ExecutionStatus::Cancelled))
    }

    /// `runExecutionAttempt`.
    async fn run_execution_attempt(&self, execution_id: ExecutionId, task: crate::registry::TaskFn) -> Result<(), DurableError> {
        let mut execution = match self.store.get_execution(execution_id).await? {
            Some(e) => e,
            None => return Ok(()),
        };
        if execution.status.is_terminal() {
            return Ok(());
        }

        let previous_status = execution.status;
        execution.status = ExecutionStatus::Running;
        execution.updated_at = chrono::Utc::now();
        self.store.update_execution(&execution).await?;
        self.audit.record(execution_id, execution.attempt, AuditKind::ExecutionStatusChanged { from: Some(previous_status), to: ExecutionStatus::Running }).await;

        let ctx = DurableContext::new(self.store.clone(), execution_id, execution.attempt, self.config.clone());
        let input = execution.input.clone();

        let remaining = execution.timeout_ms.map(|timeout_ms| {
            let elapsed = (chrono::Utc::now() - execution.created_at).num_milliseconds().max(0);
            Duration::from_millis((timeout_ms - elapsed).max(0) as u64)
        });

        let outcome = match remaining {
            Some(budget) if budget.is_zero() => Err(ExecOutcome::StepFailed(anyhow::anyhow!("execution timed out"))),
            Some(budget) => match tokio::time::timeout(budget, task(ctx.clone(), input)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ExecOutcome::StepFailed(anyhow::anyhow!("execution timed out"))),
            },
            None => task(ctx.clone(), input).await,
        };

        match outcome {
            Ok(value) => {
                if self.is_cancelled(execution_id).await? {
                    return Ok(());
                }
                let mut execution = self.store.get_execution(execution_id).await?.ok_or(DurableError::ExecutionNotFound(execution_id))?;
                let previous_status = execution.status;
                execution.status = ExecutionStatus::Completed;
                execution.result = Some(value);
                execution.completed_at = Some(chrono::Utc::now());
                execution.updated_at = chrono::Utc::now();
                self.store.update_execution(&execution).await?;
                self.audit.record(execution_id, execution.attempt, AuditKind::ExecutionStatusChanged { from: Some(previous_status), to: ExecutionStatus::Completed }).await;
                self.publish_finished(execution_id).await;
                Ok(())
            }
            Err(ExecOutcome::Suspended(reason)) => {
                if self.is_cancelled(execution_id).await? {
                    return Ok(());
                }
                let mut execution = self.store.get_execution(execution_id).await?.ok_or(DurableError::ExecutionNotFound(execution_id))?;
                execution.status = ExecutionStatus::Sleeping;
                execution.updated_at = chrono::Utc::now();
                self.store.update_execution(&execution).await?;
                let label = match reason {
                    SuspendReason::Sleep(id) => format!("suspend:sleep:{id}"),
                    SuspendReason::Signal(id) => format!("suspend:signal:{id}"),
                };
                self.audit.record(execution_id, execution.attempt, AuditKind::Note { message: label }).await;
                Ok(())
            }
            Err(ExecOutcome::CompensationFailed(err)) => {
                // Already classified as a compensation failure (either the
                // workflow triggered rollback itself, or a retry loop below
                // surfaced one) — persist terminal state here.
                self.finalize_compensation_failed(execution_id, err.to_string()).await
            }
            Err(ExecOutcome::StepFailed(err)) => self.finalize_retry_or_fail(execution_id, ctx, err).await,
            Err(ExecOutcome::DeterminismViolation(message)) => {
                // Fatal for the attempt, never retried, per §7.
                if let Err(rollback_err) = ctx.rollback_compensations().await {
                    if let ExecOutcome::CompensationFailed(err) = rollback_err {
                        return self.finalize_compensation_failed(execution_id, err.to_string()).await;
                    }
                }
                self.finalize_failed(execution, message).await
            }
        }
    }

    async fn finalize_retry_or_fail(&self, execution_id: ExecutionId, ctx: DurableContext, err: anyhow::Error) -> Result<(), DurableError> {
        if let Err(rollback_err) = ctx.rollback_compensations().await {
            if let ExecOutcome::CompensationFailed(comp_err) = rollback_err {
                return self.finalize_compensation_failed(execution_id, comp_err.to_string()).await;
            }
        }

        if self.is_cancelled(execution_id).await? {
            return Ok(());
        }
        let mut execution = self.store.get_execution(execution_id).await?.ok_or(DurableError::ExecutionNotFound(execution_id))?;
        let message = err.to_string();

        if execution.attempt >= execution.max_attempts {
            self.finalize_failed(execution, message).await
        } else {
            let attempt = execution.attempt;
            let timer = Timer {
                id: format!("retry:{execution_id}:{attempt}"),
                timer_type: TimerType::Retry,
                fire_at: chrono::Utc::now() + chrono::Duration::from_std(execution_retry_delay(attempt)).unwrap(),
                status: TimerStatus::Pending,
                execution_id: Some(execution_id),
                step_id: None,
                task_id: None,
                input: None,
                schedule_id: None,
            };
            self.store.create_timer(&timer).await?;
            let previous_status = execution.status;
            execution.attempt += 1;
            execution.status = ExecutionStatus::Retrying;
            execution.updated_at = chrono::Utc::now();
            self.store.update_execution(&execution).await?;
            self.audit.record(execution_id, attempt, AuditKind::ExecutionStatusChanged { from: Some(previous_status), to: ExecutionStatus::Retrying }).await;
            Ok(())
        }
    }

    async fn finalize_failed(&self, mut execution: Execution, message: String) -> Result<(), DurableError> {
        let previous_status = execution.status;
        execution.status = ExecutionStatus::Failed;
        execution.error = Some(ExecutionError::new(message));
        execution.completed_at = Some(chrono::Utc::now());
        execution.updated_at = chrono::Utc::now();
        let execution_id = execution.id;
        let attempt = execution.attempt;
        self.store.update_execution(&execution).await?;
        self.audit.record(execution_id, attempt, AuditKind::ExecutionStatusChanged { from: Some(previous_status), to: ExecutionStatus::Failed }).await;
        self.publish_finished(execution_id).await;
        Ok(())
    }

    async fn finalize_compensation_failed(&self, execution_id: ExecutionId, message: String) -> Result<(), DurableError> {
        let mut execution = self.store.get_execution(execution_id).await?.ok_or(DurableError::ExecutionNotFound(execution_id))?;
        let previous_status = execution.status;
        execution.status = ExecutionStatus::CompensationFailed;
        execution.error = Some(ExecutionError::new(message));
        execution.completed_at = Some(chrono::Utc::now());
        execution.updated_at = chrono::Utc::now();
        let attempt = execution.attempt;
        self.store.update_execution(&execution).await?;
        self.audit.record(execution_id, attempt, AuditKind::ExecutionStatusChanged { from: Some(previous_status), to: ExecutionStatus::CompensationFailed }).await;
        self.publish_finished(execution_id).await;
        Ok(())
    }

    async fn publish_finished(&self, execution_id: ExecutionId) {
        if let Some(bus) = &self.event_bus {
            if let Err(err) = bus.publish(&execution_channel(execution_id), Event::finished(Value::Null)).await {
                tracing::warn!(execution_id = %execution_id, error = %err, "failed to publish finished event");
            }
        }
    }

    /// `cancel(id, reason?)`. No-op if missing or already terminal.
    pub async fn cancel(&self, execution_id: ExecutionId, reason: Option<String>) -> Result<(), DurableError> {
        let mut execution = match self.store.get_execution(execution_id).await? {
            Some(e) => e,
            None => return Ok(()),
        };
        if execution.status.is_terminal() {
            return Ok(());
        }
        let previous_status = execution.status;
        let now = chrono::Utc::now();
        execution.status = ExecutionStatus::Cancelled;
        if execution.cancel_requested_at.is_none() {
            execution.cancel_requested_at = Some(now);
        }
        execution.cancelled_at = Some(now);
        execution.completed_at = Some(now);
        execution.error = Some(ExecutionError::new(reason.unwrap_or_else(|| "Execution cancelled".to_string())));
        execution.updated_at = now;
        self.store.update_execution(&execution).await?;
        self.audit.record(execution_id, execution.attempt, AuditKind::ExecutionStatusChanged { from: Some(previous_status), to: ExecutionStatus::Cancelled }).await;
        self.publish_finished(execution_id).await;
        Ok(())
    }

    /// Dispatches a resume: enqueue in queue mode, call inline in
    /// embedded mode. Shared by signal delivery, the poller, and boot
    /// recovery.
    pub async fn dispatch_resume(&self, execution_id: ExecutionId) {
        match &self.queue {
            Some(queue) => {
                if let Err(err) = queue.enqueue(QueueMessage::resume(execution_id)).await {
                    tracing::warn!(execution_id = %execution_id, error = %err, "failed to enqueue resume message");
                }
            }
            None => {
                if let Err(err) = self.process_execution(execution_id).await {
                    tracing::warn!(execution_id = %execution_id, error = %err, "inline processExecution failed during resume");
                }
            }
        }
    }

    /// `recover()`: on worker boot, nudge every incomplete execution.
    pub async fn recover(&self) -> Result<(), DurableError> {
        let incomplete = self.store.list_incomplete_executions().await?;
        for execution in incomplete {
            self.dispatch_resume(execution.id).await;
        }
        Ok(())
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Drains `execute`/`resume` messages in queue mode: without this
    /// loop running, "queue mode" only makes progress via the kickoff
    /// failsafe timer and boot-time `recover()`. No-op (returns `None`)
    /// when no queue is configured.
    pub fn spawn_queue_consumer(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let queue = self.queue.clone()?;
        let mut shutdown_rx = self.queue_shutdown.subscribe();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    delivery = queue.poll() => {
                        match delivery {
                            Ok(Some(delivery)) => {
                                let execution_id = delivery.message.execution_id;
                                match self.process_execution(execution_id).await {
                                    Ok(()) => {
                                        if let Err(err) = queue.ack(&delivery).await {
                                            tracing::warn!(execution_id = %execution_id, error = %err, "failed to ack queue delivery");
                                        }
                                    }
                                    Err(err) => {
                                        tracing::warn!(execution_id = %execution_id, error = %err, "processExecution failed while draining the queue");
                                        if let Err(err) = queue.nack(delivery, true).await {
                                            tracing::warn!(execution_id = %execution_id, error = %err, "failed to nack queue delivery");
                                        }
                                    }
                                }
                            }
                            Ok(None) => tokio::time::sleep(QUEUE_POLL_IDLE_DELAY).await,
                            Err(err) => {
                                tracing::warn!(error = %err, "queue poll failed");
                                tokio::time::sleep(QUEUE_POLL_IDLE_DELAY).await;
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        }))
    }

    pub fn stop_queue_consumer(&self) {
        let _ = self.queue_shutdown.send(true);
    }
}

#[async_trait]
impl Resumer for ExecutionManager {
    async fn resume(&self, execution_id: ExecutionId) {
        self.dispatch_resume(execution_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryEventBus, InMemoryQueue, InMemoryStore};
    use crate::registry::TaskRegistry;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry_with(task_id: &str, task: crate::registry::TaskFn) -> Arc<TaskRegistry> {
        let mut registry = TaskRegistry::new();
        registry.register(task_id, task);
        Arc::new(registry)
    }

    #[tokio::test]
    async fn s1_happy_path_step_caching_runs_once_and_completes() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let task: crate::registry::TaskFn = Arc::new(move |ctx, input| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                let v = input.get("v").and_then(Value::as_i64).unwrap_or(0);
                let doubled: i64 = ctx
                    .step("double", move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(v * 2)
                        }
                    })
                    .await?;
                Ok(json!({ "v": doubled }))
            })
        });
        let registry = registry_with("double", task);
        let audit = Arc::new(AuditLogger::new(store.clone(), &DurableConfig::default()));
        let manager = ExecutionManager::new(store.clone(), None, None, registry, DurableConfig::default(), audit);

        let execution_id = manager.start("double".into(), json!({"v": 4}), StartOptions::default()).await.unwrap();
        let execution = store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.result, Some(json!({"v": 8})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn s2_sleep_suspends_the_execution_without_completing() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let task: crate::registry::TaskFn = Arc::new(|ctx, _input| {
            Box::pin(async move {
                ctx.sleep(60_000, None).await?;
                Ok(Value::Null)
            })
        });
        let registry = registry_with("napper", task);
        let audit = Arc::new(AuditLogger::new(store.clone(), &DurableConfig::default()));
        let manager = ExecutionManager::new(store.clone(), None, None, registry, DurableConfig::default(), audit);

        let execution_id = manager.start("napper".into(), Value::Null, StartOptions::default()).await.unwrap();
        let execution = store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Sleeping);
    }

    #[tokio::test]
    async fn s3_retry_exponential_backoff_then_fails_preserving_message() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let task: crate::registry::TaskFn = Arc::new(|_ctx, _input| Box::pin(async move { Err(anyhow::anyhow!("x")) }));
        let registry = registry_with("always_fails", task);
        let audit = Arc::new(AuditLogger::new(store.clone(), &DurableConfig::default()));
        let config = DurableConfig::default().with_max_attempts(3);
        let manager = ExecutionManager::new(store.clone(), None, None, registry, config, audit);

        let execution_id = manager.start("always_fails".into(), Value::Null, StartOptions::default()).await.unwrap();
        let execution = store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Retrying);
        assert_eq!(execution.attempt, 2);

        manager.process_execution(execution_id).await.unwrap();
        let execution = store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Retrying);
        assert_eq!(execution.attempt, 3);

        manager.process_execution(execution_id).await.unwrap();
        let execution = store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error.unwrap().message, "x");
    }

    #[tokio::test]
    async fn task_not_registered_fails_immediately() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let registry = Arc::new(TaskRegistry::new());
        let audit = Arc::new(AuditLogger::new(store.clone(), &DurableConfig::default()));
        let manager = ExecutionManager::new(store.clone(), None, None, registry, DurableConfig::default(), audit);

        let execution_id = manager.start("missing".into(), Value::Null, StartOptions::default()).await.unwrap();
        let execution = store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.unwrap().message.contains("task_not_registered"));
    }

    #[tokio::test]
    async fn s5_idempotent_start_returns_the_same_execution_id() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let task: crate::registry::TaskFn = Arc::new(|_ctx, _input| Box::pin(async move { Ok(Value::Null) }));
        let registry = registry_with("noop", task);
        let audit = Arc::new(AuditLogger::new(store.clone(), &DurableConfig::default()));
        let manager = ExecutionManager::new(store.clone(), None, None, registry, DurableConfig::default(), audit);

        let opts = StartOptions { idempotency_key: Some("key-1".into()), ..Default::default() };
        let first = manager.start("noop".into(), Value::Null, opts.clone()).await.unwrap();
        let second = manager.start("noop".into(), Value::Null, opts).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn s6_cancel_wins_over_a_racing_completion() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let task: crate::registry::TaskFn = Arc::new(|_ctx, _input| Box::pin(async move { Ok(json!("done")) }));
        let registry = registry_with("quick", task);
        let audit = Arc::new(AuditLogger::new(store.clone(), &DurableConfig::default()));
        let event_bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let manager = ExecutionManager::new(store.clone(), None, Some(event_bus), registry, DurableConfig::default(), audit);

        let mut execution = Execution::new_pending("quick".into(), Value::Null, 3, None);
        store.save_execution(&execution).await.unwrap();
        manager.cancel(execution.id, Some("raced".into())).await.unwrap();
        execution = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);

        manager.process_execution(execution.id).await.unwrap();
        let execution = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled, "cancellation must remain terminal");
    }

    #[tokio::test]
    async fn queue_mode_kickoff_enqueues_and_clears_the_failsafe_timer() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
        let task: crate::registry::TaskFn = Arc::new(|_ctx, _input| Box::pin(async move { Ok(Value::Null) }));
        let registry = registry_with("noop", task);
        let audit = Arc::new(AuditLogger::new(store.clone(), &DurableConfig::default()));
        let manager = ExecutionManager::new(store.clone(), Some(queue.clone()), None, registry, DurableConfig::default(), audit);

        let execution_id = manager.start("noop".into(), Value::Null, StartOptions::default()).await.unwrap();
        let timers = store.get_ready_timers(chrono::Utc::now() + chrono::Duration::minutes(1)).await.unwrap();
        assert!(timers.iter().all(|t| t.id != format!("kickoff:{execution_id}")), "failsafe timer must be cleared on successful enqueue");

        let delivery = queue.poll().await.unwrap().unwrap();
        assert_eq!(delivery.message.execution_id, execution_id);
    }

    #[tokio::test]
    async fn queue_consumer_drains_enqueued_executions_to_completion() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
        let task: crate::registry::TaskFn = Arc::new(|_ctx, _input| Box::pin(async move { Ok(json!("done")) }));
        let registry = registry_with("noop", task);
        let audit = Arc::new(AuditLogger::new(store.clone(), &DurableConfig::default()));
        let manager = Arc::new(ExecutionManager::new(store.clone(), Some(queue.clone()), None, registry, DurableConfig::default(), audit));

        let consumer = manager.clone().spawn_queue_consumer().expect("queue is configured");
        let execution_id = manager.start("noop".into(), Value::Null, StartOptions::default()).await.unwrap();

        let mut execution = store.get_execution(execution_id).await.unwrap().unwrap();
        for _ in 0..100 {
            if execution.status == ExecutionStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            execution = store.get_execution(execution_id).await.unwrap().unwrap();
        }
        assert_eq!(execution.status, ExecutionStatus::Completed);

        manager.stop_queue_consumer();
        let _ = consumer.await;
    }

    #[tokio::test]
    async fn recover_nudges_every_incomplete_execution() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
        let registry = Arc::new(TaskRegistry::new());
        let audit = Arc::new(AuditLogger::new(store.clone(), &DurableConfig::default()));
        let manager = ExecutionManager::new(store.clone(), Some(queue.clone()), None, registry, DurableConfig::default(), audit);

        let execution = Execution::new_pending("whatever".into(), Value::Null, 3, None);
        store.save_execution(&execution).await.unwrap();

        manager.recover().await.unwrap();
        let delivery = queue.poll().await.unwrap().unwrap();
        assert_eq!(delivery.message.execution_id, execution.id);
    }
}
