//! `DurableContext`: the replay engine. Lives for one attempt and is
//! passed by value into the workflow closure (see §9's redesign note —
//! no async-local/thread-local accessor, the context is an explicit
//! parameter). See §4.6.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::{DeterminismPolicy, DurableConfig};
use crate::model::{is_reserved_step_id, AuditEntry, AuditKind, Execution, ExecutionId, StepResult, StepState, Timer, TimerStatus, TimerType};
use crate::reliability::step_retry_delay;
use crate::store::Store;

/// The control-flow outcome of a workflow attempt. Replaces the donor
/// model's thrown `SuspensionSignal` with a typed return value, per §9:
/// a workflow is `async fn(DurableContext, Value) -> Result<Value,
/// ExecOutcome>`, never a trait object driven by callbacks.
#[derive(Debug)]
pub enum ExecOutcome {
    /// Control handed back to the runner; the attempt made progress
    /// (a timer/slot was persisted) but must wait before continuing.
    Suspended(SuspendReason),
    /// A registered compensation failed while unwinding; terminal.
    CompensationFailed(anyhow::Error),
    /// A step (or the workflow body itself) failed without suspending.
    StepFailed(anyhow::Error),
    /// The workflow attempted an operation that violates determinism
    /// (duplicate step id, reserved prefix, disallowed implicit id).
    DeterminismViolation(String),
}

#[derive(Debug, Clone)]
pub enum SuspendReason {
    Sleep(String),
    Signal(String),
}

#[derive(Debug, Clone)]
pub struct StepOptions {
    pub timeout: Option<Duration>,
    pub retries: u32,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self { timeout: None, retries: 0 }
    }
}

type CompensationThunk = Arc<dyn Fn() -> BoxFuture<'static, Result<(), anyhow::Error>> + Send + Sync>;

struct Compensation {
    step_id: String,
    run: CompensationThunk,
}

struct ContextState {
    seen_step_ids: HashSet<String>,
    sleep_counter: u32,
    emit_counter: u32,
    signal_counters: HashMap<String, u32>,
    compensations: Vec<Compensation>,
}

impl ContextState {
    fn new() -> Self {
        Self {
            seen_step_ids: HashSet::new(),
            sleep_counter: 0,
            emit_counter: 0,
            signal_counters: HashMap::new(),
            compensations: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct DurableContext {
    store: Arc<dyn Store>,
    execution_id: ExecutionId,
    attempt: u32,
    config: DurableConfig,
    state: Arc<Mutex<ContextState>>,
}

impl DurableContext {
    pub fn new(store: Arc<dyn Store>, execution_id: ExecutionId, attempt: u32, config: DurableConfig) -> Self {
        Self { store, execution_id, attempt, config, state: Arc::new(Mutex::new(ContextState::new())) }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    async fn audit(&self, kind: AuditKind) {
        if !self.config.audit_enabled {
            return;
        }
        let entry = AuditEntry::new(self.execution_id, self.attempt, kind);
        if let Err(err) = self.store.append_audit_entry(&entry).await {
            tracing::warn!(execution_id = %self.execution_id, error = %err, "audit sink failed, dropping entry");
        }
    }

    /// Registers `step_id` as seen in this attempt; fails the attempt on
    /// a duplicate or on a reserved prefix used by user code. `implicit`
    /// distinguishes counter-assigned ids (subject to
    /// `determinism_policy`) from explicit user-supplied ids (always
    /// rejected if reserved).
    fn check_determinism(&self, step_id: &str, implicit: bool, allow_reserved: bool) -> Result<(), ExecOutcome> {
        if !allow_reserved && is_reserved_step_id(step_id) {
            return Err(ExecOutcome::DeterminismViolation(format!(
                "step id '{step_id}' uses a reserved prefix"
            )));
        }
        if implicit {
            match self.config.determinism_policy {
                DeterminismPolicy::Error => {
                    return Err(ExecOutcome::DeterminismViolation(format!(
                        "implicit internal step id '{step_id}' is disallowed by the error policy"
                    )))
                }
                DeterminismPolicy::Warn => {
                    tracing::warn!(step_id, "implicit internal step id used without explicit stepId");
                }
                DeterminismPolicy::Allow => {}
            }
        }
        let mut state = self.state.lock();
        if !state.seen_step_ids.insert(step_id.to_string()) {
            return Err(ExecOutcome::DeterminismViolation(format!(
                "duplicate step id '{step_id}' within one attempt"
            )));
        }
        Ok(())
    }

    fn next_sleep_step_id(&self) -> (String, bool) {
        let mut state = self.state.lock();
        let n = state.sleep_counter;
        state.sleep_counter += 1;
        (format!("__sleep:{n}"), true)
    }

    fn next_emit_step_id(&self) -> (String, bool) {
        let mut state = self.state.lock();
        let n = state.emit_counter;
        state.emit_counter += 1;
        (format!("__emit:{n}"), true)
    }

    fn next_signal_step_id(&self, signal_id: &str) -> (String, bool) {
        let mut state = self.state.lock();
        let n = state.signal_counters.entry(signal_id.to_string()).or_insert(0);
        let id = if *n == 0 { format!("__signal:{signal_id}") } else { format!("__signal:{signal_id}:{n}") };
        *n += 1;
        (id, true)
    }

    // ---------------------------------------------------------------- step
    /// A durable step without a compensation. See §4.6 "Step semantics".
    pub async fn step<T, Fut, F>(&self, step_id: &str, up: F) -> Result<T, ExecOutcome>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
    {
        self.step_with_options(step_id, StepOptions::default(), up).await
    }

    pub async fn step_with_options<T, Fut, F>(&self, step_id: &str, options: StepOptions, up: F) -> Result<T, ExecOutcome>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
    {
        self.check_determinism(step_id, false, false)?;
        let value = self
            .run_cacheable(step_id, &options, move || {
                let fut = up();
                Box::pin(async move {
                    let out = fut.await?;
                    serde_json::to_value(out).map_err(anyhow::Error::from)
                }) as BoxFuture<'static, Result<Value, anyhow::Error>>
            })
            .await?;
        serde_json::from_value(value).map_err(|err| ExecOutcome::StepFailed(err.into()))
    }

    /// A durable step with a compensation, pushed onto the rollback
    /// stack on success. Compensations run LIFO, each as its own
    /// durable step `rollback:<stepId>`, on workflow failure.
    pub async fn step_with_compensation<T, Fut, F, DownFut, D>(
        &self,
        step_id: &str,
        options: StepOptions,
        up: F,
        down: D,
    ) -> Result<T, ExecOutcome>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        DownFut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
        D: Fn(T) -> DownFut + Send + Sync + 'static,
    {
        let result: T = self.step_with_options(step_id, options, up).await?;
        let down = Arc::new(down);
        let value = result.clone();
        let thunk: CompensationThunk = Arc::new(move || {
            let down = down.clone();
            let value = value.clone();
            Box::pin(async move { down(value).await })
        });
        self.state.lock().compensations.push(Compensation { step_id: step_id.to_string(), run: thunk });
        Ok(result)
    }

    /// Shared caching/retry core used by `step`/`step_with_options` and
    /// by rollback's internal `rollback:<stepId>` steps.
    async fn run_cacheable(
        &self,
        step_id: &str,
        options: &StepOptions,
        up: impl Fn() -> BoxFuture<'static, Result<Value, anyhow::Error>> + Send + Sync,
    ) -> Result<Value, ExecOutcome> {
        if let Some(cached) = self
            .store
            .get_step_result(self.execution_id, step_id)
            .await
            .map_err(|e| ExecOutcome::StepFailed(e.into()))?
        {
            return match cached.result {
                StepState::Completed { value } => Ok(value),
                other => Err(ExecOutcome::DeterminismViolation(format!(
                    "step '{step_id}' cached with unexpected state {other:?}"
                ))),
            };
        }

        let mut last_err = None;
        for attempt in 0..=options.retries {
            let attempt_fut = up();
            let outcome = match options.timeout {
                Some(timeout) => match tokio::time::timeout(timeout, attempt_fut).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("Step {step_id} timed out")),
                },
                None => attempt_fut.await,
            };
            match outcome {
                Ok(value) => {
                    let step = StepResult {
                        execution_id: self.execution_id,
                        step_id: step_id.to_string(),
                        result: StepState::Completed { value: value.clone() },
                        created_at: Utc::now(),
                    };
                    self.store.save_step_result(&step).await.map_err(|e| ExecOutcome::StepFailed(e.into()))?;
                    self.audit(AuditKind::StepCompleted { step_id: step_id.to_string() }).await;
                    return Ok(value);
                }
                Err(err) => {
                    last_err = Some(err);
                    if attempt < options.retries {
                        tokio::time::sleep(step_retry_delay(attempt)).await;
                    }
                }
            }
        }
        Err(ExecOutcome::StepFailed(last_err.unwrap_or_else(|| anyhow::anyhow!("step '{step_id}' failed"))))
    }

    // --------------------------------------------------------------- sleep
    pub async fn sleep(&self, ms: i64, step_id: Option<&str>) -> Result<(), ExecOutcome> {
        let (id, implicit) = match step_id {
            Some(id) => (id.to_string(), false),
            None => self.next_sleep_step_id(),
        };
        self.check_determinism(&id, implicit, implicit)?;

        if let Some(cached) = self.store.get_step_result(self.execution_id, &id).await.map_err(|e| ExecOutcome::StepFailed(e.into()))? {
            return match cached.result {
                StepState::Completed { .. } => Ok(()),
                StepState::Scheduled => Err(ExecOutcome::Suspended(SuspendReason::Sleep(id))),
                other => Err(ExecOutcome::DeterminismViolation(format!("sleep '{id}' cached with unexpected state {other:?}"))),
            };
        }

        let fire_at = Utc::now() + chrono::Duration::milliseconds(ms);
        let timer = Timer {
            id: format!("sleep:{}:{}", self.execution_id, id),
            timer_type: TimerType::Sleep,
            fire_at,
            status: TimerStatus::Pending,
            execution_id: Some(self.execution_id),
            step_id: Some(id.clone()),
            task_id: None,
            input: None,
            schedule_id: None,
        };
        self.store.create_timer(&timer).await.map_err(|e| ExecOutcome::StepFailed(e.into()))?;
        let step = StepResult { execution_id: self.execution_id, step_id: id.clone(), result: StepState::Scheduled, created_at: Utc::now() };
        self.store.save_step_result(&step).await.map_err(|e| ExecOutcome::StepFailed(e.into()))?;
        self.audit(AuditKind::SleepScheduled { step_id: id.clone(), fire_at }).await;
        Err(ExecOutcome::Suspended(SuspendReason::Sleep(id)))
    }

    // --------------------------------------------------------- waitForSignal
    /// Returns the bare payload if `timeout_ms` is `None`; otherwise
    /// returns `{"kind": "signal", "payload": ...}` or `{"kind":
    /// "timeout"}`, per §4.6 "waitForSignal semantics".
    pub async fn wait_for_signal(&self, signal_id: &str, timeout_ms: Option<i64>, step_id: Option<&str>) -> Result<Value, ExecOutcome> {
        let (id, implicit) = match step_id {
            Some(id) => (format!("__signal:{id}"), false),
            None => self.next_signal_step_id(signal_id),
        };
        self.check_determinism(&id, implicit, true)?;

        let cached = self.store.get_step_result(self.execution_id, &id).await.map_err(|e| ExecOutcome::StepFailed(e.into()))?;
        match cached {
            None => {
                let timer_id = if let Some(ms) = timeout_ms {
                    let timer = Timer {
                        id: format!("signal_timeout:{}:{}", self.execution_id, id),
                        timer_type: TimerType::SignalTimeout,
                        fire_at: Utc::now() + chrono::Duration::milliseconds(ms),
                        status: TimerStatus::Pending,
                        execution_id: Some(self.execution_id),
                        step_id: Some(id.clone()),
                        task_id: None,
                        input: None,
                        schedule_id: None,
                    };
                    self.store.create_timer(&timer).await.map_err(|e| ExecOutcome::StepFailed(e.into()))?;
                    Some(timer.id)
                } else {
                    None
                };
                let step = StepResult {
                    execution_id: self.execution_id,
                    step_id: id.clone(),
                    result: StepState::Waiting { signal_id: signal_id.to_string(), timer_id, timeout_at_ms: timeout_ms },
                    created_at: Utc::now(),
                };
                self.store.save_step_result(&step).await.map_err(|e| ExecOutcome::StepFailed(e.into()))?;
                self.audit(AuditKind::SignalWaiting { step_id: id.clone(), signal_id: signal_id.to_string() }).await;
                Err(ExecOutcome::Suspended(SuspendReason::Signal(id)))
            }
            Some(row) => match row.result {
                StepState::Waiting { timer_id, .. } => {
                    if timeout_ms.is_some() && timer_id.is_none() {
                        // Replaying with a timeout that was not armed yet (e.g.
                        // options changed between attempts); arm it now.
                        let ms = timeout_ms.unwrap();
                        let timer = Timer {
                            id: format!("signal_timeout:{}:{}", self.execution_id, id),
                            timer_type: TimerType::SignalTimeout,
                            fire_at: Utc::now() + chrono::Duration::milliseconds(ms),
                            status: TimerStatus::Pending,
                            execution_id: Some(self.execution_id),
                            step_id: Some(id.clone()),
                            task_id: None,
                            input: None,
                            schedule_id: None,
                        };
                        self.store.create_timer(&timer).await.map_err(|e| ExecOutcome::StepFailed(e.into()))?;
                        let step = StepResult {
                            execution_id: self.execution_id,
                            step_id: id.clone(),
                            result: StepState::Waiting { signal_id: signal_id.to_string(), timer_id: Some(timer.id), timeout_at_ms: timeout_ms },
                            created_at: Utc::now(),
                        };
                        self.store.save_step_result(&step).await.map_err(|e| ExecOutcome::StepFailed(e.into()))?;
                    }
                    Err(ExecOutcome::Suspended(SuspendReason::Signal(id)))
                }
                StepState::SignalCompleted { payload } => {
                    if timeout_ms.is_some() {
                        Ok(serde_json::json!({ "kind": "signal", "payload": payload }))
                    } else {
                        Ok(payload)
                    }
                }
                StepState::TimedOut => {
                    if timeout_ms.is_none() {
                        Err(ExecOutcome::StepFailed(anyhow::anyhow!("signal-timeout: '{id}' timed out but caller did not request a timeout")))
                    } else {
                        Ok(serde_json::json!({ "kind": "timeout" }))
                    }
                }
                other => Err(ExecOutcome::DeterminismViolation(format!("signal slot '{id}' has invalid persisted state {other:?}"))),
            },
        }
    }

    // -------------------------------------------------------------- switch
    #[allow(clippy::type_complexity)]
    pub async fn switch(
        &self,
        step_id: &str,
        branches: Vec<(String, bool, Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, anyhow::Error>> + Send>)>,
        default_branch: Option<Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, anyhow::Error>> + Send>>,
    ) -> Result<Value, ExecOutcome> {
        self.check_determinism(step_id, false, false)?;
        if let Some(cached) = self.store.get_step_result(self.execution_id, step_id).await.map_err(|e| ExecOutcome::StepFailed(e.into()))? {
            return match cached.result {
                StepState::Completed { value } => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                other => Err(ExecOutcome::DeterminismViolation(format!("switch '{step_id}' cached with unexpected state {other:?}"))),
            };
        }

        let mut chosen: Option<(String, Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, anyhow::Error>> + Send>)> = None;
        for (id, matched, run) in branches {
            if matched {
                chosen = Some((id, run));
                break;
            }
        }
        let (branch_id, run) = match chosen.or_else(|| default_branch.map(|run| ("default".to_string(), run))) {
            Some(pair) => pair,
            None => return Err(ExecOutcome::StepFailed(anyhow::anyhow!("switch '{step_id}' matched no branch and has no default"))),
        };

        let result = run().await.map_err(ExecOutcome::StepFailed)?;
        let value = serde_json::json!({ "branch_id": branch_id, "result": result });
        let step = StepResult { execution_id: self.execution_id, step_id: step_id.to_string(), result: StepState::Completed { value: value.clone() }, created_at: Utc::now() };
        self.store.save_step_result(&step).await.map_err(|e| ExecOutcome::StepFailed(e.into()))?;
        self.audit(AuditKind::SwitchEvaluated { step_id: step_id.to_string(), branch_id }).await;
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    }

    // ---------------------------------------------------------------- emit
    pub async fn emit(&self, event: &str, payload: Value, step_id: Option<&str>) -> Result<(), ExecOutcome> {
        let (id, implicit) = match step_id {
            Some(id) => (id.to_string(), false),
            None => self.next_emit_step_id(),
        };
        self.check_determinism(&id, implicit, implicit)?;
        if self.store.get_step_result(self.execution_id, &id).await.map_err(|e| ExecOutcome::StepFailed(e.into()))?.is_some() {
            return Ok(());
        }
        let step = StepResult { execution_id: self.execution_id, step_id: id.clone(), result: StepState::Completed { value: payload }, created_at: Utc::now() };
        self.store.save_step_result(&step).await.map_err(|e| ExecOutcome::StepFailed(e.into()))?;
        self.audit(AuditKind::EmitPublished { step_id: id, event: event.to_string() }).await;
        Ok(())
    }

    // ---------------------------------------------------------------- note
    pub async fn note(&self, message: impl Into<String>, _meta: Option<Value>) {
        self.audit(AuditKind::Note { message: message.into() }).await;
    }

    /// Pops compensations in LIFO order, running each as its own durable
    /// `rollback:<stepId>` step. Stops and returns the first failure.
    pub(crate) async fn rollback_compensations(&self) -> Result<(), ExecOutcome> {
        let compensations: Vec<Compensation> = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.compensations)
        };
        for compensation in compensations.into_iter().rev() {
            let rollback_id = format!("rollback:{}", compensation.step_id);
            let run = compensation.run.clone();
            self.run_cacheable(&rollback_id, &StepOptions::default(), move || {
                let run = run.clone();
                Box::pin(async move {
                    run().await?;
                    Ok(Value::Null)
                })
            })
            .await
            .map_err(|outcome| match outcome {
                ExecOutcome::StepFailed(err) => ExecOutcome::CompensationFailed(err),
                other => other,
            })?;
        }
        Ok(())
    }
}

/// Helper for tests/fixtures that want a context without wiring a full
/// `DurableService`.
pub fn fresh_execution(task_id: impl Into<String>, input: Value, max_attempts: u32) -> Execution {
    Execution::new_pending(task_id.into(), input, max_attempts, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ctx_for(store: Arc<dyn Store>, execution_id: ExecutionId) -> DurableContext {
        DurableContext::new(store, execution_id, 1, DurableConfig::default())
    }

    #[tokio::test]
    async fn step_caches_and_does_not_rerun_upfn() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let execution_id = Uuid::now_v7();
        let calls = Arc::new(AtomicU32::new(0));

        let run_once = |store: Arc<dyn Store>, calls: Arc<AtomicU32>| {
            let ctx = ctx_for(store, execution_id);
            let calls = calls.clone();
            async move {
                ctx.step("double", move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<i64, anyhow::Error>(4)
                    }
                })
                .await
            }
        };

        let first: Result<i64, ExecOutcome> = run_once(store.clone(), calls.clone()).await;
        assert_eq!(first.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let second: Result<i64, ExecOutcome> = run_once(store.clone(), calls.clone()).await;
        assert_eq!(second.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "cached step must not re-invoke upFn");
    }

    #[tokio::test]
    async fn sleep_suspends_then_replays_past_completed_slot() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let execution_id = Uuid::now_v7();
        let ctx = ctx_for(store.clone(), execution_id);

        let outcome = ctx.sleep(1000, None).await;
        assert!(matches!(outcome, Err(ExecOutcome::Suspended(SuspendReason::Sleep(_)))));

        // Simulate the poller marking the sleep slot completed.
        let step = StepResult { execution_id, step_id: "__sleep:0".into(), result: StepState::Completed { value: Value::Null }, created_at: Utc::now() };
        store.save_step_result(&step).await.unwrap();

        let ctx2 = ctx_for(store, execution_id);
        assert!(ctx2.sleep(1000, None).await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_step_id_is_a_determinism_violation() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let ctx = ctx_for(store, Uuid::now_v7());
        let _: Result<i64, ExecOutcome> = ctx.step("once", || async { Ok(1) }).await;
        let second: Result<i64, ExecOutcome> = ctx.step("once", || async { Ok(2) }).await;
        assert!(matches!(second, Err(ExecOutcome::DeterminismViolation(_))));
    }

    #[tokio::test]
    async fn reserved_prefix_is_rejected_for_user_steps() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let ctx = ctx_for(store, Uuid::now_v7());
        let result: Result<i64, ExecOutcome> = ctx.step("__sneaky", || async { Ok(1) }).await;
        assert!(matches!(result, Err(ExecOutcome::DeterminismViolation(_))));
    }

    #[tokio::test]
    async fn reserved_prefix_is_rejected_for_an_explicit_sleep_step_id() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let ctx = ctx_for(store, Uuid::now_v7());
        let result = ctx.sleep(1000, Some("__sneaky")).await;
        assert!(matches!(result, Err(ExecOutcome::DeterminismViolation(_))));
    }

    #[tokio::test]
    async fn reserved_prefix_is_rejected_for_an_explicit_emit_step_id() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let ctx = ctx_for(store, Uuid::now_v7());
        let result = ctx.emit("x", Value::Null, Some("__sneaky")).await;
        assert!(matches!(result, Err(ExecOutcome::DeterminismViolation(_))));
    }

    #[tokio::test]
    async fn wait_for_signal_without_timeout_returns_bare_payload() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let execution_id = Uuid::now_v7();
        let ctx = ctx_for(store.clone(), execution_id);
        assert!(matches!(ctx.wait_for_signal("paid", None, None).await, Err(ExecOutcome::Suspended(_))));

        let step = StepResult {
            execution_id,
            step_id: "__signal:paid".into(),
            result: StepState::SignalCompleted { payload: serde_json::json!({"paidAt": 1}) },
            created_at: Utc::now(),
        };
        store.save_step_result(&step).await.unwrap();

        let ctx2 = ctx_for(store, execution_id);
        let payload = ctx2.wait_for_signal("paid", None, None).await.unwrap();
        assert_eq!(payload, serde_json::json!({"paidAt": 1}));
    }

    #[tokio::test]
    async fn wait_for_signal_with_timeout_wraps_kind() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let execution_id = Uuid::now_v7();
        let ctx = ctx_for(store.clone(), execution_id);
        assert!(matches!(ctx.wait_for_signal("paid", Some(1000), None).await, Err(ExecOutcome::Suspended(_))));

        let step = StepResult {
            execution_id,
            step_id: "__signal:paid".into(),
            result: StepState::TimedOut,
            created_at: Utc::now(),
        };
        store.save_step_result(&step).await.unwrap();

        let ctx2 = ctx_for(store, execution_id);
        let outcome = ctx2.wait_for_signal("paid", Some(1000), None).await.unwrap();
        assert_eq!(outcome, serde_json::json!({"kind": "timeout"}));
    }

    #[tokio::test]
    async fn compensations_run_lifo_as_rollback_steps() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let execution_id = Uuid::now_v7();
        let ctx = ctx_for(store.clone(), execution_id);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        let _: i64 = ctx
            .step_with_compensation(
                "reserve",
                StepOptions::default(),
                || async { Ok(1) },
                move |_v: i64| {
                    let o1 = o1.clone();
                    async move {
                        o1.lock().push("reserve");
                        Ok(())
                    }
                },
            )
            .await
            .unwrap();

        let o2 = order.clone();
        let _: i64 = ctx
            .step_with_compensation(
                "charge",
                StepOptions::default(),
                || async { Ok(2) },
                move |_v: i64| {
                    let o2 = o2.clone();
                    async move {
                        o2.lock().push("charge");
                        Ok(())
                    }
                },
            )
            .await
            .unwrap();

        ctx.rollback_compensations().await.unwrap();
        assert_eq!(*order.lock(), vec!["charge", "reserve"]);

        // Cached: a fresh context replays rollback without re-running it.
        let ctx2 = ctx_for(store, execution_id);
        assert!(ctx2
            .store
            .get_step_result(execution_id, "rollback:charge")
            .await
            .unwrap()
            .is_some());
    }
}
