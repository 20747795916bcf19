//! `DurableService`: the thin façade wiring Store/Queue/EventBus with
//! every manager. See §4.9. Construct with [`DurableServiceBuilder`],
//! register tasks, then call [`DurableService::start_polling`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::audit::AuditLogger;
use crate::config::DurableConfig;
use crate::error::DurableError;
use crate::eventbus::EventBus;
use crate::execution::{ExecutionManager, StartOptions};
use crate::model::{ExecutionId, Schedule, ScheduleId, TaskId};
use crate::polling::PollingManager;
use crate::queue::Queue;
use crate::registry::{TaskFn, TaskRegistry};
use crate::schedule::{ScheduleManager, ScheduleSpec};
use crate::signal::SignalHandler;
use crate::store::Store;
use crate::wait::WaitManager;

pub struct DurableServiceBuilder {
    store: Arc<dyn Store>,
    queue: Option<Arc<dyn Queue>>,
    event_bus: Option<Arc<dyn EventBus>>,
    config: DurableConfig,
    registry: TaskRegistry,
}

impl DurableServiceBuilder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, queue: None, event_bus: None, config: DurableConfig::default(), registry: TaskRegistry::new() }
    }

    pub fn with_queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_config(mut self, config: DurableConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register(mut self, task_id: impl Into<TaskId>, task: TaskFn) -> Self {
        self.registry.register(task_id, task);
        self
    }

    pub async fn build(self) -> Result<DurableService, DurableError> {
        self.store.init().await?;
        if let Some(queue) = &self.queue {
            queue.init().await?;
        }
        if let Some(bus) = &self.event_bus {
            bus.init().await?;
        }

        let audit = Arc::new(AuditLogger::new(self.store.clone(), &self.config));
        let registry = Arc::new(self.registry);
        let execution_manager = Arc::new(ExecutionManager::new(
            self.store.clone(),
            self.queue.clone(),
            self.event_bus.clone(),
            registry,
            self.config.clone(),
            audit.clone(),
        ));
        let schedule_manager = Arc::new(ScheduleManager::new(self.store.clone()));
        let signal_handler = SignalHandler::new(self.store.clone(), audit.clone());
        let wait_manager = WaitManager::new(self.store.clone(), self.event_bus.clone());
        let polling_manager = Arc::new(PollingManager::new(
            self.store.clone(),
            execution_manager.clone(),
            schedule_manager.clone(),
            audit,
            self.config.clone(),
        ));

        Ok(DurableService {
            store: self.store,
            queue: self.queue,
            event_bus: self.event_bus,
            execution_manager,
            schedule_manager,
            signal_handler,
            wait_manager,
            polling_manager,
            polling_handle: parking_lot::Mutex::new(None),
            consumer_handle: parking_lot::Mutex::new(None),
        })
    }
}

pub struct DurableService {
    store: Arc<dyn Store>,
    queue: Option<Arc<dyn Queue>>,
    event_bus: Option<Arc<dyn EventBus>>,
    execution_manager: Arc<ExecutionManager>,
    schedule_manager: Arc<ScheduleManager>,
    signal_handler: SignalHandler,
    wait_manager: WaitManager,
    polling_manager: Arc<PollingManager>,
    polling_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    consumer_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl DurableService {
    pub fn builder(store: Arc<dyn Store>) -> DurableServiceBuilder {
        DurableServiceBuilder::new(store)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // ------------------------------------------------------------- start
    pub async fn start(&self, task_id: impl Into<TaskId>, input: Value, opts: StartOptions) -> Result<ExecutionId, DurableError> {
        self.execution_manager.start(task_id.into(), input, opts).await
    }

    /// `startAndWait`: start then block until terminal, honoring an
    /// optional client-side wait timeout.
    pub async fn start_and_wait(&self, task_id: impl Into<TaskId>, input: Value, opts: StartOptions, wait_timeout: Option<Duration>) -> Result<Value, DurableError> {
        let execution_id = self.start(task_id, input, opts).await?;
        self.wait(execution_id, wait_timeout).await
    }

    /// `execute`: start with no idempotency key and wait for the result.
    pub async fn execute(&self, task_id: impl Into<TaskId>, input: Value) -> Result<Value, DurableError> {
        self.start_and_wait(task_id, input, StartOptions::default(), None).await
    }

    /// `executeStrict`: like `execute`, but with a wait timeout that
    /// turns a slow execution into an explicit `wait-timeout` error
    /// instead of blocking indefinitely.
    pub async fn execute_strict(&self, task_id: impl Into<TaskId>, input: Value, wait_timeout: Duration) -> Result<Value, DurableError> {
        self.start_and_wait(task_id, input, StartOptions::default(), Some(wait_timeout)).await
    }

    pub async fn wait(&self, execution_id: ExecutionId, wait_timeout: Option<Duration>) -> Result<Value, DurableError> {
        self.wait_manager.wait_for_result(execution_id, wait_timeout).await
    }

    pub async fn signal(&self, execution_id: ExecutionId, signal_id: &str, payload: Value) -> Result<(), DurableError> {
        self.signal_handler.signal(execution_id, signal_id, payload, self.execution_manager.as_ref()).await
    }

    pub async fn cancel(&self, execution_id: ExecutionId, reason: Option<String>) -> Result<(), DurableError> {
        self.execution_manager.cancel(execution_id, reason).await
    }

    // ---------------------------------------------------------- schedules
    pub async fn schedule(&self, task_id: impl Into<TaskId>, input: Option<Value>, spec: ScheduleSpec) -> Result<ScheduleId, DurableError> {
        self.schedule_manager.schedule(task_id.into(), input, spec).await
    }

    pub async fn pause_schedule(&self, id: &str) -> Result<(), DurableError> {
        self.schedule_manager.pause(id).await
    }

    pub async fn resume_schedule(&self, id: &str) -> Result<(), DurableError> {
        self.schedule_manager.resume(id).await
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>, DurableError> {
        self.schedule_manager.get(id).await
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>, DurableError> {
        self.schedule_manager.list().await
    }

    pub async fn update_schedule(&self, id: &str, input: Option<Value>) -> Result<(), DurableError> {
        self.schedule_manager.update(id, input).await
    }

    pub async fn remove_schedule(&self, id: &str) -> Result<(), DurableError> {
        self.schedule_manager.remove(id).await
    }

    // ------------------------------------------------------------ recover
    pub async fn recover(&self) -> Result<(), DurableError> {
        self.execution_manager.recover().await
    }

    // ----------------------------------------------------- poller control
    /// Idempotent: calling `start_polling` twice without an intervening
    /// `stop_polling` is a no-op. Also starts the queue consumer loop
    /// when a `Queue` is configured, so queue-mode executions are
    /// actually drained rather than relying solely on the kickoff
    /// failsafe timer and boot-time `recover()`.
    pub fn start_polling(&self) {
        let mut handle = self.polling_handle.lock();
        if handle.is_none() {
            *handle = Some(self.polling_manager.clone().spawn());
        }
        drop(handle);

        let mut consumer = self.consumer_handle.lock();
        if consumer.is_none() {
            *consumer = self.execution_manager.clone().spawn_queue_consumer();
        }
    }

    pub async fn stop_polling(&self) {
        self.polling_manager.stop();
        let handle = self.polling_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.execution_manager.stop_queue_consumer();
        let consumer = self.consumer_handle.lock().take();
        if let Some(consumer) = consumer {
            let _ = consumer.await;
        }
    }

    /// Disposes the Store/Queue/EventBus, if they implement `dispose()`.
    pub async fn dispose(&self) -> Result<(), DurableError> {
        self.stop_polling().await;
        self.store.dispose().await?;
        if let Some(queue) = &self.queue {
            queue.dispose().await?;
        }
        if let Some(bus) = &self.event_bus {
            bus.dispose().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use serde_json::json;

    fn double_task() -> TaskFn {
        Arc::new(|ctx, input| {
            Box::pin(async move {
                let v = input.get("v").and_then(Value::as_i64).unwrap_or(0);
                let doubled: i64 = ctx.step("double", move || async move { Ok(v * 2) }).await?;
                Ok(json!({ "v": doubled }))
            })
        })
    }

    #[tokio::test]
    async fn execute_runs_a_registered_task_to_completion() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let service = DurableService::builder(store).register("double", double_task()).build().await.unwrap();
        let result = service.execute("double", json!({"v": 3})).await.unwrap();
        assert_eq!(result, json!({"v": 6}));
    }

    #[tokio::test]
    async fn signal_delivers_to_a_waiting_execution() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let task: TaskFn = Arc::new(|ctx, _input| {
            Box::pin(async move {
                let payload = ctx.wait_for_signal("go", None, None).await?;
                Ok(payload)
            })
        });
        let service = DurableService::builder(store).register("waiter", task).build().await.unwrap();
        let execution_id = service.start("waiter", Value::Null, StartOptions::default()).await.unwrap();

        service.signal(execution_id, "go", json!("payload")).await.unwrap();
        let result = service.wait(execution_id, Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(result, json!("payload"));
    }

    #[tokio::test]
    async fn start_polling_is_idempotent_and_stop_polling_joins_the_task() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let service = DurableService::builder(store).build().await.unwrap();
        service.start_polling();
        service.start_polling();
        service.stop_polling().await;
    }

    #[tokio::test]
    async fn recover_resumes_executions_left_incomplete_by_a_restart() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let service = DurableService::builder(store.clone()).register("double", double_task()).build().await.unwrap();
        let execution_id = service.start("double", json!({"v": 5}), StartOptions::default()).await.unwrap();
        let mut execution = store.get_execution(execution_id).await.unwrap().unwrap();
        execution.status = crate::model::ExecutionStatus::Running;
        store.update_execution(&execution).await.unwrap();

        service.recover().await.unwrap();
        let execution = store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, crate::model::ExecutionStatus::Completed);
    }
}
