//! `PollingManager`: the single background loop that advances timers —
//! sleeps, signal timeouts, execution retries, and scheduled
//! recurrences. See §4.8.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audit::AuditLogger;
use crate::config::DurableConfig;
use crate::execution::ExecutionManager;
use crate::model::{AuditKind, Execution, StepState, Timer, TimerType};
use crate::schedule::ScheduleManager;
use crate::store::Store;

pub struct PollingManager {
    store: Arc<dyn Store>,
    execution_manager: Arc<ExecutionManager>,
    schedule_manager: Arc<ScheduleManager>,
    audit: Arc<AuditLogger>,
    config: DurableConfig,
    worker_id: String,
    shutdown: watch::Sender<bool>,
}

impl PollingManager {
    pub fn new(
        store: Arc<dyn Store>,
        execution_manager: Arc<ExecutionManager>,
        schedule_manager: Arc<ScheduleManager>,
        audit: Arc<AuditLogger>,
        config: DurableConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { store, execution_manager, schedule_manager, audit, config, worker_id: uuid::Uuid::now_v7().to_string(), shutdown }
    }

    /// Spawns the tick loop as a detached task; `stop()` wakes it
    /// immediately via the shutdown watch channel.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn run(&self) {
        if !self.config.polling_enabled {
            return;
        }
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.polling_interval) => {
                    self.tick().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let timers = match self.store.get_ready_timers(chrono::Utc::now()).await {
            Ok(timers) => timers,
            Err(err) => {
                tracing::warn!(error = %err, "failed to fetch ready timers");
                return;
            }
        };
        for timer in timers {
            if self.store.capabilities().claim_timer {
                match self.store.claim_timer(&timer.id, &self.worker_id, self.config.polling_claim_ttl).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        tracing::warn!(timer_id = %timer.id, error = %err, "failed to claim timer");
                        continue;
                    }
                }
            }
            if let Err(err) = self.handle_timer(&timer).await {
                tracing::warn!(timer_id = %timer.id, error = %err, "error handling fired timer");
            }
            if let Err(err) = self.store.delete_timer(&timer.id).await {
                tracing::warn!(timer_id = %timer.id, error = %err, "failed to delete fired timer");
            }
        }
    }

    async fn handle_timer(&self, timer: &Timer) -> Result<(), crate::error::DurableError> {
        match timer.timer_type {
            TimerType::Sleep => self.handle_sleep(timer).await,
            TimerType::SignalTimeout => self.handle_signal_timeout(timer).await,
            TimerType::Retry => self.handle_retry(timer).await,
            TimerType::Scheduled => self.handle_scheduled(timer).await,
        }
    }

    async fn handle_sleep(&self, timer: &Timer) -> Result<(), crate::error::DurableError> {
        let (execution_id, step_id) = match (timer.execution_id, &timer.step_id) {
            (Some(e), Some(s)) => (e, s.clone()),
            _ => return Ok(()),
        };
        let step = crate::model::StepResult {
            execution_id,
            step_id: step_id.clone(),
            result: StepState::Completed { value: serde_json::Value::Null },
            created_at: chrono::Utc::now(),
        };
        self.store.save_step_result(&step).await?;
        let attempt = self.store.get_execution(execution_id).await?.map(|e| e.attempt).unwrap_or(0);
        self.audit.record(execution_id, attempt, AuditKind::SleepCompleted { step_id }).await;
        self.execution_manager.dispatch_resume(execution_id).await;
        Ok(())
    }

    async fn handle_signal_timeout(&self, timer: &Timer) -> Result<(), crate::error::DurableError> {
        let (execution_id, step_id) = match (timer.execution_id, &timer.step_id) {
            (Some(e), Some(s)) => (e, s.clone()),
            _ => return Ok(()),
        };
        let slot = self.store.get_step_result(execution_id, &step_id).await?;
        let signal_id = match slot {
            Some(row) => match row.result {
                StepState::Waiting { signal_id, .. } => signal_id,
                _ => return Ok(()),
            },
            None => return Ok(()),
        };
        let step = crate::model::StepResult { execution_id, step_id: step_id.clone(), result: StepState::TimedOut, created_at: chrono::Utc::now() };
        self.store.save_step_result(&step).await?;
        let attempt = self.store.get_execution(execution_id).await?.map(|e| e.attempt).unwrap_or(0);
        self.audit.record(execution_id, attempt, AuditKind::SignalTimedOut { step_id, signal_id }).await;
        self.execution_manager.dispatch_resume(execution_id).await;
        Ok(())
    }

    async fn handle_retry(&self, timer: &Timer) -> Result<(), crate::error::DurableError> {
        if let Some(execution_id) = timer.execution_id {
            self.execution_manager.dispatch_resume(execution_id).await;
        }
        Ok(())
    }

    async fn handle_scheduled(&self, timer: &Timer) -> Result<(), crate::error::DurableError> {
        let schedule_id = match &timer.schedule_id {
            Some(id) => id,
            None => return Ok(()),
        };
        let mut schedule = match self.store.get_schedule(schedule_id).await? {
            Some(s) => s,
            None => return Ok(()),
        };
        if schedule.status == crate::model::ScheduleStatus::Paused {
            return Ok(());
        }
        if schedule.next_run != Some(timer.fire_at) {
            // Stale: a newer timer for this schedule has already fired,
            // or the schedule was updated since this timer was created.
            return Ok(());
        }

        let execution = Execution::new_pending(schedule.task_id.clone(), timer.input.clone().unwrap_or(serde_json::Value::Null), self.config.max_attempts, None);
        if let Err(err) = self.store.save_execution(&execution).await {
            tracing::warn!(schedule_id = %schedule_id, error = %err, "failed to persist scheduled execution");
            return Ok(());
        }
        self.execution_manager.dispatch_resume(execution.id).await;

        let fired_at = chrono::Utc::now();
        self.schedule_manager.advance(&mut schedule, fired_at).await?;
        Ok(())
    }
}
