//! `ScheduleManager`: create/pause/resume/update/remove schedules and
//! compute next fire times. See §4.4.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DurableError;
use crate::model::{Schedule, ScheduleId, ScheduleStatus, ScheduleType, TaskId, Timer, TimerStatus, TimerType};
use crate::store::Store;

/// One-off triggers take either a fixed delay or an absolute instant;
/// recurring triggers take either an interval or a cron pattern plus a
/// caller-supplied stable id.
pub enum ScheduleSpec {
    Delay { ms: i64 },
    At { at: DateTime<Utc> },
    Interval { id: ScheduleId, ms: i64 },
    Cron { id: ScheduleId, pattern: String },
}

/// Computes the next fire time for a schedule. Cron parsing is
/// delegated to the `cron` crate (`cron::Schedule::from_str`), the
/// registry crate this pack also reaches for elsewhere; interval
/// arithmetic is plain `chrono::Duration` addition so DST never enters
/// through naive local time.
pub fn compute_next_fire(schedule: &Schedule, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, DurableError> {
    match schedule.schedule_type {
        ScheduleType::Interval => {
            let ms: i64 = schedule
                .pattern
                .parse()
                .map_err(|_| DurableError::StoreShapeError(format!("interval schedule '{}' has non-numeric pattern", schedule.id)))?;
            Ok(Some(now + chrono::Duration::milliseconds(ms)))
        }
        ScheduleType::Cron => {
            let parsed = cron::Schedule::from_str(&schedule.pattern)
                .map_err(|err| DurableError::StoreShapeError(format!("invalid cron pattern '{}': {err}", schedule.pattern)))?;
            Ok(parsed.after(&now).next())
        }
        ScheduleType::Once => Ok(None),
    }
}

pub struct ScheduleManager {
    store: Arc<dyn Store>,
}

impl ScheduleManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Creates a schedule (or, for `Delay`/`At`, a single one-off timer)
    /// per §4.4's "schedule(task, input, opts)".
    pub async fn schedule(&self, task_id: TaskId, input: Option<Value>, spec: ScheduleSpec) -> Result<ScheduleId, DurableError> {
        match spec {
            ScheduleSpec::Delay { ms } => {
                let id = Uuid::now_v7().to_string();
                self.create_once_timer(&id, task_id, input, Utc::now() + chrono::Duration::milliseconds(ms)).await?;
                Ok(id)
            }
            ScheduleSpec::At { at } => {
                let id = Uuid::now_v7().to_string();
                self.create_once_timer(&id, task_id, input, at).await?;
                Ok(id)
            }
            ScheduleSpec::Interval { id, ms } => {
                self.create_recurring(id.clone(), task_id, input, ScheduleType::Interval, ms.to_string()).await?;
                Ok(id)
            }
            ScheduleSpec::Cron { id, pattern } => {
                self.create_recurring(id.clone(), task_id, input, ScheduleType::Cron, pattern).await?;
                Ok(id)
            }
        }
    }

    async fn create_once_timer(&self, schedule_id: &str, task_id: TaskId, input: Option<Value>, fire_at: DateTime<Utc>) -> Result<(), DurableError> {
        let timer = Timer {
            id: format!("once:{schedule_id}"),
            timer_type: TimerType::Scheduled,
            fire_at,
            status: TimerStatus::Pending,
            execution_id: None,
            step_id: None,
            task_id: Some(task_id.clone()),
            input,
            schedule_id: Some(schedule_id.to_string()),
        };
        // A one-off "schedule" is modeled as a Schedule row of type Once
        // purely so the poller's generic "reload and check staleness"
        // path works uniformly for every Scheduled timer.
        let schedule = Schedule {
            id: schedule_id.to_string(),
            task_id,
            schedule_type: ScheduleType::Once,
            pattern: fire_at.to_rfc3339(),
            input: timer.input.clone(),
            status: ScheduleStatus::Active,
            last_run: None,
            next_run: Some(fire_at),
        };
        self.store.create_schedule(&schedule).await?;
        self.store.create_timer(&timer).await?;
        Ok(())
    }

    async fn create_recurring(
        &self,
        id: ScheduleId,
        task_id: TaskId,
        input: Option<Value>,
        schedule_type: ScheduleType,
        pattern: String,
    ) -> Result<(), DurableError> {
        let mut schedule = Schedule {
            id: id.clone(),
            task_id: task_id.clone(),
            schedule_type,
            pattern,
            input,
            status: ScheduleStatus::Active,
            last_run: None,
            next_run: None,
        };
        let next_run = compute_next_fire(&schedule, Utc::now())?
            .ok_or_else(|| DurableError::StoreShapeError(format!("schedule '{id}' produced no next fire time")))?;
        schedule.next_run = Some(next_run);
        self.store.create_schedule(&schedule).await?;
        self.store
            .create_timer(&Timer {
                id: format!("scheduled:{id}:{}", next_run.timestamp_millis()),
                timer_type: TimerType::Scheduled,
                fire_at: next_run,
                status: TimerStatus::Pending,
                execution_id: None,
                step_id: None,
                task_id: Some(task_id),
                input: schedule.input.clone(),
                schedule_id: Some(id),
            })
            .await?;
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> Result<(), DurableError> {
        self.set_status(id, ScheduleStatus::Paused).await
    }

    pub async fn resume(&self, id: &str) -> Result<(), DurableError> {
        self.set_status(id, ScheduleStatus::Active).await
    }

    async fn set_status(&self, id: &str, status: ScheduleStatus) -> Result<(), DurableError> {
        let mut schedule = self.store.get_schedule(id).await?.ok_or_else(|| DurableError::StoreShapeError(format!("schedule '{id}' not found")))?;
        schedule.status = status;
        self.store.update_schedule(&schedule).await?;
        Ok(())
    }

    pub async fn update(&self, id: &str, input: Option<Value>) -> Result<(), DurableError> {
        let mut schedule = self.store.get_schedule(id).await?.ok_or_else(|| DurableError::StoreShapeError(format!("schedule '{id}' not found")))?;
        schedule.input = input;
        self.store.update_schedule(&schedule).await?;
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<(), DurableError> {
        self.store.delete_schedule(id).await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Schedule>, DurableError> {
        Ok(self.store.get_schedule(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Schedule>, DurableError> {
        Ok(self.store.list_schedules().await?)
    }

    /// Advances a schedule after its timer fires: bump `lastRun`,
    /// compute and persist `nextRun`, create the next `scheduled`
    /// timer. Called by `PollingManager` after kicking off the
    /// triggered execution. A `once` schedule (or any schedule whose
    /// next fire is `None`) fires exactly once and removes itself
    /// instead of being persisted forever with a dangling `nextRun`.
    pub async fn advance(&self, schedule: &mut Schedule, fired_at: DateTime<Utc>) -> Result<(), DurableError> {
        schedule.last_run = Some(fired_at);
        let next_run = compute_next_fire(schedule, fired_at)?;
        schedule.next_run = next_run;

        let next_run = match next_run {
            Some(next_run) => next_run,
            None => {
                self.store.delete_schedule(&schedule.id).await?;
                return Ok(());
            }
        };

        self.store.update_schedule(schedule).await?;
        self.store
            .create_timer(&Timer {
                id: format!("scheduled:{}:{}", schedule.id, next_run.timestamp_millis()),
                timer_type: TimerType::Scheduled,
                fire_at: next_run,
                status: TimerStatus::Pending,
                execution_id: None,
                step_id: None,
                task_id: Some(schedule.task_id.clone()),
                input: schedule.input.clone(),
                schedule_id: Some(schedule.id.clone()),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;

    #[tokio::test]
    async fn interval_schedule_creates_a_single_scheduled_timer() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let manager = ScheduleManager::new(store.clone());
        let id = manager
            .schedule("ping".into(), None, ScheduleSpec::Interval { id: "hourly".into(), ms: 3_600_000 })
            .await
            .unwrap();

        let schedule = manager.get(&id).await.unwrap().unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Active);
        assert!(schedule.next_run.is_some());

        let store = store.as_ref();
        let timers = store.get_ready_timers(Utc::now() + chrono::Duration::hours(2)).await.unwrap();
        assert_eq!(timers.iter().filter(|t| t.schedule_id.as_deref() == Some("hourly")).count(), 1);
    }

    #[tokio::test]
    async fn cron_schedule_computes_next_fire_via_cron_crate() {
        let schedule = Schedule {
            id: "daily".into(),
            task_id: "report".into(),
            schedule_type: ScheduleType::Cron,
            // Seconds-including 7-field cron, per the `cron` crate's format.
            pattern: "0 0 0 * * * *".into(),
            input: None,
            status: ScheduleStatus::Active,
            last_run: None,
            next_run: None,
        };
        let now = Utc::now();
        let next = compute_next_fire(&schedule, now).unwrap().unwrap();
        assert!(next > now);
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_status() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let manager = ScheduleManager::new(store);
        let id = manager.schedule("ping".into(), None, ScheduleSpec::Interval { id: "hourly".into(), ms: 1000 }).await.unwrap();
        manager.pause(&id).await.unwrap();
        assert_eq!(manager.get(&id).await.unwrap().unwrap().status, ScheduleStatus::Paused);
        manager.resume(&id).await.unwrap();
        assert_eq!(manager.get(&id).await.unwrap().unwrap().status, ScheduleStatus::Active);
    }

    #[tokio::test]
    async fn advance_removes_a_once_schedule_instead_of_leaving_it_active_forever() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let manager = ScheduleManager::new(store.clone());
        let id = manager.schedule("ping".into(), None, ScheduleSpec::Delay { ms: 0 }).await.unwrap();
        let mut schedule = manager.get(&id).await.unwrap().unwrap();

        manager.advance(&mut schedule, Utc::now()).await.unwrap();

        assert!(manager.get(&id).await.unwrap().is_none(), "once schedule must remove itself after firing");
    }

    #[tokio::test]
    async fn advance_creates_the_next_timer_and_bumps_last_run() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let manager = ScheduleManager::new(store.clone());
        let id = manager.schedule("ping".into(), None, ScheduleSpec::Interval { id: "hourly".into(), ms: 1000 }).await.unwrap();
        let mut schedule = manager.get(&id).await.unwrap().unwrap();
        let fired_at = Utc::now();
        manager.advance(&mut schedule, fired_at).await.unwrap();
        assert_eq!(schedule.last_run, Some(fired_at));
        assert!(schedule.next_run.unwrap() > fired_at);
    }
}
