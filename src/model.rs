//! Core data model: executions, step results, timers, schedules, audit
//! entries. Mirrors the data model in the engine's specification
//! one-to-one; see module docs on each manager for how these rows are
//! produced and consumed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type ExecutionId = Uuid;
pub type TaskId = String;
pub type StepId = String;
pub type TimerId = String;
pub type ScheduleId = String;

/// Reserved step-id prefixes. User step ids must never start with any of
/// these; `DurableContext` enforces this before a user-visible step runs.
pub const RESERVED_PREFIXES: &[&str] = &["__", "rollback:"];

pub fn is_reserved_step_id(id: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|p| id.starts_with(p))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Sleeping,
    Retrying,
    Completed,
    Failed,
    CompensationFailed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states never transition further; see invariant 2.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::CompensationFailed
                | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub message: String,
    pub stack: Option<String>,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), stack: None }
    }
}

/// One attempt lineage of a workflow. See §3 DATA MODEL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub task_id: TaskId,
    pub input: Value,
    pub status: ExecutionStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout_ms: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<ExecutionError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new_pending(task_id: TaskId, input: Value, max_attempts: u32, timeout_ms: Option<i64>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            task_id,
            input,
            status: ExecutionStatus::Pending,
            attempt: 1,
            max_attempts,
            timeout_ms,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            cancel_requested_at: None,
            cancelled_at: None,
        }
    }
}

/// The discriminated state of a cached step or signal/sleep slot. See
/// §3 DATA MODEL ("StepResult.result") and §9's note on replacing
/// interface inheritance with tagged variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepState {
    /// A plain durable step's cached return value.
    Completed { value: Value },
    /// A `waitForSignal` slot that has not yet been delivered to.
    Waiting {
        signal_id: String,
        timer_id: Option<TimerId>,
        timeout_at_ms: Option<i64>,
    },
    /// A `waitForSignal` slot that received a payload.
    SignalCompleted { payload: Value },
    /// A `waitForSignal` slot whose timeout fired before a signal arrived.
    TimedOut,
    /// A `sleep` slot that has been scheduled but not yet fired.
    Scheduled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub execution_id: ExecutionId,
    pub step_id: StepId,
    pub result: StepState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerType {
    Sleep,
    Retry,
    Scheduled,
    SignalTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Pending,
    Fired,
}

/// A deferred action row. See §3 DATA MODEL and §4.8 PollingManager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer {
    pub id: TimerId,
    pub timer_type: TimerType,
    pub fire_at: DateTime<Utc>,
    pub status: TimerStatus,
    pub execution_id: Option<ExecutionId>,
    pub step_id: Option<StepId>,
    pub task_id: Option<TaskId>,
    pub input: Option<Value>,
    pub schedule_id: Option<ScheduleId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Interval,
    Cron,
    Once,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
}

/// Recurring or one-off workflow trigger. See §4.4 ScheduleManager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub task_id: TaskId,
    pub schedule_type: ScheduleType,
    /// Milliseconds for `interval`, a cron expression for `cron`, an ISO
    /// instant for `once`.
    pub pattern: String,
    pub input: Option<Value>,
    pub status: ScheduleStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditKind {
    ExecutionStatusChanged { from: Option<ExecutionStatus>, to: ExecutionStatus },
    StepCompleted { step_id: StepId },
    SleepScheduled { step_id: StepId, fire_at: DateTime<Utc> },
    SleepCompleted { step_id: StepId },
    SignalWaiting { step_id: StepId, signal_id: String },
    SignalDelivered { step_id: StepId, signal_id: String },
    SignalTimedOut { step_id: StepId, signal_id: String },
    EmitPublished { step_id: StepId, event: String },
    SwitchEvaluated { step_id: StepId, branch_id: String },
    Note { message: String },
}

/// Structured history row. See §4.2 AuditLogger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub execution_id: ExecutionId,
    pub at: DateTime<Utc>,
    pub attempt: u32,
    pub kind: AuditKind,
}

impl AuditEntry {
    pub fn new(execution_id: ExecutionId, attempt: u32, kind: AuditKind) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}:{}", now.timestamp_millis(), Uuid::now_v7()),
            execution_id,
            at: now,
            attempt,
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_prefixes_reject_internal_and_rollback_ids() {
        assert!(is_reserved_step_id("__sleep:0"));
        assert!(is_reserved_step_id("__signal:paid"));
        assert!(is_reserved_step_id("rollback:charge"));
        assert!(!is_reserved_step_id("charge"));
    }

    #[test]
    fn terminal_states_are_exactly_the_spec_set() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::CompensationFailed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Sleeping.is_terminal());
        assert!(!ExecutionStatus::Retrying.is_terminal());
    }

    #[test]
    fn step_state_serializes_with_tag() {
        let s = StepState::Waiting { signal_id: "paid".into(), timer_id: None, timeout_at_ms: Some(1000) };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["state"], "waiting");
        assert_eq!(v["signal_id"], "paid");
    }
}
