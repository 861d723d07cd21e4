//! Task, outcome, and dead-letter data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task has been constructed but not yet admitted to a queue
    Pending,
    /// Task is waiting in its type's priority queue
    Queued,
    /// Task has been claimed by a worker and is executing
    Processing,
    /// Handler returned a result
    Completed,
    /// Handler raised or execution was aborted
    Failed,
    /// Task execution exceeded its deadline
    Timeout,
}

/// Relative priority levels; higher scores pop first within a task type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Background = 0,
    Low = 5,
    Normal = 10,
    High = 15,
    Critical = 20,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl TaskPriority {
    /// Sorted-set score for this priority
    pub fn score(self) -> i64 {
        self as i64
    }
}

/// Task metadata persisted under `{task_prefix}:{task_id}` with TTL equal
/// to the task's execution timeout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, `{task_type}:{unix_timestamp_with_fraction}`
    pub task_id: String,
    /// Selects the handler and the priority queue
    pub task_type: String,
    /// Arbitrary handler input payload
    pub data: Value,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Priority score used when the task was enqueued
    pub priority: i64,
    /// Execution timeout in seconds; also the metadata TTL
    pub timeout_secs: u64,
    /// When the task was created
    pub created_at: DateTime<Utc>,
    /// When a worker began executing the task
    pub started_at: Option<DateTime<Utc>>,
    /// Hostname of the worker that claimed the task
    pub worker_host: Option<String>,
}

impl Task {
    /// Create a new task with a timestamp-derived unique id
    pub fn new(task_type: &str, data: Value, priority: i64, timeout_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            task_id: generate_task_id(task_type, now),
            task_type: task_type.to_string(),
            data,
            status: TaskStatus::Pending,
            priority,
            timeout_secs,
            created_at: now,
            started_at: None,
            worker_host: None,
        }
    }

    /// Mark the task as claimed by a worker
    pub fn mark_processing(&mut self, worker_host: &str) {
        self.status = TaskStatus::Processing;
        self.started_at = Some(Utc::now());
        self.worker_host = Some(worker_host.to_string());
    }
}

/// Build a task id of the form `{task_type}:{seconds.micros}`
fn generate_task_id(task_type: &str, now: DateTime<Utc>) -> String {
    let micros = now.timestamp_micros();
    format!(
        "{}:{}.{:06}",
        task_type,
        micros / 1_000_000,
        micros % 1_000_000
    )
}

/// Terminal status of a stored outcome
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
    Timeout,
    /// The handler exists but the feature behind it is not built yet;
    /// distinct from `Failed` so callers can tell the two apart
    NotImplemented,
}

/// Result payload persisted under `{result_prefix}:{task_id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: OutcomeStatus,
    /// Handler return payload on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Coarse error classification (e.g. "handler_error", "connection_error")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl TaskOutcome {
    /// Successful outcome carrying the handler's payload
    pub fn completed(task_id: &str, result: Value) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: OutcomeStatus::Completed,
            result: Some(result),
            error: None,
            error_type: None,
            completed_at: Some(Utc::now()),
            failed_at: None,
        }
    }

    /// Failed outcome carrying the error message and classification
    pub fn failed(task_id: &str, error: &str, error_type: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: OutcomeStatus::Failed,
            result: None,
            error: Some(error.to_string()),
            error_type: Some(error_type.to_string()),
            completed_at: None,
            failed_at: Some(Utc::now()),
        }
    }

    /// Synthetic outcome for a caller-side wait that expired
    pub fn timed_out(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: OutcomeStatus::Timeout,
            result: None,
            error: Some("timed out waiting for result".to_string()),
            error_type: Some("timeout".to_string()),
            completed_at: None,
            failed_at: Some(Utc::now()),
        }
    }

    /// Outcome for a registered but unbuilt task type
    pub fn not_implemented(task_id: &str, task_type: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: OutcomeStatus::NotImplemented,
            result: None,
            error: Some(format!("task type {} is not implemented", task_type)),
            error_type: Some("not_implemented".to_string()),
            completed_at: None,
            failed_at: Some(Utc::now()),
        }
    }
}

/// Pub/sub notification published after a result is durably stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultNotification {
    pub task_id: String,
    pub status: OutcomeStatus,
}

/// Long-retention record of a failed task, kept for offline inspection
/// and never consumed automatically
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task_id: String,
    pub task: Task,
    pub error: String,
    pub worker_host: String,
    pub failed_at: DateTime<Utc>,
}

/// Status lookup answer covering live tasks, finished tasks whose metadata
/// has been purged, and ids the store has never seen (or has expired)
#[derive(Debug, Clone)]
pub enum TaskLookup {
    /// Metadata key still present
    Active(Task),
    /// Metadata gone but a result is retained
    Finished(TaskOutcome),
    /// Neither key exists; callers should treat a previously-live id
    /// reported here as an effective timeout/loss
    NotFound,
    /// The store could not be reached; distinct from `NotFound` so callers
    /// can tell "never connected" from "not yet complete"
    Unreachable(String),
}

impl TaskLookup {
    /// Flatten the lookup into the status callers report on
    pub fn status(&self) -> Option<TaskStatus> {
        match self {
            TaskLookup::Active(task) => Some(task.status),
            TaskLookup::Finished(outcome) => Some(match outcome.status {
                OutcomeStatus::Completed => TaskStatus::Completed,
                OutcomeStatus::Failed | OutcomeStatus::NotImplemented => TaskStatus::Failed,
                OutcomeStatus::Timeout => TaskStatus::Timeout,
            }),
            TaskLookup::NotFound | TaskLookup::Unreachable(_) => None,
        }
    }
}
