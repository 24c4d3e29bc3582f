//! Task data model for an orchestration run.
//!
//! Tasks are the atomic units of work handed to agents. Each task tracks
//! its lifecycle status, attempts against its retry policy, the patches
//! its executions reported, and timing.

use crate::core::patch::Patch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Default per-task timeout (30 minutes).
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 30 * 60 * 1000;

/// Identifier of a task, unique within one orchestration.
///
/// Manual task files choose their own ids (`t1`, `t-setup`), so unlike
/// agent ids these are free-form strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task status in its lifecycle.
///
/// `pending -> scheduled -> running -> completed | failed`. A failed
/// attempt with retries left goes back to `scheduled`, so `failed` is
/// always terminal once observed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Declared, dependencies not yet satisfied.
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for a free slot or a retry delay.
    Scheduled,
    /// Currently executing on a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully with no attempts left.
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Why a task attempt failed. Serialized as the `errorType` of failure events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The agent or command exited unsuccessfully.
    Execution,
    /// The attempt exceeded the task timeout.
    Timeout,
    /// The agent process could not be started.
    Spawn,
    /// The quick-validation command failed after a successful execution.
    ValidationFailed,
    /// An upstream dependency failed, so the task can never start.
    DependencyFailed,
    /// The run was cancelled while the attempt was in flight.
    Cancelled,
}

/// Shape of the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Fixed,
}

/// Retry policy attached to every task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: BackoffKind::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the attempt following attempt number `attempt` (1-based).
    ///
    /// Exponential: `initial * 2^(attempt - 1)`, fixed: `initial`. Both are
    /// capped at `max_delay_ms`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let raw = match self.backoff {
            BackoffKind::Fixed => self.initial_delay_ms,
            BackoffKind::Exponential => {
                let exponent = attempt.saturating_sub(1).min(32);
                self.initial_delay_ms.saturating_mul(1u64 << exponent)
            }
        };
        Duration::from_millis(raw.min(self.max_delay_ms))
    }
}

/// How a task's role was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Rule,
    Llm,
    Manual,
}

impl std::fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MatchMethod::Rule => "rule",
            MatchMethod::Llm => "llm",
            MatchMethod::Manual => "manual",
        };
        write!(f, "{}", s)
    }
}

/// A single task in the orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    /// Assigned role; `None` until the role assigner runs.
    pub role: Option<String>,
    pub match_method: Option<MatchMethod>,
    pub match_details: Option<String>,
    /// Tasks that must be `completed` before this one may start.
    pub dependencies: Vec<TaskId>,
    pub status: TaskStatus,
    pub attempts: u32,
    pub retry_policy: RetryPolicy,
    pub patches: Vec<Patch>,
    pub duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_failure: Option<FailureKind>,
    /// Shell command run in place of the agent, if any.
    pub command: Option<String>,
    /// Quick-validation command run after a successful execution.
    pub validate: Option<String>,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest instant a retry may be dispatched. Not persisted.
    #[serde(skip)]
    pub not_before: Option<Instant>,
}

impl Task {
    /// Create a pending task with the default retry policy and timeout.
    pub fn new(id: impl Into<String>, title: &str, description: &str) -> Self {
        Self {
            id: TaskId::new(id),
            title: title.to_string(),
            description: description.to_string(),
            role: None,
            match_method: None,
            match_details: None,
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            attempts: 0,
            retry_policy: RetryPolicy::default(),
            patches: Vec::new(),
            duration_ms: None,
            last_error: None,
            last_failure: None,
            command: None,
            validate: None,
            timeout_ms: DEFAULT_TASK_TIMEOUT_MS,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            not_before: None,
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| TaskId::from(*d)).collect();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Text the role assigner and the agent prompt work from.
    pub fn text(&self) -> String {
        format!("{} {}", self.title, self.description)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Dependencies satisfied; waiting for a slot.
    pub fn schedule(&mut self) {
        self.status = TaskStatus::Scheduled;
    }

    /// Begin an attempt. Increments `attempts`.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.attempts += 1;
        self.not_before = None;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, duration_ms: u64) {
        self.status = TaskStatus::Completed;
        self.duration_ms = Some(duration_ms);
        self.last_error = None;
        self.last_failure = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str, kind: FailureKind, duration_ms: Option<u64>) {
        self.status = TaskStatus::Failed;
        self.last_error = Some(error.to_string());
        self.last_failure = Some(kind);
        if duration_ms.is_some() {
            self.duration_ms = duration_ms;
        }
        self.completed_at = Some(Utc::now());
    }

    /// Put a failed task back in line, eligible again after `delay`.
    pub fn retry_after(&mut self, delay: Duration) {
        self.status = TaskStatus::Scheduled;
        self.completed_at = None;
        self.not_before = Some(Instant::now() + delay);
    }

    /// Whether a retry delay is still pending at `now`.
    pub fn is_backing_off(&self, now: Instant) -> bool {
        self.not_before.is_some_and(|at| at > now)
    }

    /// Forget a previous run's outcome so the task runs again on resume.
    pub fn reset_for_resume(&mut self) {
        self.status = TaskStatus::Pending;
        self.attempts = 0;
        self.patches.clear();
        self.duration_ms = None;
        self.last_error = None;
        self.last_failure = None;
        self.started_at = None;
        self.completed_at = None;
        self.not_before = None;
    }

    /// Completed or failed.
    pub fn is_finished(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Still waiting to run (pending or scheduled).
    pub fn is_waiting(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Scheduled)
    }
}

/// Retry override accepted in task files.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffKind>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

impl RetrySpec {
    fn apply(&self, base: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts).max(1),
            backoff: self.backoff.unwrap_or(base.backoff),
            initial_delay_ms: self.initial_delay_ms.unwrap_or(base.initial_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(base.max_delay_ms),
        }
    }
}

/// One entry of a manual tasks file or a decomposition result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub validate: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
}

impl TaskSpec {
    /// Build a pending task, filling gaps from the run defaults.
    pub fn into_task(self, retry: &RetryPolicy, timeout_ms: u64) -> Task {
        let title = self.title.unwrap_or_else(|| self.id.clone());
        let description = self.description.unwrap_or_default();
        let mut task = Task::new(self.id, &title, &description);
        task.dependencies = self.dependencies.into_iter().map(TaskId).collect();
        task.retry_policy = match &self.retry {
            Some(spec) => spec.apply(retry),
            None => retry.clone(),
        };
        task.timeout_ms = self.timeout_ms.unwrap_or(timeout_ms);
        task.command = self.command;
        task.validate = self.validate;
        if let Some(role) = self.role.filter(|r| !r.trim().is_empty()) {
            task.role = Some(role);
            task.match_method = Some(MatchMethod::Manual);
            task.match_details = Some("role supplied in task file".to_string());
        }
        task
    }
}
