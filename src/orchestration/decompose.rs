//! Turning a requirement into tasks.
//!
//! Manual runs read a tasks file. Auto runs ask a [`Decomposer`] for a task
//! list, or fall back to a single task carrying the whole requirement. An
//! optional [`UnderstandingGate`] checks the requirement before any of
//! this happens.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::process::Command;

use crate::core::graph::TaskGraph;
use crate::core::task::{RetryPolicy, Task, TaskSpec};
use crate::error::{Error, Result};

/// Default timeout for a decomposition command (10 minutes).
pub const DEFAULT_DECOMPOSE_TIMEOUT_SECS: u64 = 600;

/// Id of the task created when a requirement is not decomposed.
pub const SINGLE_TASK_ID: &str = "t1";

/// Accepted tasks file layouts: a bare array or `{"tasks": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum TasksDocument {
    List(Vec<TaskSpec>),
    Wrapped { tasks: Vec<TaskSpec> },
}

impl TasksDocument {
    fn into_specs(self) -> Vec<TaskSpec> {
        match self {
            TasksDocument::List(tasks) | TasksDocument::Wrapped { tasks } => tasks,
        }
    }
}

/// Parse task specs from JSON text.
pub fn parse_task_specs(json: &str) -> std::result::Result<Vec<TaskSpec>, String> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| e.to_string())?;
    if !(value.is_array() || value.get("tasks").is_some_and(|t| t.is_array())) {
        return Err("expected an array of tasks or an object with a \"tasks\" array".to_string());
    }
    let doc: TasksDocument = serde_json::from_value(value).map_err(|e| e.to_string())?;
    let specs = doc.into_specs();
    if let Some(spec) = specs.iter().find(|s| s.id.trim().is_empty()) {
        return Err(format!("task with empty id (title: {:?})", spec.title));
    }
    Ok(specs)
}

/// Build pending tasks from specs and validate their dependency graph.
pub fn build_tasks(specs: Vec<TaskSpec>, retry: &RetryPolicy, timeout_ms: u64) -> Result<Vec<Task>> {
    let tasks: Vec<Task> = specs
        .into_iter()
        .map(|spec| spec.into_task(retry, timeout_ms))
        .collect();
    TaskGraph::build(&tasks)?;
    Ok(tasks)
}

/// Load and validate a manual tasks file.
///
/// # Errors
/// - `TasksFileNotFound` if `path` does not exist
/// - `InvalidTasksFile` if it is not a task list
/// - `DuplicateTask`, `UnknownDependency` or `DependencyCycle` from graph validation
pub fn load_tasks_file(path: &Path, retry: &RetryPolicy, timeout_ms: u64) -> Result<Vec<Task>> {
    if !path.exists() {
        return Err(Error::TasksFileNotFound(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path)?;
    let specs = parse_task_specs(&contents).map_err(|reason| Error::InvalidTasksFile {
        path: path.to_path_buf(),
        reason,
    })?;
    let tasks = build_tasks(specs, retry, timeout_ms)?;
    tracing::debug!(path = %path.display(), tasks = tasks.len(), "tasks file loaded");
    Ok(tasks)
}

/// The whole requirement as one task.
pub fn single_task(requirement: &str, retry: &RetryPolicy, timeout_ms: u64) -> Task {
    let title = requirement.lines().next().unwrap_or_default().trim();
    let mut task = Task::new(SINGLE_TASK_ID, title, requirement);
    task.retry_policy = retry.clone();
    task.timeout_ms = timeout_ms;
    task
}

/// Where a run's tasks came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSource {
    TasksFile,
    Decomposer,
    Requirement,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::TasksFile => "tasks_file",
            TaskSource::Decomposer => "decomposer",
            TaskSource::Requirement => "requirement",
        }
    }
}

/// Splits a requirement into task specs.
pub trait Decomposer: Send + Sync {
    fn decompose<'a>(&'a self, requirement: &'a str) -> BoxFuture<'a, Result<Vec<TaskSpec>>>;
}

/// Runs an external command with the requirement as its last argument and
/// reads `{"tasks": [...]}` (or a bare array) from its stdout.
#[derive(Debug, Clone)]
pub struct CommandDecomposer {
    argv: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandDecomposer {
    pub fn new(command: &str, workdir: &Path) -> Self {
        Self {
            argv: command.split_whitespace().map(String::from).collect(),
            workdir: workdir.to_path_buf(),
            timeout: Duration::from_secs(DEFAULT_DECOMPOSE_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, requirement: &str) -> Result<Vec<TaskSpec>> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| Error::Decomposition("decompose command is empty".to_string()))?;

        tracing::info!(program = %program, "decomposing requirement");
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(program)
                .args(args)
                .arg(requirement)
                .current_dir(&self.workdir)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))?
        .map_err(|e| Error::Decomposition(format!("failed to start {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!("exited with code {}", output.status.code().unwrap_or(-1))
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Decomposition(message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        extract_task_specs(&stdout).map_err(Error::Decomposition)
    }
}

impl Decomposer for CommandDecomposer {
    fn decompose<'a>(&'a self, requirement: &'a str) -> BoxFuture<'a, Result<Vec<TaskSpec>>> {
        Box::pin(self.run(requirement))
    }
}

/// Parse a task list out of command output: the whole output if it is
/// JSON, otherwise the last line that is.
fn extract_task_specs(stdout: &str) -> std::result::Result<Vec<TaskSpec>, String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err("decompose command printed nothing".to_string());
    }
    if let Ok(specs) = parse_task_specs(trimmed) {
        return Ok(specs);
    }
    trimmed
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{') || l.starts_with('['))
        .find_map(|l| parse_task_specs(l).ok())
        .ok_or_else(|| "no task list found in decompose output".to_string())
}

/// Result of checking that a requirement was understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnderstandingVerdict {
    pub consistent: bool,
    /// The requirement as the checker restated it.
    pub restatement: String,
    pub reason: Option<String>,
}

impl UnderstandingVerdict {
    pub fn consistent(restatement: &str) -> Self {
        Self {
            consistent: true,
            restatement: restatement.to_string(),
            reason: None,
        }
    }

    pub fn inconsistent(restatement: &str, reason: &str) -> Self {
        Self {
            consistent: false,
            restatement: restatement.to_string(),
            reason: Some(reason.to_string()),
        }
    }
}

/// Checks a restatement of the requirement before any work starts.
pub trait UnderstandingGate: Send + Sync {
    fn check<'a>(&'a self, requirement: &'a str) -> BoxFuture<'a, Result<UnderstandingVerdict>>;
}
