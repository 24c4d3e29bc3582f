use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Tasks file not found: {}", .0.display())]
    TasksFileNotFound(PathBuf),

    #[error("Invalid tasks file {}: {reason}", path.display())]
    InvalidTasksFile { path: PathBuf, reason: String },

    #[error("Rollout state not found: {}", .0.display())]
    RolloutNotFound(PathBuf),

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("Decomposition failed: {0}")]
    Decomposition(String),

    #[error("Stream event {event} failed validation: {}", issues.join("; "))]
    EventValidation { event: String, issues: Vec<String> },

    #[error("Failed to write report to {}: {reason}", path.display())]
    ReportWrite { path: PathBuf, reason: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Worker pool is full (capacity: {capacity})")]
    WorkerPoolFull { capacity: usize },

    #[error("Worker not found: {id}")]
    WorkerNotFound { id: crate::agent::AgentId },
}

impl Error {
    /// Errors caused by what the user handed us rather than by the run itself.
    ///
    /// These map to exit code 5 and must surface before any stream event is
    /// written.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_)
                | Error::TasksFileNotFound(_)
                | Error::InvalidTasksFile { .. }
                | Error::RolloutNotFound(_)
                | Error::DuplicateTask(_)
                | Error::UnknownDependency { .. }
                | Error::DependencyCycle(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
