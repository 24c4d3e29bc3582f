//! Task execution boundary.
//!
//! The scheduler hands each dispatched attempt to a `TaskExecutor`. The
//! production `CommandExecutor` runs either the task's own shell command or
//! the agent CLI in headless mode, then the task's quick-validation command.
//!
//! Executors report patches as JSON lines on stdout:
//!
//! ```text
//! {"type":"patch","patchId":"p1","targetFiles":["src/lib.rs"],"outcome":"applied"}
//! ```
//!
//! Any other output is ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Instant;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::process::Command;

use crate::agent::{task_prompt, AgentCommand};
use crate::config::{Config, RoleProfile};
use crate::core::patch::{PatchOutcome, PatchReport};
use crate::core::task::{FailureKind, Task, TaskId};

/// Everything an executor needs to run one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub title: String,
    pub description: String,
    pub role: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub command: Option<String>,
    pub validate: Option<String>,
}

impl ExecutionRequest {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            role: task.role.clone().unwrap_or_default(),
            attempt: task.attempts,
            command: task.command.clone(),
            validate: task.validate.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// A quick-validation command that passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub command: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub failure: Option<ExecutionFailure>,
    /// Patches in the order the execution reported them.
    pub patches: Vec<PatchReport>,
    pub validation: Option<Validation>,
}

impl ExecutionOutcome {
    pub fn succeeded() -> Self {
        Self {
            failure: None,
            patches: Vec::new(),
            validation: None,
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            failure: Some(ExecutionFailure {
                kind,
                message: message.into(),
            }),
            ..Self::succeeded()
        }
    }

    pub fn with_patches(mut self, patches: Vec<PatchReport>) -> Self {
        self.patches = patches;
        self
    }

    pub fn with_validation(mut self, command: &str, duration_ms: u64) -> Self {
        self.validation = Some(Validation {
            command: command.to_string(),
            duration_ms,
        });
        self
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Runs task attempts. Implementations must not block the runtime.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, request: ExecutionRequest) -> BoxFuture<'static, ExecutionOutcome>;
}

/// Executes tasks as child processes in a working directory.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    agent: AgentCommand,
    profiles: BTreeMap<String, RoleProfile>,
    workdir: PathBuf,
}

impl CommandExecutor {
    pub fn new(agent: AgentCommand, workdir: &Path) -> Self {
        Self {
            agent,
            profiles: BTreeMap::new(),
            workdir: workdir.to_path_buf(),
        }
    }

    pub fn from_config(config: &Config, workdir: &Path) -> Self {
        Self {
            agent: AgentCommand::from_config(config),
            profiles: config.profiles.clone(),
            workdir: workdir.to_path_buf(),
        }
    }

    fn argv(&self, request: &ExecutionRequest) -> Vec<String> {
        match &request.command {
            Some(cmd) => vec!["sh".to_string(), "-c".to_string(), cmd.clone()],
            None => {
                let profile = self.profiles.get(&request.role).cloned().unwrap_or_default();
                let prompt = task_prompt(&request.role, &request.title, &request.description);
                self.agent.command(&profile, &prompt)
            }
        }
    }
}

impl TaskExecutor for CommandExecutor {
    fn execute(&self, request: ExecutionRequest) -> BoxFuture<'static, ExecutionOutcome> {
        let argv = self.argv(&request);
        let workdir = self.workdir.clone();
        let missing_agent = request.command.is_none() && !self.agent.is_available();
        let agent = self.agent.binary().to_string();
        Box::pin(async move {
            if missing_agent {
                tracing::warn!(task = %request.task_id, agent = %agent, "agent CLI not found");
                return ExecutionOutcome::failed(
                    FailureKind::Spawn,
                    format!("agent CLI `{}` not found on PATH", agent),
                );
            }
            tracing::debug!(task = %request.task_id, attempt = request.attempt, program = %argv[0], "executing task");

            let output = match run(&argv, &workdir).await {
                Ok(output) => output,
                Err(e) => {
                    return ExecutionOutcome::failed(
                        FailureKind::Spawn,
                        format!("failed to start {}: {}", argv[0], e),
                    );
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout);
            let patches = parse_patch_lines(&stdout);

            if !output.status.success() {
                let message = failure_message(&output);
                return ExecutionOutcome::failed(FailureKind::Execution, message)
                    .with_patches(patches);
            }

            let Some(validate) = request.validate.as_deref() else {
                return ExecutionOutcome::succeeded().with_patches(patches);
            };

            let started = Instant::now();
            let shell = vec!["sh".to_string(), "-c".to_string(), validate.to_string()];
            match run(&shell, &workdir).await {
                Ok(check) if check.status.success() => ExecutionOutcome::succeeded()
                    .with_patches(patches)
                    .with_validation(validate, started.elapsed().as_millis() as u64),
                Ok(check) => ExecutionOutcome::failed(
                    FailureKind::ValidationFailed,
                    format!("validation `{}` failed: {}", validate, failure_message(&check)),
                )
                .with_patches(patches),
                Err(e) => ExecutionOutcome::failed(
                    FailureKind::ValidationFailed,
                    format!("validation `{}` could not start: {}", validate, e),
                )
                .with_patches(patches),
            }
        })
    }
}

async fn run(argv: &[String], workdir: &Path) -> std::io::Result<Output> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"))?;
    Command::new(program)
        .args(args)
        .current_dir(workdir)
        .kill_on_drop(true)
        .output()
        .await
}

fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: Vec<&str> = stderr.trim().lines().rev().take(5).collect();
    if tail.is_empty() {
        format!("exited with code {}", output.status.code().unwrap_or(-1))
    } else {
        tail.into_iter().rev().collect::<Vec<_>>().join("\n")
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchLine {
    #[serde(rename = "type")]
    kind: String,
    patch_id: String,
    #[serde(default)]
    target_files: Vec<String>,
    outcome: PatchOutcome,
    #[serde(default)]
    reason: Option<String>,
}

/// Extract patch reports from executor stdout.
pub fn parse_patch_lines(stdout: &str) -> Vec<PatchReport> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .filter_map(|l| serde_json::from_str::<PatchLine>(l).ok())
        .filter(|p| p.kind == "patch")
        .map(|p| PatchReport {
            patch_id: p.patch_id,
            target_files: p.target_files,
            outcome: p.outcome,
            reason: p.reason,
        })
        .collect()
}
