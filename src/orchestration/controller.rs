//! Orchestration controller.
//!
//! The `Orchestrator` wires every other component together for one run:
//! it loads or derives tasks, assigns roles, emits `start`, drives the
//! scheduler, writes the report and emits the terminal event. Input
//! errors are returned before anything is written so the CLI can exit
//! with status 5 and an empty stream.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{validate_threshold, Config};
use crate::core::graph::TaskGraph;
use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::orchestration::decompose::{
    build_tasks, load_tasks_file, single_task, CommandDecomposer, Decomposer, TaskSource,
    UnderstandingGate,
};
use crate::orchestration::events::{read_seq, EventData, EventEmitter, StdoutMode};
use crate::orchestration::executor::{CommandExecutor, TaskExecutor};
use crate::orchestration::report::{remediation, RunReport, REASON_REPORT_WRITE_FAILED, REPORT_FILE};
use crate::orchestration::resources::{ResourceMonitor, ResourceProbe, SystemProbe};
use crate::orchestration::roles::{RoleAssigner, RoleFallback};
use crate::orchestration::scheduler::{Scheduler, SchedulerConfig};
use crate::state::{session_dir, RolloutHeader, RolloutState, RolloutStore, SEQ_FILE};

pub const REASON_DECOMPOSITION_FAILED: &str = "decomposition-failed";
pub const REASON_UNDERSTANDING_FAILED: &str = "understanding-failed";

/// Fresh orchestration id, `orc_<uuid>`.
pub fn new_orchestration_id() -> String {
    format!("orc_{}", Uuid::new_v4())
}

/// How tasks are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Tasks come from `--tasks-file`.
    #[default]
    Manual,
    /// Tasks are derived from the requirement.
    Auto,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Manual => "manual",
            RunMode::Auto => "auto",
        }
    }
}

/// Process exit status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failed,
    InvalidInput,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failed => 1,
            ExitStatus::InvalidInput => 5,
        }
    }

    /// Exit status for an error that ended the run early.
    pub fn for_error(error: &Error) -> Self {
        if error.is_input_error() {
            ExitStatus::InvalidInput
        } else {
            ExitStatus::Failed
        }
    }
}

/// Per-run options; unset fields fall back to the config.
#[derive(Debug, Clone, Default)]
pub struct OrchestrationOptions {
    pub requirement: String,
    pub mode: RunMode,
    pub tasks_file: Option<PathBuf>,
    pub success_threshold: Option<f64>,
    pub max_concurrency: Option<usize>,
    pub save_stream: Option<PathBuf>,
    pub stdout_mode: Option<StdoutMode>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub orchestration_id: String,
    pub report: RunReport,
    /// `None` when the run ended before a report could be written.
    pub report_path: Option<PathBuf>,
    pub session_dir: PathBuf,
    pub exit: ExitStatus,
}

/// Where the tasks of a fresh run came from, or why there are none.
enum Preparation {
    Ready {
        tasks: Vec<Task>,
        source: TaskSource,
        restatement: Option<String>,
    },
    UnderstandingFailed {
        restatement: String,
        reason: String,
    },
    DecompositionFailed {
        restatement: Option<String>,
        reason: String,
    },
}

pub struct Orchestrator {
    config: Config,
    workdir: PathBuf,
    sessions_dir: PathBuf,
    executor: Arc<dyn TaskExecutor>,
    probe: Option<Box<dyn ResourceProbe>>,
    fallback: Option<Box<dyn RoleFallback>>,
    decomposer: Option<Box<dyn Decomposer>>,
    gate: Option<Box<dyn UnderstandingGate>>,
    stdout: Box<dyn Write + Send>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Orchestrator with production collaborators for `workdir`.
    pub fn new(config: Config, workdir: &Path) -> Self {
        let sessions_dir = resolve(workdir, &config.orchestrator.sessions_dir);
        let decomposer = config
            .agent
            .decompose_command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .map(|c| Box::new(CommandDecomposer::new(c, workdir)) as Box<dyn Decomposer>);
        Self {
            executor: Arc::new(CommandExecutor::from_config(&config, workdir)),
            probe: Some(Box::new(SystemProbe::new())),
            fallback: None,
            decomposer,
            gate: None,
            stdout: Box::new(std::io::stdout()),
            cancel: CancellationToken::new(),
            workdir: workdir.to_path_buf(),
            sessions_dir,
            config,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Sample load through `probe`; `None` disables resource scaling.
    pub fn with_probe(mut self, probe: Option<Box<dyn ResourceProbe>>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_role_fallback(mut self, fallback: Box<dyn RoleFallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_decomposer(mut self, decomposer: Box<dyn Decomposer>) -> Self {
        self.decomposer = Some(decomposer);
        self
    }

    pub fn with_gate(mut self, gate: Box<dyn UnderstandingGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_stdout(mut self, stdout: Box<dyn Write + Send>) -> Self {
        self.stdout = stdout;
        self
    }

    pub fn with_sessions_dir(mut self, dir: &Path) -> Self {
        self.sessions_dir = dir.to_path_buf();
        self
    }

    /// Token that cancels the run when triggered.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run a fresh orchestration.
    ///
    /// # Errors
    /// Input errors (see [`Error::is_input_error`]) before any event is
    /// emitted; internal errors such as event validation failures.
    pub async fn start(mut self, options: OrchestrationOptions) -> Result<RunOutcome> {
        let threshold = options
            .success_threshold
            .unwrap_or(self.config.orchestrator.success_threshold);
        let max_concurrency = options
            .max_concurrency
            .unwrap_or(self.config.orchestrator.max_concurrency);
        validate_run_limits(threshold, max_concurrency)?;

        let retry = self.config.retry.policy();
        let timeout_ms = self.config.orchestrator.task_timeout_ms;

        // Manual input is validated before anything is created.
        let manual = match (&options.tasks_file, options.mode) {
            (Some(path), _) => Some(load_tasks_file(path, &retry, timeout_ms)?),
            (None, RunMode::Manual) => {
                return Err(Error::InvalidInput(
                    "manual mode requires --tasks-file".to_string(),
                ));
            }
            (None, RunMode::Auto) => None,
        };
        if manual.is_none() && options.requirement.trim().is_empty() {
            return Err(Error::InvalidInput("requirement must not be empty".to_string()));
        }

        let orchestration_id = new_orchestration_id();
        let session = session_dir(&self.sessions_dir, &orchestration_id);
        let mut emitter = self.emitter(&orchestration_id, &options)?;
        tracing::info!(
            orchestration = %orchestration_id,
            mode = options.mode.as_str(),
            threshold,
            max_concurrency,
            "orchestration starting"
        );

        let preparation = match manual {
            Some(tasks) => Preparation::Ready {
                tasks,
                source: TaskSource::TasksFile,
                restatement: None,
            },
            None => self.prepare(&options.requirement).await,
        };

        let (mut tasks, source, restatement) = match preparation {
            Preparation::Ready {
                tasks,
                source,
                restatement,
            } => (tasks, source, restatement),
            Preparation::UnderstandingFailed {
                restatement,
                reason,
            } => {
                emit_start(&mut emitter, &options, 0, threshold, max_concurrency, false)?;
                emitter.emit(EventData::UnderstandingFailed {
                    restatement,
                    reason,
                })?;
                let test_command = self.config.test_command(&self.workdir);
                return abort_run(emitter, session, REASON_UNDERSTANDING_FAILED, &test_command);
            }
            Preparation::DecompositionFailed {
                restatement,
                reason,
            } => {
                emit_start(&mut emitter, &options, 0, threshold, max_concurrency, false)?;
                if let Some(restatement) = restatement {
                    emitter.emit(EventData::UnderstandingValidated { restatement })?;
                }
                emitter.emit(EventData::DecompositionFailed { reason })?;
                let test_command = self.config.test_command(&self.workdir);
                return abort_run(emitter, session, REASON_DECOMPOSITION_FAILED, &test_command);
            }
        };

        let mut assigner = RoleAssigner::new(self.config.role_rules());
        if let Some(fallback) = self.fallback.take() {
            assigner = assigner.with_fallback(fallback);
        }
        assigner.assign_all(&mut tasks).await;

        emit_start(
            &mut emitter,
            &options,
            tasks.len(),
            threshold,
            max_concurrency,
            false,
        )?;
        if let Some(restatement) = restatement {
            emitter.emit(EventData::UnderstandingValidated { restatement })?;
        }
        if source != TaskSource::TasksFile {
            let graph = TaskGraph::build(&tasks)?;
            emitter.emit(EventData::DecompositionCompleted {
                source: source.as_str().to_string(),
                task_count: graph.task_count(),
                dependency_count: graph.dependency_count(),
            })?;
        }

        let header = RolloutHeader {
            orchestration_id: orchestration_id.clone(),
            requirement: options.requirement.clone(),
            mode: options.mode.as_str().to_string(),
            success_rate_threshold: threshold,
            max_concurrency,
        };
        let store = RolloutStore::new(&self.sessions_dir, header);
        self.execute(tasks, emitter, store, session, threshold, max_concurrency)
            .await
    }

    /// Continue the run persisted at `rollout`.
    ///
    /// Completed tasks keep their outcome and emit nothing; every other
    /// task starts over with zero attempts. Sequence numbers continue after
    /// the highest `seq` recorded for the run, so an interrupted run never
    /// reuses one.
    pub async fn resume(mut self, rollout: &Path, options: OrchestrationOptions) -> Result<RunOutcome> {
        let mut state = RolloutState::load(rollout)?;
        let threshold = options
            .success_threshold
            .unwrap_or(state.header.success_rate_threshold);
        let max_concurrency = options
            .max_concurrency
            .unwrap_or(state.header.max_concurrency);
        validate_run_limits(threshold, max_concurrency)?;
        TaskGraph::build(&state.tasks)?;

        let reset = state.prepare_resume();
        let orchestration_id = state.header.orchestration_id.clone();
        let session = rollout
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| session_dir(&self.sessions_dir, &orchestration_id));
        let recorded_seq = read_seq(&session.join(SEQ_FILE))?.unwrap_or(0);
        let last_seq = state.last_seq.max(recorded_seq);
        tracing::info!(
            orchestration = %orchestration_id,
            reset,
            last_seq,
            "resuming orchestration"
        );

        let mut header = state.header.clone();
        header.success_rate_threshold = threshold;
        header.max_concurrency = max_concurrency;

        let mut emitter = self
            .emitter(&orchestration_id, &options)?
            .starting_after(last_seq);

        let resumed_options = OrchestrationOptions {
            requirement: header.requirement.clone(),
            mode: if header.mode == RunMode::Auto.as_str() {
                RunMode::Auto
            } else {
                RunMode::Manual
            },
            ..options
        };
        emit_start(
            &mut emitter,
            &resumed_options,
            state.tasks.len(),
            threshold,
            max_concurrency,
            true,
        )?;

        let store = RolloutStore::at(rollout, header);
        self.execute(state.tasks, emitter, store, session, threshold, max_concurrency)
            .await
    }

    /// Build the run's emitter. Hands the stdout sink over to it.
    fn emitter(&mut self, orchestration_id: &str, options: &OrchestrationOptions) -> Result<EventEmitter> {
        let mode = options
            .stdout_mode
            .unwrap_or(self.config.orchestrator.stdout_events);
        let redactor = self.config.redaction.redactor()?;
        let stdout = std::mem::replace(&mut self.stdout, Box::new(std::io::sink()));
        let emitter = EventEmitter::new(orchestration_id, stdout, mode).with_redactor(redactor);
        match &options.save_stream {
            Some(path) => emitter.save_to(path),
            None => Ok(emitter),
        }
    }

    /// Run the understanding gate and decomposition for an auto run.
    async fn prepare(&self, requirement: &str) -> Preparation {
        let retry = self.config.retry.policy();
        let timeout_ms = self.config.orchestrator.task_timeout_ms;

        let mut restatement = None;
        if let Some(gate) = &self.gate {
            match gate.check(requirement).await {
                Ok(verdict) if verdict.consistent => restatement = Some(verdict.restatement),
                Ok(verdict) => {
                    return Preparation::UnderstandingFailed {
                        restatement: verdict.restatement,
                        reason: verdict
                            .reason
                            .unwrap_or_else(|| "restatement does not match".to_string()),
                    };
                }
                Err(e) => {
                    return Preparation::UnderstandingFailed {
                        restatement: String::new(),
                        reason: e.to_string(),
                    };
                }
            }
        }

        let Some(decomposer) = &self.decomposer else {
            return Preparation::Ready {
                tasks: vec![single_task(requirement, &retry, timeout_ms)],
                source: TaskSource::Requirement,
                restatement,
            };
        };

        let result = decomposer
            .decompose(requirement)
            .await
            .and_then(|specs| build_tasks(specs, &retry, timeout_ms));
        match result {
            Ok(tasks) if tasks.is_empty() => Preparation::DecompositionFailed {
                restatement,
                reason: "decomposition produced no tasks".to_string(),
            },
            Ok(tasks) => Preparation::Ready {
                tasks,
                source: TaskSource::Decomposer,
                restatement,
            },
            Err(e) => {
                tracing::warn!(error = %e, "decomposition failed");
                Preparation::DecompositionFailed {
                    restatement,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Schedule, report, and emit the terminal event.
    async fn execute(
        mut self,
        tasks: Vec<Task>,
        emitter: EventEmitter,
        store: RolloutStore,
        session: PathBuf,
        threshold: f64,
        max_concurrency: usize,
    ) -> Result<RunOutcome> {
        let orchestration_id = emitter.orchestration_id().to_string();
        let emitter = emitter.track_seq(&session.join(SEQ_FILE));
        if let Err(e) = store.save(&tasks, emitter.last_seq()).await {
            tracing::warn!(error = %e, "failed to persist initial rollout state");
        }

        let scheduler_config = SchedulerConfig {
            max_concurrency,
            poll_interval: Duration::from_millis(self.config.resources.poll_interval_ms.max(1)),
            cancel_policy: self.config.orchestrator.cancel_policy,
        };
        let mut scheduler = Scheduler::new(
            tasks,
            Arc::clone(&self.executor),
            emitter,
            scheduler_config,
            self.cancel.clone(),
        )?
        .with_store(store.clone());
        if let Some(mut probe) = self.probe.take() {
            let thresholds = self.config.resources.thresholds(probe.total_memory());
            scheduler = scheduler.with_monitor(ResourceMonitor::new(probe, thresholds));
        }

        let outcome = scheduler.run().await?;
        let mut emitter = outcome.emitter;
        let test_command = self.config.test_command(&self.workdir);
        let mut report = RunReport::compute(
            &orchestration_id,
            &outcome.tasks,
            threshold,
            outcome.cancelled,
            &test_command,
        );

        let report_path = match report.write(&session).await {
            Ok(path) => {
                emitter.emit(EventData::ReportWritten {
                    report_path: path.display().to_string(),
                })?;
                Some(path)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to write report");
                let target = session.join(REPORT_FILE);
                emitter.emit(EventData::ReportWriteFailed {
                    report_path: target.display().to_string(),
                    error: e.to_string(),
                })?;
                report.mark_failed(
                    REASON_REPORT_WRITE_FAILED,
                    remediation(&outcome.tasks, &test_command),
                );
                None
            }
        };

        emit_terminal(&mut emitter, &report, report_path.as_deref())?;
        if let Err(e) = store.save(&outcome.tasks, emitter.last_seq()).await {
            tracing::warn!(error = %e, "failed to persist final rollout state");
        }

        tracing::info!(
            orchestration = %orchestration_id,
            status = %report.status,
            success_rate = report.success_rate,
            "orchestration finished"
        );
        let exit = if report.is_success() {
            ExitStatus::Success
        } else {
            ExitStatus::Failed
        };
        Ok(RunOutcome {
            orchestration_id,
            report,
            report_path,
            session_dir: session,
            exit,
        })
    }
}

fn resolve(workdir: &Path, dir: &str) -> PathBuf {
    let path = Path::new(dir);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}

fn validate_run_limits(threshold: f64, max_concurrency: usize) -> Result<()> {
    validate_threshold(threshold)?;
    if max_concurrency == 0 {
        return Err(Error::InvalidInput(
            "max concurrency must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn emit_start(
    emitter: &mut EventEmitter,
    options: &OrchestrationOptions,
    total_tasks: usize,
    success_threshold: f64,
    max_concurrency: usize,
    resumed: bool,
) -> Result<()> {
    emitter.emit(EventData::Start {
        total_tasks,
        requirement: options.requirement.clone(),
        mode: options.mode.as_str().to_string(),
        max_concurrency,
        success_threshold,
        resumed,
    })?;
    Ok(())
}

fn emit_terminal(
    emitter: &mut EventEmitter,
    report: &RunReport,
    report_path: Option<&Path>,
) -> Result<()> {
    let path = report_path.map(|p| p.display().to_string());
    let data = match (report.is_success(), path) {
        (true, Some(report_path)) => EventData::OrchestrationCompleted {
            status: report.status.to_string(),
            success_rate: report.success_rate,
            total_tasks: report.total_tasks,
            completed_tasks: report.completed_tasks,
            failed_tasks: report.failed_tasks,
            report_path,
        },
        (_, report_path) => EventData::OrchestrationFailed {
            status: report.status.to_string(),
            success_rate: report.success_rate,
            total_tasks: report.total_tasks,
            completed_tasks: report.completed_tasks,
            failed_tasks: report.failed_tasks,
            failed_task_ids: report.failed_task_ids.clone(),
            failure_reason: report.failure_reason.clone().unwrap_or_default(),
            report_path,
        },
    };
    emitter.emit(data)?;
    Ok(())
}

/// End a run that never reached the scheduler.
fn abort_run(
    mut emitter: EventEmitter,
    session: PathBuf,
    reason: &str,
    test_command: &str,
) -> Result<RunOutcome> {
    let orchestration_id = emitter.orchestration_id().to_string();
    let mut report = RunReport::compute(&orchestration_id, &[], 1.0, false, test_command);
    report.mark_failed(reason, remediation(&[], test_command));
    emit_terminal(&mut emitter, &report, None)?;
    tracing::warn!(orchestration = %orchestration_id, reason, "orchestration aborted");
    Ok(RunOutcome {
        orchestration_id,
        report,
        report_path: None,
        session_dir: session,
        exit: ExitStatus::Failed,
    })
}
