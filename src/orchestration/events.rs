//! Stream-json event emission.
//!
//! Every observable state change of an orchestration becomes one JSON line.
//! The `EventEmitter` owns the per-orchestration sequence counter, stamps
//! each event, validates it against the stream schema and writes it to
//! stdout and an optional save file. Payloads are redacted first.
//!
//! The set and order of event names is a compatibility contract with
//! consumers of the stream. Add new names at the end only.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::AgentId;
use crate::core::task::{FailureKind, Task, TaskStatus};
use crate::orchestration::pool::CancelPolicy;
use crate::orchestration::redact::Redactor;
use crate::{Error, Result};

/// Names of all stream events, in contract order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    TaskScheduled,
    TaskStarted,
    ToolUse,
    TaskCompleted,
    TaskFailed,
    TaskRetryScheduled,
    PatchGenerated,
    PatchApplied,
    PatchFailed,
    PatchGenerationFailed,
    TaskExecutionSummary,
    QuickValidatePassed,
    ConcurrencyReduced,
    ConcurrencyIncreased,
    ResourceDownscale,
    ResourceRestore,
    ResourceExhausted,
    SessionWorkspaceUpdated,
    ManualInterventionRequested,
    UnderstandingValidated,
    UnderstandingFailed,
    DecompositionCompleted,
    DecompositionFailed,
    CancelRequested,
    ReportWritten,
    ReportWriteFailed,
    OrchestrationCompleted,
    OrchestrationFailed,
}

impl EventKind {
    pub const ALL: [EventKind; 29] = [
        EventKind::Start,
        EventKind::TaskScheduled,
        EventKind::TaskStarted,
        EventKind::ToolUse,
        EventKind::TaskCompleted,
        EventKind::TaskFailed,
        EventKind::TaskRetryScheduled,
        EventKind::PatchGenerated,
        EventKind::PatchApplied,
        EventKind::PatchFailed,
        EventKind::PatchGenerationFailed,
        EventKind::TaskExecutionSummary,
        EventKind::QuickValidatePassed,
        EventKind::ConcurrencyReduced,
        EventKind::ConcurrencyIncreased,
        EventKind::ResourceDownscale,
        EventKind::ResourceRestore,
        EventKind::ResourceExhausted,
        EventKind::SessionWorkspaceUpdated,
        EventKind::ManualInterventionRequested,
        EventKind::UnderstandingValidated,
        EventKind::UnderstandingFailed,
        EventKind::DecompositionCompleted,
        EventKind::DecompositionFailed,
        EventKind::CancelRequested,
        EventKind::ReportWritten,
        EventKind::ReportWriteFailed,
        EventKind::OrchestrationCompleted,
        EventKind::OrchestrationFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::TaskScheduled => "task_scheduled",
            EventKind::TaskStarted => "task_started",
            EventKind::ToolUse => "tool_use",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::TaskRetryScheduled => "task_retry_scheduled",
            EventKind::PatchGenerated => "patch_generated",
            EventKind::PatchApplied => "patch_applied",
            EventKind::PatchFailed => "patch_failed",
            EventKind::PatchGenerationFailed => "patch_generation_failed",
            EventKind::TaskExecutionSummary => "task_execution_summary",
            EventKind::QuickValidatePassed => "quick_validate_passed",
            EventKind::ConcurrencyReduced => "concurrency_reduced",
            EventKind::ConcurrencyIncreased => "concurrency_increased",
            EventKind::ResourceDownscale => "resource_downscale",
            EventKind::ResourceRestore => "resource_restore",
            EventKind::ResourceExhausted => "resource_exhausted",
            EventKind::SessionWorkspaceUpdated => "session_workspace_updated",
            EventKind::ManualInterventionRequested => "manual_intervention_requested",
            EventKind::UnderstandingValidated => "understanding_validated",
            EventKind::UnderstandingFailed => "understanding_failed",
            EventKind::DecompositionCompleted => "decomposition_completed",
            EventKind::DecompositionFailed => "decomposition_failed",
            EventKind::CancelRequested => "cancel_requested",
            EventKind::ReportWritten => "report_written",
            EventKind::ReportWriteFailed => "report_write_failed",
            EventKind::OrchestrationCompleted => "orchestration_completed",
            EventKind::OrchestrationFailed => "orchestration_failed",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }

    /// Final event of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::OrchestrationCompleted | EventKind::OrchestrationFailed
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of each event, one variant per `EventKind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EventData {
    Start {
        total_tasks: usize,
        requirement: String,
        mode: String,
        max_concurrency: usize,
        success_threshold: f64,
        resumed: bool,
    },
    TaskScheduled {
        title: String,
        dependencies: Vec<String>,
    },
    TaskStarted {
        attempt: u32,
        max_attempts: u32,
    },
    ToolUse {
        tool: String,
        patch_id: String,
        target_files: Vec<String>,
    },
    TaskCompleted {
        attempt: u32,
        duration_ms: u64,
    },
    TaskFailed {
        attempt: u32,
        error: String,
        error_type: FailureKind,
        will_retry: bool,
    },
    TaskRetryScheduled {
        next_attempt: u32,
        delay_ms: u64,
    },
    PatchGenerated {
        patch_id: String,
        sequence: u32,
        target_files: Vec<String>,
    },
    PatchApplied {
        patch_id: String,
        sequence: u32,
        target_files: Vec<String>,
        conflicts_with: Vec<String>,
    },
    PatchFailed {
        patch_id: String,
        sequence: u32,
        target_files: Vec<String>,
        reason: String,
    },
    PatchGenerationFailed {
        patch_id: String,
        sequence: u32,
        reason: String,
    },
    TaskExecutionSummary {
        status: TaskStatus,
        attempts: u32,
        duration_ms: Option<u64>,
        patches_applied: usize,
        patches_failed: usize,
        error: Option<String>,
        error_type: Option<FailureKind>,
    },
    QuickValidatePassed {
        command: String,
        duration_ms: u64,
    },
    ConcurrencyReduced {
        from: usize,
        to: usize,
        reason: String,
    },
    ConcurrencyIncreased {
        from: usize,
        to: usize,
        reason: String,
    },
    ResourceDownscale {
        cpu_usage: f64,
        memory_usage: u64,
        concurrency: usize,
        hysteresis_active: bool,
        reason: String,
    },
    ResourceRestore {
        cpu_usage: f64,
        memory_usage: u64,
        concurrency: usize,
        reason: String,
    },
    ResourceExhausted {
        cpu_usage: f64,
        memory_usage: u64,
        concurrency: usize,
        reason: String,
    },
    SessionWorkspaceUpdated {
        files: Vec<String>,
        patches_applied: usize,
    },
    ManualInterventionRequested {
        reason: String,
        conflicts_with: Vec<String>,
        files: Vec<String>,
    },
    UnderstandingValidated {
        restatement: String,
    },
    UnderstandingFailed {
        restatement: String,
        reason: String,
    },
    DecompositionCompleted {
        source: String,
        task_count: usize,
        dependency_count: usize,
    },
    DecompositionFailed {
        reason: String,
    },
    CancelRequested {
        policy: CancelPolicy,
        in_flight: usize,
    },
    ReportWritten {
        report_path: String,
    },
    ReportWriteFailed {
        report_path: String,
        error: String,
    },
    OrchestrationCompleted {
        status: String,
        success_rate: f64,
        total_tasks: usize,
        completed_tasks: usize,
        failed_tasks: usize,
        report_path: String,
    },
    OrchestrationFailed {
        status: String,
        success_rate: f64,
        total_tasks: usize,
        completed_tasks: usize,
        failed_tasks: usize,
        failed_task_ids: Vec<String>,
        failure_reason: String,
        report_path: Option<String>,
    },
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            EventData::Start { .. } => EventKind::Start,
            EventData::TaskScheduled { .. } => EventKind::TaskScheduled,
            EventData::TaskStarted { .. } => EventKind::TaskStarted,
            EventData::ToolUse { .. } => EventKind::ToolUse,
            EventData::TaskCompleted { .. } => EventKind::TaskCompleted,
            EventData::TaskFailed { .. } => EventKind::TaskFailed,
            EventData::TaskRetryScheduled { .. } => EventKind::TaskRetryScheduled,
            EventData::PatchGenerated { .. } => EventKind::PatchGenerated,
            EventData::PatchApplied { .. } => EventKind::PatchApplied,
            EventData::PatchFailed { .. } => EventKind::PatchFailed,
            EventData::PatchGenerationFailed { .. } => EventKind::PatchGenerationFailed,
            EventData::TaskExecutionSummary { .. } => EventKind::TaskExecutionSummary,
            EventData::QuickValidatePassed { .. } => EventKind::QuickValidatePassed,
            EventData::ConcurrencyReduced { .. } => EventKind::ConcurrencyReduced,
            EventData::ConcurrencyIncreased { .. } => EventKind::ConcurrencyIncreased,
            EventData::ResourceDownscale { .. } => EventKind::ResourceDownscale,
            EventData::ResourceRestore { .. } => EventKind::ResourceRestore,
            EventData::ResourceExhausted { .. } => EventKind::ResourceExhausted,
            EventData::SessionWorkspaceUpdated { .. } => EventKind::SessionWorkspaceUpdated,
            EventData::ManualInterventionRequested { .. } => {
                EventKind::ManualInterventionRequested
            }
            EventData::UnderstandingValidated { .. } => EventKind::UnderstandingValidated,
            EventData::UnderstandingFailed { .. } => EventKind::UnderstandingFailed,
            EventData::DecompositionCompleted { .. } => EventKind::DecompositionCompleted,
            EventData::DecompositionFailed { .. } => EventKind::DecompositionFailed,
            EventData::CancelRequested { .. } => EventKind::CancelRequested,
            EventData::ReportWritten { .. } => EventKind::ReportWritten,
            EventData::ReportWriteFailed { .. } => EventKind::ReportWriteFailed,
            EventData::OrchestrationCompleted { .. } => EventKind::OrchestrationCompleted,
            EventData::OrchestrationFailed { .. } => EventKind::OrchestrationFailed,
        }
    }

    /// The `data` object on its own.
    fn into_payload(self) -> Result<Value> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("data")
            .map(Value::take)
            .unwrap_or_else(|| Value::Object(Map::new())))
    }
}

/// One emitted line of the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StreamEvent {
    pub event: EventKind,
    pub timestamp: String,
    pub orchestration_id: String,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub data: Value,
}

/// Task and agent an event is about. Empty for run-level events.
#[derive(Debug, Clone, Default)]
pub struct EventScope {
    pub task_id: Option<String>,
    pub role: Option<String>,
    pub agent_id: Option<String>,
}

impl EventScope {
    pub fn run() -> Self {
        Self::default()
    }

    pub fn task(task: &Task) -> Self {
        Self {
            task_id: Some(task.id.to_string()),
            role: task.role.clone(),
            agent_id: None,
        }
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self
    }
}

/// Which events reach stdout. The save file always receives every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdoutMode {
    /// `start` and the terminal event only.
    #[default]
    Essential,
    All,
    Off,
}

impl StdoutMode {
    fn admits(&self, kind: EventKind) -> bool {
        match self {
            StdoutMode::Essential => kind == EventKind::Start || kind.is_terminal(),
            StdoutMode::All => true,
            StdoutMode::Off => false,
        }
    }
}

const ALLOWED_FIELDS: [&str; 8] = [
    "event",
    "timestamp",
    "orchestrationId",
    "seq",
    "taskId",
    "role",
    "agentId",
    "data",
];

const REQUIRED_FIELDS: [&str; 5] = ["event", "timestamp", "orchestrationId", "seq", "data"];

/// RFC3339 in UTC with an optional 1-9 digit fraction.
static RFC3339_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4})-(\d{2})-(\d{2})T(\d{2}):(\d{2}):(\d{2})(?:\.(\d{1,9}))?Z$").unwrap()
});

/// Check an arbitrary JSON value against the stream event schema.
pub fn validate_stream_event(value: &Value) -> Result<()> {
    let Some(obj) = value.as_object() else {
        return Err(Error::EventValidation {
            event: "<root>".to_string(),
            issues: vec!["stream event must be an object".to_string()],
        });
    };

    let mut issues = Vec::new();

    for key in obj.keys() {
        if !ALLOWED_FIELDS.contains(&key.as_str()) {
            issues.push(format!("{}: unknown property", key));
        }
    }
    for field in REQUIRED_FIELDS {
        if !obj.contains_key(field) {
            issues.push(format!("{}: is required", field));
        }
    }

    match obj.get("event") {
        Some(Value::String(name)) if EventKind::parse(name).is_none() => {
            issues.push(format!("event: {} is not an allowed event type", name));
        }
        Some(Value::String(_)) | None => {}
        Some(_) => issues.push("event: must be a string".to_string()),
    }

    match obj.get("timestamp") {
        Some(Value::String(ts)) => {
            if !RFC3339_RE.is_match(ts) || DateTime::parse_from_rfc3339(ts).is_err() {
                issues.push(format!("timestamp: {} is not RFC3339 UTC", ts));
            }
        }
        Some(_) => issues.push("timestamp: must be a string".to_string()),
        None => {}
    }

    if let Some(id) = obj.get("orchestrationId") {
        if !id.is_string() {
            issues.push("orchestrationId: must be a string".to_string());
        }
    }

    if let Some(seq) = obj.get("seq") {
        if seq.as_u64().is_none() {
            issues.push("seq: must be a non-negative integer".to_string());
        }
    }

    if let Some(data) = obj.get("data") {
        if !data.is_object() {
            issues.push("data: must be a plain object".to_string());
        }
    }

    for field in ["taskId", "role", "agentId"] {
        if let Some(v) = obj.get(field) {
            if !v.is_string() {
                issues.push(format!("{}: must be a string", field));
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        let event = obj
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or("<unknown>")
            .to_string();
        Err(Error::EventValidation { event, issues })
    }
}

/// Writes the event stream of one orchestration.
pub struct EventEmitter {
    orchestration_id: String,
    last_seq: u64,
    stdout: Box<dyn Write + Send>,
    stdout_mode: StdoutMode,
    save_file: Option<File>,
    /// Rewritten with `last_seq` after every event.
    seq_file: Option<PathBuf>,
    redactor: Redactor,
    history: Option<Vec<StreamEvent>>,
}

impl EventEmitter {
    pub fn new(orchestration_id: &str, stdout: Box<dyn Write + Send>, mode: StdoutMode) -> Self {
        Self {
            orchestration_id: orchestration_id.to_string(),
            last_seq: 0,
            stdout,
            stdout_mode: mode,
            save_file: None,
            seq_file: None,
            redactor: Redactor::default(),
            history: None,
        }
    }

    /// Continue numbering after `last_seq` (resumed runs).
    pub fn starting_after(mut self, last_seq: u64) -> Self {
        self.last_seq = last_seq;
        self
    }

    /// Also append every event line to `path`.
    pub fn save_to(mut self, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        tracing::debug!(path = %path.display(), "saving event stream");
        self.save_file = Some(file);
        Ok(self)
    }

    /// Record the latest `seq` in `path` as each event goes out, so an
    /// interrupted run can be resumed without reusing numbers.
    pub fn track_seq(mut self, path: &Path) -> Self {
        self.seq_file = Some(path.to_path_buf());
        self.record_seq();
        self
    }

    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Keep every emitted event in memory, readable through `history`.
    pub fn capture_history(mut self) -> Self {
        self.history = Some(Vec::new());
        self
    }

    pub fn orchestration_id(&self) -> &str {
        &self.orchestration_id
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Captured events; empty unless `capture_history` was requested.
    pub fn history(&self) -> &[StreamEvent] {
        self.history.as_deref().unwrap_or_default()
    }

    /// Emit a run-level event.
    pub fn emit(&mut self, data: EventData) -> Result<u64> {
        self.emit_scoped(EventScope::run(), data)
    }

    /// Stamp, redact, validate and write one event. Returns its `seq`.
    ///
    /// Validation failure means the emitter produced a malformed event,
    /// which is an internal error; nothing is written in that case.
    pub fn emit_scoped(&mut self, scope: EventScope, data: EventData) -> Result<u64> {
        let kind = data.kind();
        let mut payload = data.into_payload()?;
        self.redactor.redact(&mut payload);
        let event = StreamEvent {
            event: kind,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            orchestration_id: self.orchestration_id.clone(),
            seq: self.last_seq + 1,
            task_id: scope.task_id,
            role: scope.role,
            agent_id: scope.agent_id,
            data: payload,
        };

        let value = serde_json::to_value(&event)?;
        validate_stream_event(&value)?;
        let line = serde_json::to_string(&value)?;

        if let Some(file) = self.save_file.as_mut() {
            writeln!(file, "{}", line)?;
            file.flush()?;
        }
        if self.stdout_mode.admits(kind) {
            writeln!(self.stdout, "{}", line)?;
            self.stdout.flush()?;
        }

        let seq = event.seq;
        self.last_seq = seq;
        self.record_seq();
        tracing::debug!(seq, event = %kind, task = ?event.task_id, "event emitted");
        if let Some(history) = self.history.as_mut() {
            history.push(event);
        }
        Ok(seq)
    }

    fn record_seq(&self) {
        let Some(path) = &self.seq_file else {
            return;
        };
        if let Err(e) = write_seq(path, self.last_seq) {
            tracing::warn!(path = %path.display(), error = %e, "failed to record last seq");
        }
    }
}

fn write_seq(path: &Path, seq: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, seq.to_string())?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Last `seq` recorded by [`EventEmitter::track_seq`], if the file exists.
pub fn read_seq(path: &Path) -> Result<Option<u64>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    contents
        .trim()
        .parse()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("invalid seq file {}: {}", path.display(), e)))
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("orchestration_id", &self.orchestration_id)
            .field("last_seq", &self.last_seq)
            .field("stdout_mode", &self.stdout_mode)
            .finish()
    }
}

/// Read a saved stream back, one event per non-empty line.
pub fn read_stream(path: &Path) -> Result<Vec<StreamEvent>> {
    let contents = std::fs::read_to_string(path)?;
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let value: Value = serde_json::from_str(line)?;
            validate_stream_event(&value)?;
            Ok(serde_json::from_value(value)?)
        })
        .collect()
}
