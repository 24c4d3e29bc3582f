//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted task executor with failure, patch and concurrency tracking;
//!   tasks declaring a `validate` command report it as passed
//! - A scripted resource probe
//! - Captured stdout and temporary session directories

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tempfile::TempDir;

use maestro::config::Config;
use maestro::core::patch::PatchReport;
use maestro::core::task::{BackoffKind, FailureKind};
use maestro::orchestration::events::read_stream;
use maestro::orchestration::resources::{ResourceProbe, ResourceSnapshot};
use maestro::orchestration::{
    ExecutionOutcome, ExecutionRequest, OrchestrationOptions, Orchestrator, RunMode, StdoutMode,
    StreamEvent, TaskExecutor,
};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
struct Script {
    delay: Duration,
    always_fail: HashSet<String>,
    fail_first: HashMap<String, u32>,
    patches: HashMap<String, Vec<PatchReport>>,
}

#[derive(Debug, Default)]
struct Stats {
    running: AtomicUsize,
    peak: AtomicUsize,
    log: Mutex<Vec<String>>,
}

/// Executor whose outcomes are fixed per task id.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    script: Arc<Script>,
    stats: Arc<Stats>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt sleeps for `ms` before reporting.
    pub fn with_delay(mut self, ms: u64) -> Self {
        Arc::make_mut(&mut self.script).delay = Duration::from_millis(ms);
        self
    }

    /// These tasks fail on every attempt.
    pub fn failing(mut self, ids: &[&str]) -> Self {
        let script = Arc::make_mut(&mut self.script);
        script.always_fail.extend(ids.iter().map(|s| s.to_string()));
        self
    }

    /// `id` fails its first `attempts` attempts, then succeeds.
    pub fn failing_first(mut self, id: &str, attempts: u32) -> Self {
        Arc::make_mut(&mut self.script)
            .fail_first
            .insert(id.to_string(), attempts);
        self
    }

    /// Patches reported by every attempt of `id`.
    pub fn with_patches(mut self, id: &str, patches: Vec<PatchReport>) -> Self {
        Arc::make_mut(&mut self.script)
            .patches
            .insert(id.to_string(), patches);
        self
    }

    /// Highest number of attempts observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }

    /// `start:<id>` and `end:<id>` entries in the order they happened.
    pub fn log(&self) -> Vec<String> {
        self.stats.log.lock().unwrap().clone()
    }

    /// Task ids in the order their attempts started.
    pub fn started(&self) -> Vec<String> {
        self.log()
            .iter()
            .filter_map(|e| e.strip_prefix("start:").map(String::from))
            .collect()
    }

    pub fn position(&self, entry: &str) -> usize {
        self.log()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{} not in log {:?}", entry, self.log()))
    }
}

impl TaskExecutor for ScriptedExecutor {
    fn execute(&self, request: ExecutionRequest) -> BoxFuture<'static, ExecutionOutcome> {
        let script = Arc::clone(&self.script);
        let stats = Arc::clone(&self.stats);
        Box::pin(async move {
            let id = request.task_id.to_string();
            let now = stats.running.fetch_add(1, Ordering::SeqCst) + 1;
            stats.peak.fetch_max(now, Ordering::SeqCst);
            stats.log.lock().unwrap().push(format!("start:{}", id));

            tokio::time::sleep(script.delay).await;

            stats.running.fetch_sub(1, Ordering::SeqCst);
            stats.log.lock().unwrap().push(format!("end:{}", id));

            let patches = script.patches.get(&id).cloned().unwrap_or_default();
            let fails = script.always_fail.contains(&id)
                || script
                    .fail_first
                    .get(&id)
                    .is_some_and(|n| request.attempt <= *n);
            if fails {
                ExecutionOutcome::failed(
                    FailureKind::Execution,
                    format!("{} failed on attempt {}", id, request.attempt),
                )
                .with_patches(patches)
            } else {
                let outcome = ExecutionOutcome::succeeded().with_patches(patches);
                match request.validate.as_deref() {
                    Some(check) => outcome.with_validation(check, 3),
                    None => outcome,
                }
            }
        })
    }
}

/// Probe replaying a list of CPU samples, then repeating the last one.
pub struct ScriptedProbe {
    samples: VecDeque<f64>,
    last: f64,
}

impl ScriptedProbe {
    pub fn new(samples: &[f64]) -> Self {
        Self {
            samples: samples.iter().copied().collect(),
            last: samples.last().copied().unwrap_or(0.0),
        }
    }
}

impl ResourceProbe for ScriptedProbe {
    fn capture(&mut self) -> ResourceSnapshot {
        let cpu = self.samples.pop_front().unwrap_or(self.last);
        ResourceSnapshot::new(cpu, GIB)
    }

    fn total_memory(&mut self) -> u64 {
        16 * GIB
    }
}

/// Stdout stand-in shared between the orchestrator and the test.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    /// Every line written so far, parsed as JSON.
    pub fn lines(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A temporary workspace for one orchestration run.
pub struct TestSession {
    pub dir: TempDir,
    pub out: SharedBuffer,
    pub config: Config,
}

impl TestSession {
    /// Workspace that looks like a cargo project, with fast retries and
    /// resource polling.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        std::fs::write(
            dir.path().join("Cargo.toml"),
            "[package]\nname = \"fixture\"\nversion = \"0.1.0\"\n",
        )
        .expect("Failed to write Cargo.toml");

        let mut config = Config::default();
        config.retry.backoff = BackoffKind::Fixed;
        config.retry.initial_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        config.resources.poll_interval_ms = 5;

        Self {
            dir,
            out: SharedBuffer::default(),
            config,
        }
    }

    pub fn workdir(&self) -> &Path {
        self.dir.path()
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.dir.path().join("sessions")
    }

    pub fn stream_path(&self) -> PathBuf {
        self.dir.path().join("events.jsonl")
    }

    pub fn write_tasks(&self, json: &str) -> PathBuf {
        let path = self.dir.path().join("tasks.json");
        std::fs::write(&path, json).expect("Failed to write tasks file");
        path
    }

    /// Orchestrator over `executor`, writing stdout into `self.out`, with
    /// resource scaling disabled.
    pub fn orchestrator(&self, executor: &ScriptedExecutor) -> Orchestrator {
        Orchestrator::new(self.config.clone(), self.workdir())
            .with_executor(Arc::new(executor.clone()))
            .with_probe(None)
            .with_sessions_dir(&self.sessions_dir())
            .with_stdout(Box::new(self.out.clone()))
    }

    /// Manual-mode options for `tasks_file`, saving the full stream.
    pub fn manual(&self, tasks_file: &Path) -> OrchestrationOptions {
        OrchestrationOptions {
            requirement: "integration run".to_string(),
            mode: RunMode::Manual,
            tasks_file: Some(tasks_file.to_path_buf()),
            save_stream: Some(self.stream_path()),
            stdout_mode: Some(StdoutMode::Essential),
            ..Default::default()
        }
    }

    /// Every saved event, validated.
    pub fn events(&self) -> Vec<StreamEvent> {
        read_stream(&self.stream_path()).expect("saved stream should validate")
    }
}

/// Event names in emission order.
pub fn names(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.event.as_str()).collect()
}

/// Event names for one task, in emission order.
pub fn task_names(events: &[StreamEvent], task: &str) -> Vec<&'static str> {
    events
        .iter()
        .filter(|e| e.task_id.as_deref() == Some(task))
        .map(|e| e.event.as_str())
        .collect()
}

/// `data` of the last summary emitted for `task`.
pub fn summary(events: &[StreamEvent], task: &str) -> Value {
    events
        .iter()
        .rev()
        .find(|e| e.event.as_str() == "task_execution_summary" && e.task_id.as_deref() == Some(task))
        .map(|e| e.data.clone())
        .unwrap_or_else(|| panic!("no summary for {}", task))
}

/// `n` independent tasks `t1..tn` as a tasks file body.
pub fn independent_tasks(n: usize) -> String {
    let tasks: Vec<Value> = (1..=n)
        .map(|i| serde_json::json!({ "id": format!("t{}", i), "title": format!("Task {}", i) }))
        .collect();
    Value::Array(tasks).to_string()
}
