//! Scheduler for concurrent task execution.
//!
//! The Scheduler is the single writer of orchestration state. It promotes
//! tasks whose dependencies are satisfied, dispatches them to the worker
//! pool up to the current concurrency limit, and handles completions,
//! failures and retries as workers report back. A resource monitor, when
//! present, shrinks and grows the limit between polls.
//!
//! Every state change is emitted to the event stream from this loop, which
//! is what keeps `seq` strictly ordered.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::agent::AgentId;
use crate::core::graph::TaskGraph;
use crate::core::patch::PatchOutcome;
use crate::core::task::{FailureKind, Task, TaskId, TaskStatus};
use crate::error::Result;
use crate::orchestration::events::{EventData, EventEmitter, EventScope};
use crate::orchestration::executor::{ExecutionRequest, TaskExecutor};
use crate::orchestration::patches::PatchTracker;
use crate::orchestration::pool::{CancelPolicy, WorkerEvent, WorkerPool};
use crate::orchestration::resources::{ResourceDecision, ResourceMonitor, ResourceSnapshot};
use crate::state::RolloutStore;

const WORKER_CHANNEL_SIZE: usize = 64;

/// Tool name reported for applied patches.
pub const PATCH_TOOL: &str = "patch_applier";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound for the concurrency limit.
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub cancel_policy: CancelPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            poll_interval: Duration::from_secs(1),
            cancel_policy: CancelPolicy::Drain,
        }
    }
}

/// What the scheduler hands back once every task is settled.
#[derive(Debug)]
pub struct ScheduleOutcome {
    pub tasks: Vec<Task>,
    pub cancelled: bool,
    pub emitter: EventEmitter,
}

pub struct Scheduler {
    /// Tasks in declaration order.
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    pool: WorkerPool,
    worker_rx: mpsc::Receiver<WorkerEvent>,
    monitor: Option<ResourceMonitor>,
    patches: PatchTracker,
    emitter: EventEmitter,
    store: Option<RolloutStore>,
    config: SchedulerConfig,
    /// Current concurrency limit, between 1 and `max_concurrency`.
    limit: usize,
    /// Cleared while resources are exhausted at the floor.
    admission_open: bool,
    exhausted: bool,
    cancel: CancellationToken,
    cancelled: bool,
}

impl Scheduler {
    /// Create a scheduler over `tasks`.
    ///
    /// # Errors
    /// Fails if the tasks do not form a valid dependency graph.
    pub fn new(
        tasks: Vec<Task>,
        executor: Arc<dyn TaskExecutor>,
        emitter: EventEmitter,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        TaskGraph::build(&tasks)?;
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        let limit = config.max_concurrency.max(1);
        let (tx, rx) = mpsc::channel(WORKER_CHANNEL_SIZE);
        Ok(Self {
            tasks,
            index,
            pool: WorkerPool::new(executor, limit, tx),
            worker_rx: rx,
            monitor: None,
            patches: PatchTracker::new(),
            emitter,
            store: None,
            config,
            limit,
            admission_open: true,
            exhausted: false,
            cancel,
            cancelled: false,
        })
    }

    pub fn with_monitor(mut self, monitor: ResourceMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_store(mut self, store: RolloutStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Drive every task to a terminal state.
    pub async fn run(mut self) -> Result<ScheduleOutcome> {
        let poll = self.config.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            tasks = self.tasks.len(),
            limit = self.limit,
            "scheduler started"
        );

        loop {
            if !self.cancelled && self.cancel.is_cancelled() {
                self.on_cancel()?;
            }
            if !self.cancelled {
                self.promote().await?;
                self.dispatch()?;
            }
            if self.is_done() {
                break;
            }

            let retry_at = self.next_retry_deadline();
            let has_monitor = self.monitor.is_some();
            let watching_cancel = !self.cancelled;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if watching_cancel => {
                    self.on_cancel()?;
                }
                Some(event) = self.worker_rx.recv() => {
                    self.on_worker_event(event).await?;
                }
                _ = ticker.tick(), if has_monitor => {
                    self.on_resource_tick()?;
                }
                _ = sleep_until(retry_at) => {}
            }
        }

        if self.cancelled {
            self.settle_cancelled().await?;
        }

        tracing::info!(
            completed = self.count(TaskStatus::Completed),
            failed = self.count(TaskStatus::Failed),
            cancelled = self.cancelled,
            "scheduler finished"
        );

        Ok(ScheduleOutcome {
            tasks: std::mem::take(&mut self.tasks),
            cancelled: self.cancelled,
            emitter: self.emitter,
        })
    }

    fn is_done(&self) -> bool {
        if self.pool.active_count() > 0 {
            return false;
        }
        self.cancelled || self.tasks.iter().all(Task::is_finished)
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    fn next_retry_deadline(&self) -> Option<Instant> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Scheduled)
            .filter_map(|t| t.not_before)
            .min()
    }

    /// Move pending tasks forward: to `scheduled` once every dependency
    /// completed, or to `failed` once any dependency failed for good.
    async fn promote(&mut self) -> Result<()> {
        loop {
            let mut changed = false;
            for i in 0..self.tasks.len() {
                if self.tasks[i].status != TaskStatus::Pending {
                    continue;
                }
                let failed_dep = self.tasks[i]
                    .dependencies
                    .iter()
                    .find(|d| self.status_of(d) == Some(TaskStatus::Failed))
                    .cloned();
                if let Some(dep) = failed_dep {
                    self.fail_on_dependency(i, &dep).await?;
                    changed = true;
                    continue;
                }
                let ready = self.tasks[i]
                    .dependencies
                    .iter()
                    .all(|d| self.status_of(d) == Some(TaskStatus::Completed));
                if ready {
                    self.tasks[i].schedule();
                    let task = &self.tasks[i];
                    let data = EventData::TaskScheduled {
                        title: task.title.clone(),
                        dependencies: task.dependencies.iter().map(|d| d.to_string()).collect(),
                    };
                    self.emit_task(i, None, data)?;
                    changed = true;
                }
            }
            if !changed {
                return Ok(());
            }
        }
    }

    fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.index.get(id).map(|&i| self.tasks[i].status)
    }

    async fn fail_on_dependency(&mut self, i: usize, dep: &TaskId) -> Result<()> {
        let message = format!("dependency {} failed", dep);
        tracing::info!(task = %self.tasks[i].id, dependency = %dep, "dependency failed, skipping task");
        self.tasks[i].fail(&message, FailureKind::DependencyFailed, None);
        let attempt = self.tasks[i].attempts;
        self.emit_task(
            i,
            None,
            EventData::TaskFailed {
                attempt,
                error: message,
                error_type: FailureKind::DependencyFailed,
                will_retry: false,
            },
        )?;
        self.finish_task(i, None).await
    }

    /// Start scheduled tasks while slots are free, in declaration order.
    fn dispatch(&mut self) -> Result<usize> {
        if !self.admission_open || self.cancel.is_cancelled() {
            return Ok(0);
        }
        let now = Instant::now();
        let mut dispatched = 0;
        for i in 0..self.tasks.len() {
            if !self.pool.has_capacity() {
                break;
            }
            let task = &self.tasks[i];
            if task.status != TaskStatus::Scheduled || task.is_backing_off(now) {
                continue;
            }

            self.tasks[i].start();
            let task = &self.tasks[i];
            let request = ExecutionRequest::for_task(task);
            let agent = self.pool.spawn(request, task.timeout())?;
            let data = EventData::TaskStarted {
                attempt: task.attempts,
                max_attempts: task.retry_policy.max_attempts,
            };
            tracing::debug!(task = %task.id, agent = %agent, attempt = task.attempts, "task dispatched");
            self.emit_task(i, Some(agent), data)?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn on_worker_event(&mut self, event: WorkerEvent) -> Result<()> {
        if let Err(e) = self.pool.complete(&event.agent_id) {
            tracing::warn!(error = %e, "result from unknown worker");
            return Ok(());
        }
        let Some(&i) = self.index.get(&event.task_id) else {
            tracing::warn!(task = %event.task_id, "result for unknown task");
            return Ok(());
        };
        let agent = event.agent_id;

        let applied_files = self.record_patches(i, agent, &event)?;

        match event.outcome.failure {
            None => {
                if let Some(validation) = &event.outcome.validation {
                    self.emit_task(
                        i,
                        Some(agent),
                        EventData::QuickValidatePassed {
                            command: validation.command.clone(),
                            duration_ms: validation.duration_ms,
                        },
                    )?;
                }
                self.tasks[i].complete(event.duration_ms);
                self.emit_task(
                    i,
                    Some(agent),
                    EventData::TaskCompleted {
                        attempt: event.attempt,
                        duration_ms: event.duration_ms,
                    },
                )?;
                if !applied_files.is_empty() {
                    let patches_applied = self.tasks[i].patches.iter().filter(|p| p.is_applied()).count();
                    self.emit_task(
                        i,
                        Some(agent),
                        EventData::SessionWorkspaceUpdated {
                            files: applied_files.into_iter().collect(),
                            patches_applied,
                        },
                    )?;
                }
                self.finish_task(i, Some(agent)).await
            }
            Some(failure) => {
                let task = &self.tasks[i];
                let will_retry = failure.kind != FailureKind::Cancelled
                    && !self.cancelled
                    && task.retry_policy.allows_retry(task.attempts);
                tracing::info!(
                    task = %task.id,
                    attempt = event.attempt,
                    kind = ?failure.kind,
                    will_retry,
                    "task attempt failed"
                );

                self.tasks[i].fail(&failure.message, failure.kind, Some(event.duration_ms));
                self.emit_task(
                    i,
                    Some(agent),
                    EventData::TaskFailed {
                        attempt: event.attempt,
                        error: failure.message,
                        error_type: failure.kind,
                        will_retry,
                    },
                )?;

                if will_retry {
                    let task = &self.tasks[i];
                    let delay = task.retry_policy.delay_after(task.attempts);
                    let next_attempt = task.attempts + 1;
                    self.tasks[i].retry_after(delay);
                    self.emit_task(
                        i,
                        None,
                        EventData::TaskRetryScheduled {
                            next_attempt,
                            delay_ms: delay.as_millis() as u64,
                        },
                    )?;
                    Ok(())
                } else {
                    self.finish_task(i, Some(agent)).await
                }
            }
        }
    }

    /// Record the attempt's patches and emit their events. Returns the
    /// files changed by this attempt's applied patches.
    fn record_patches(
        &mut self,
        i: usize,
        agent: AgentId,
        event: &WorkerEvent,
    ) -> Result<BTreeSet<String>> {
        let mut applied_files = BTreeSet::new();
        let task_id = self.tasks[i].id.clone();

        for report in &event.outcome.patches {
            let recorded = self.patches.record(&task_id, report.clone());
            let patch = recorded.patch;
            self.tasks[i].patches.push(patch.clone());

            if patch.outcome == PatchOutcome::GenerationFailed {
                self.emit_task(
                    i,
                    Some(agent),
                    EventData::PatchGenerationFailed {
                        patch_id: patch.patch_id.clone(),
                        sequence: patch.sequence,
                        reason: patch.reason.clone().unwrap_or_default(),
                    },
                )?;
                continue;
            }

            self.emit_task(
                i,
                Some(agent),
                EventData::PatchGenerated {
                    patch_id: patch.patch_id.clone(),
                    sequence: patch.sequence,
                    target_files: patch.target_files.clone(),
                },
            )?;

            if patch.is_applied() {
                applied_files.extend(patch.target_files.iter().cloned());
                let conflicts: Vec<String> =
                    recorded.conflicts_with.iter().map(|t| t.to_string()).collect();
                self.emit_task(
                    i,
                    Some(agent),
                    EventData::ToolUse {
                        tool: PATCH_TOOL.to_string(),
                        patch_id: patch.patch_id.clone(),
                        target_files: patch.target_files.clone(),
                    },
                )?;
                self.emit_task(
                    i,
                    Some(agent),
                    EventData::PatchApplied {
                        patch_id: patch.patch_id.clone(),
                        sequence: patch.sequence,
                        target_files: patch.target_files.clone(),
                        conflicts_with: conflicts.clone(),
                    },
                )?;
                if !conflicts.is_empty() {
                    self.emit_task(
                        i,
                        Some(agent),
                        EventData::ManualInterventionRequested {
                            reason: "patch overlaps files changed by other tasks".to_string(),
                            conflicts_with: conflicts,
                            files: patch.target_files.clone(),
                        },
                    )?;
                }
            } else {
                self.emit_task(
                    i,
                    Some(agent),
                    EventData::PatchFailed {
                        patch_id: patch.patch_id.clone(),
                        sequence: patch.sequence,
                        target_files: patch.target_files.clone(),
                        reason: patch.reason.clone().unwrap_or_default(),
                    },
                )?;
            }
        }
        Ok(applied_files)
    }

    /// Emit the summary of a task that reached a terminal state and
    /// persist the run.
    async fn finish_task(&mut self, i: usize, agent: Option<AgentId>) -> Result<()> {
        let task = &self.tasks[i];
        let applied = task.patches.iter().filter(|p| p.is_applied()).count();
        let data = EventData::TaskExecutionSummary {
            status: task.status,
            attempts: task.attempts,
            duration_ms: task.duration_ms,
            patches_applied: applied,
            patches_failed: task.patches.len() - applied,
            error: task.last_error.clone(),
            error_type: task.last_failure,
        };
        self.emit_task(i, agent, data)?;
        self.persist().await;
        Ok(())
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(&self.tasks, self.emitter.last_seq()).await {
            tracing::warn!(path = %store.path().display(), error = %e, "failed to persist rollout state");
        }
    }

    fn on_cancel(&mut self) -> Result<()> {
        self.cancelled = true;
        let in_flight = self.pool.active_count();
        tracing::info!(policy = %self.config.cancel_policy, in_flight, "cancel requested");
        self.emitter.emit(EventData::CancelRequested {
            policy: self.config.cancel_policy,
            in_flight,
        })?;
        if self.config.cancel_policy == CancelPolicy::Abort {
            self.pool.abort_all();
        }
        Ok(())
    }

    /// Fail every task that never got to run because of cancellation.
    async fn settle_cancelled(&mut self) -> Result<()> {
        for i in 0..self.tasks.len() {
            if self.tasks[i].is_waiting() {
                let message = "cancelled before completion";
                self.tasks[i].fail(message, FailureKind::Cancelled, None);
                let attempt = self.tasks[i].attempts;
                self.emit_task(
                    i,
                    None,
                    EventData::TaskFailed {
                        attempt,
                        error: message.to_string(),
                        error_type: FailureKind::Cancelled,
                        will_retry: false,
                    },
                )?;
                self.finish_task(i, None).await?;
            }
        }
        Ok(())
    }

    fn on_resource_tick(&mut self) -> Result<()> {
        let Some(monitor) = self.monitor.as_mut() else {
            return Ok(());
        };
        let (snapshot, decision) = monitor.poll();
        if decision.should_downscale {
            self.downscale(&snapshot, &decision)
        } else if decision.should_upscale {
            self.upscale(&snapshot, &decision)
        } else {
            Ok(())
        }
    }

    fn downscale(&mut self, snapshot: &ResourceSnapshot, decision: &ResourceDecision) -> Result<()> {
        if self.limit > 1 {
            let from = self.limit;
            self.set_limit(from - 1);
            self.emitter.emit(EventData::ConcurrencyReduced {
                from,
                to: self.limit,
                reason: decision.reason.clone(),
            })?;
            self.emitter.emit(EventData::ResourceDownscale {
                cpu_usage: snapshot.cpu_usage,
                memory_usage: snapshot.memory_usage,
                concurrency: self.limit,
                hysteresis_active: decision.hysteresis_active,
                reason: decision.reason.clone(),
            })?;
        } else if !self.exhausted {
            self.exhausted = true;
            self.admission_open = false;
            tracing::warn!(reason = %decision.reason, "resources exhausted at minimum concurrency");
            self.emitter.emit(EventData::ResourceExhausted {
                cpu_usage: snapshot.cpu_usage,
                memory_usage: snapshot.memory_usage,
                concurrency: self.limit,
                reason: decision.reason.clone(),
            })?;
        }
        Ok(())
    }

    fn upscale(&mut self, snapshot: &ResourceSnapshot, decision: &ResourceDecision) -> Result<()> {
        let reopened = self.exhausted;
        self.exhausted = false;
        self.admission_open = true;

        let raised = self.limit < self.config.max_concurrency;
        if raised {
            let from = self.limit;
            self.set_limit(from + 1);
            self.emitter.emit(EventData::ConcurrencyIncreased {
                from,
                to: self.limit,
                reason: decision.reason.clone(),
            })?;
        }
        if raised || reopened {
            self.emitter.emit(EventData::ResourceRestore {
                cpu_usage: snapshot.cpu_usage,
                memory_usage: snapshot.memory_usage,
                concurrency: self.limit,
                reason: decision.reason.clone(),
            })?;
        }
        Ok(())
    }

    fn set_limit(&mut self, limit: usize) {
        tracing::info!(from = self.limit, to = limit, "concurrency limit changed");
        self.limit = limit;
        self.pool.set_capacity(limit);
    }

    fn emit_task(&mut self, i: usize, agent: Option<AgentId>, data: EventData) -> Result<()> {
        let mut scope = EventScope::task(&self.tasks[i]);
        if let Some(agent) = agent {
            scope = scope.with_agent(agent);
        }
        self.emitter.emit_scoped(scope, data)?;
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
