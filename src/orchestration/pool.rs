//! Worker pool for concurrent task attempts.
//!
//! The `WorkerPool` runs each dispatched attempt as its own tokio task,
//! enforcing a capacity limit that the scheduler can change at runtime.
//! Finished attempts are reported back over a channel, so the pool never
//! touches orchestration state itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentId;
use crate::core::task::{FailureKind, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::executor::{ExecutionOutcome, ExecutionRequest, TaskExecutor};

/// What happens to running attempts when the run is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelPolicy {
    /// Let in-flight attempts finish; dispatch nothing new.
    #[default]
    Drain,
    /// Cancel in-flight attempts immediately.
    Abort,
}

impl std::fmt::Display for CancelPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelPolicy::Drain => write!(f, "drain"),
            CancelPolicy::Abort => write!(f, "abort"),
        }
    }
}

/// A finished attempt, sent from a worker to the scheduler.
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub attempt: u32,
    pub outcome: ExecutionOutcome,
    pub duration_ms: u64,
}

/// Bounded set of running workers.
pub struct WorkerPool {
    executor: Arc<dyn TaskExecutor>,
    /// Running workers and the task each one is attempting.
    workers: HashMap<AgentId, TaskId>,
    capacity: usize,
    event_tx: mpsc::Sender<WorkerEvent>,
    /// Parent of every worker's token.
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        capacity: usize,
        event_tx: mpsc::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            executor,
            workers: HashMap::new(),
            capacity,
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Start an attempt on a new worker.
    ///
    /// # Errors
    /// `WorkerPoolFull` if every slot is taken.
    pub fn spawn(&mut self, request: ExecutionRequest, timeout: Duration) -> Result<AgentId> {
        if !self.has_capacity() {
            return Err(Error::WorkerPoolFull {
                capacity: self.capacity,
            });
        }

        let agent_id = AgentId::new();
        let task_id = request.task_id.clone();
        let attempt = request.attempt;
        let worker_token = self.cancel.child_token();
        let executor = Arc::clone(&self.executor);
        let tx = self.event_tx.clone();
        let worker_task = task_id.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let run = tokio::spawn(executor.execute(request));
            let abort = run.abort_handle();

            let outcome = tokio::select! {
                _ = worker_token.cancelled() => {
                    abort.abort();
                    ExecutionOutcome::failed(FailureKind::Cancelled, "cancelled while running")
                }
                result = tokio::time::timeout(timeout, run) => match result {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => ExecutionOutcome::failed(
                        FailureKind::Execution,
                        format!("executor crashed: {}", e),
                    ),
                    Err(_) => {
                        abort.abort();
                        ExecutionOutcome::failed(
                            FailureKind::Timeout,
                            format!("timed out after {}ms", timeout.as_millis()),
                        )
                    }
                },
            };

            let event = WorkerEvent {
                agent_id,
                task_id: worker_task,
                attempt,
                outcome,
                duration_ms: started.elapsed().as_millis() as u64,
            };
            if tx.send(event).await.is_err() {
                tracing::debug!(agent = %agent_id, "scheduler gone, dropping worker result");
            }
        });

        tracing::debug!(agent = %agent_id, task = %task_id, attempt, "worker spawned");
        self.workers.insert(agent_id, task_id);
        Ok(agent_id)
    }

    /// Release the slot of a worker that reported back.
    pub fn complete(&mut self, id: &AgentId) -> Result<TaskId> {
        self.workers
            .remove(id)
            .ok_or(Error::WorkerNotFound { id: *id })
    }

    /// Cancel every running worker.
    pub fn abort_all(&self) {
        tracing::info!(workers = self.workers.len(), "aborting all workers");
        self.cancel.cancel();
    }

    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.capacity
    }

    /// Change the slot count. Running workers above a lowered limit finish
    /// normally; no new ones start until the count drops below it.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers must not outlive the run that owns them.
        self.cancel.cancel();
    }
}
