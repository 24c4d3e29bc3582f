//! Final run report.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::{FailureKind, Task, TaskStatus};
use crate::error::{Error, Result};
use crate::util::{blocking_with_timeout, write_json_atomic};

pub const REPORT_FILE: &str = "report.json";

pub const REASON_BELOW_THRESHOLD: &str = "success-rate-below-threshold";
pub const REASON_CANCELLED: &str = "cancelled";
pub const REASON_REPORT_WRITE_FAILED: &str = "report-write-failed";

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub orchestration_id: String,
    pub status: RunStatus,
    pub success_rate: f64,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub failed_task_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_suggestions: Option<Vec<String>>,
    pub generated_at: DateTime<Utc>,
}

/// `completed / total`, or 1.0 for an empty run.
pub fn success_rate(completed: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        completed as f64 / total as f64
    }
}

impl RunReport {
    /// Summarize settled tasks against the success threshold.
    ///
    /// A cancelled run always fails, whatever its rate.
    pub fn compute(
        orchestration_id: &str,
        tasks: &[Task],
        threshold: f64,
        cancelled: bool,
        test_command: &str,
    ) -> Self {
        let total = tasks.len();
        let completed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let failed_ids: Vec<String> = tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Completed)
            .map(|t| t.id.to_string())
            .collect();
        let rate = success_rate(completed, total);

        let failure_reason = if cancelled {
            Some(REASON_CANCELLED)
        } else if rate < threshold {
            Some(REASON_BELOW_THRESHOLD)
        } else {
            None
        };

        let mut report = Self {
            orchestration_id: orchestration_id.to_string(),
            status: RunStatus::Succeeded,
            success_rate: rate,
            total_tasks: total,
            completed_tasks: completed,
            failed_tasks: failed_ids.len(),
            failed_task_ids: failed_ids,
            failure_reason: None,
            remediation_suggestions: None,
            generated_at: Utc::now(),
        };
        if let Some(reason) = failure_reason {
            report.mark_failed(reason, remediation(tasks, test_command));
        }
        report
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Turn the report into a failure, keeping existing suggestions.
    pub fn mark_failed(&mut self, reason: &str, suggestions: Vec<String>) {
        self.status = RunStatus::Failed;
        self.failure_reason = Some(reason.to_string());
        if self.remediation_suggestions.is_none() {
            self.remediation_suggestions = Some(suggestions);
        }
    }

    /// Persist as `<session_dir>/report.json`.
    ///
    /// # Errors
    /// Any failure is reported as `ReportWrite` with the target path.
    pub async fn write(&self, session_dir: &Path) -> Result<PathBuf> {
        let path = session_dir.join(REPORT_FILE);
        let target = path.clone();
        let report = self.clone();
        blocking_with_timeout(WRITE_TIMEOUT, move || write_json_atomic(&target, &report))
            .await
            .map_err(|e| Error::ReportWrite {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(path = %path.display(), status = %self.status, "report written");
        Ok(path)
    }
}

/// Next steps for a failed run. The first always names the test command.
pub fn remediation(tasks: &[Task], test_command: &str) -> Vec<String> {
    let mut suggestions = vec![format!(
        "Run `{}` to reproduce failures locally",
        test_command
    )];

    let kinds: BTreeSet<&'static str> = tasks
        .iter()
        .filter(|t| t.status != TaskStatus::Completed)
        .filter_map(|t| t.last_failure)
        .map(hint_for)
        .collect();
    suggestions.extend(kinds.into_iter().map(String::from));
    suggestions
}

fn hint_for(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::Execution => {
            "Inspect the failed tasks' last errors and rerun with --resume once fixed"
        }
        FailureKind::Timeout => "Raise timeoutMs for long-running tasks or split them up",
        FailureKind::Spawn => "Check that the agent command is installed and on PATH",
        FailureKind::ValidationFailed => {
            "Fix the quick-validation failures before resuming the run"
        }
        FailureKind::DependencyFailed => {
            "Fix upstream tasks first; dependent tasks were skipped"
        }
        FailureKind::Cancelled => "Resume the cancelled run with --resume <state.json>",
    }
}
