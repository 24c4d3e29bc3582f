//! Patch records reported by task executions.

use crate::core::task::TaskId;
use serde::{Deserialize, Serialize};

/// Outcome of a single patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOutcome {
    Applied,
    Failed,
    GenerationFailed,
}

/// A patch as reported by an executor, before the tracker numbers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchReport {
    pub patch_id: String,
    pub target_files: Vec<String>,
    pub outcome: PatchOutcome,
    pub reason: Option<String>,
}

impl PatchReport {
    pub fn applied(patch_id: &str, files: &[&str]) -> Self {
        Self {
            patch_id: patch_id.to_string(),
            target_files: files.iter().map(|f| f.to_string()).collect(),
            outcome: PatchOutcome::Applied,
            reason: None,
        }
    }

    pub fn failed(patch_id: &str, files: &[&str], reason: &str) -> Self {
        Self {
            outcome: PatchOutcome::Failed,
            reason: Some(reason.to_string()),
            ..Self::applied(patch_id, files)
        }
    }

    pub fn generation_failed(patch_id: &str, reason: &str) -> Self {
        Self {
            patch_id: patch_id.to_string(),
            target_files: Vec::new(),
            outcome: PatchOutcome::GenerationFailed,
            reason: Some(reason.to_string()),
        }
    }
}

/// A recorded patch, owned by its task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub patch_id: String,
    pub task_id: TaskId,
    pub target_files: Vec<String>,
    /// Per-task ordinal, starting at 1.
    pub sequence: u32,
    pub outcome: PatchOutcome,
    pub reason: Option<String>,
}

impl Patch {
    pub fn is_applied(&self) -> bool {
        self.outcome == PatchOutcome::Applied
    }
}
