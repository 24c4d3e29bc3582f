//! Patch tracking and conflict detection.
//!
//! The tracker numbers patches per task in arrival order and remembers
//! which files each task's applied patches touched. An applied patch that
//! touches a file another task already changed is reported as a conflict.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::patch::{Patch, PatchReport};
use crate::core::task::TaskId;

/// A patch after recording, with any tasks it conflicts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPatch {
    pub patch: Patch,
    /// Other tasks whose applied patches touched the same files, sorted.
    pub conflicts_with: Vec<TaskId>,
}

#[derive(Debug, Default)]
pub struct PatchTracker {
    sequences: HashMap<TaskId, u32>,
    /// File path to the tasks whose applied patches touched it.
    touched: BTreeMap<String, BTreeSet<TaskId>>,
}

impl PatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, task_id: &TaskId, report: PatchReport) -> RecordedPatch {
        let sequence = self.sequences.entry(task_id.clone()).or_insert(0);
        *sequence += 1;

        let patch = Patch {
            patch_id: report.patch_id,
            task_id: task_id.clone(),
            target_files: report.target_files,
            sequence: *sequence,
            outcome: report.outcome,
            reason: report.reason,
        };

        let mut conflicts = BTreeSet::new();
        if patch.is_applied() {
            for file in &patch.target_files {
                let owners = self.touched.entry(file.clone()).or_default();
                conflicts.extend(owners.iter().filter(|t| *t != task_id).cloned());
                owners.insert(task_id.clone());
            }
        }

        if !conflicts.is_empty() {
            tracing::warn!(
                task = %task_id,
                patch = %patch.patch_id,
                conflicts = conflicts.len(),
                "patch overlaps files changed by other tasks"
            );
        }

        RecordedPatch {
            patch,
            conflicts_with: conflicts.into_iter().collect(),
        }
    }
}
