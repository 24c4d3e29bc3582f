use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::{Task, TaskStatus};
use crate::util::{blocking, write_json_atomic};
use crate::{Error, Result};

pub const STATE_FILE: &str = "state.json";

/// Last emitted `seq`, kept next to the state file.
pub const SEQ_FILE: &str = "seq";

/// Directory holding everything one orchestration writes.
pub fn session_dir(sessions_dir: &Path, orchestration_id: &str) -> PathBuf {
    sessions_dir.join(orchestration_id)
}

/// Run-level settings that stay fixed across resumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutHeader {
    pub orchestration_id: String,
    pub requirement: String,
    pub mode: String,
    pub success_rate_threshold: f64,
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutState {
    #[serde(flatten)]
    pub header: RolloutHeader,
    /// Sequence number of the last event emitted before this snapshot.
    pub last_seq: u64,
    pub tasks: Vec<Task>,
    pub updated_at: DateTime<Utc>,
}

impl RolloutState {
    /// Load a rollout file.
    ///
    /// # Errors
    /// - `RolloutNotFound` if the file does not exist
    /// - `InvalidInput` if it is not a rollout state
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading rollout state");
        if !path.exists() {
            return Err(Error::RolloutNotFound(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&contents).map_err(|e| {
            Error::InvalidInput(format!("invalid rollout state {}: {}", path.display(), e))
        })?;
        tracing::debug!(
            orchestration = %state.header.orchestration_id,
            tasks = state.tasks.len(),
            last_seq = state.last_seq,
            "rollout state loaded"
        );
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Reset every task that did not complete so it runs again.
    ///
    /// Returns how many tasks were reset.
    pub fn prepare_resume(&mut self) -> usize {
        let mut reset = 0;
        for task in &mut self.tasks {
            if task.status != TaskStatus::Completed {
                task.reset_for_resume();
                reset += 1;
            }
        }
        reset
    }
}

/// Writes snapshots of a running orchestration to its rollout file.
#[derive(Debug, Clone)]
pub struct RolloutStore {
    path: PathBuf,
    header: RolloutHeader,
}

impl RolloutStore {
    pub fn new(sessions_dir: &Path, header: RolloutHeader) -> Self {
        let path = session_dir(sessions_dir, &header.orchestration_id).join(STATE_FILE);
        Self { path, header }
    }

    /// Store writing back to an existing rollout file.
    pub fn at(path: &Path, header: RolloutHeader) -> Self {
        Self {
            path: path.to_path_buf(),
            header,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, tasks: &[Task], last_seq: u64) -> Result<()> {
        let state = RolloutState {
            header: self.header.clone(),
            last_seq,
            tasks: tasks.to_vec(),
            updated_at: Utc::now(),
        };
        let path = self.path.clone();
        blocking(move || state.save(&path)).await
    }
}
