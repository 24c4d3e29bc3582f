//! Persisted orchestration state.
//!
//! Each run keeps a rollout file under its session directory. Passing that
//! file to `--resume` continues the run without re-running completed tasks.

mod rollout;

pub use rollout::{session_dir, RolloutHeader, RolloutState, RolloutStore, SEQ_FILE, STATE_FILE};
