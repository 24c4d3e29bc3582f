//! Core domain models for maestro orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestrator: tasks with their retry policy, patch records, and
//! the dependency graph.

pub mod graph;
pub mod patch;
pub mod task;

pub use graph::TaskGraph;
pub use patch::{Patch, PatchOutcome, PatchReport};
pub use task::{
    BackoffKind, FailureKind, MatchMethod, RetryPolicy, Task, TaskId, TaskSpec, TaskStatus,
};
