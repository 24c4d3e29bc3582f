//! Orchestration layer.
//!
//! Components are listed leaf-first: resource sampling and role rules at
//! the bottom, the scheduler in the middle, and the controller that wires
//! a complete run at the top.

pub mod controller;
pub mod decompose;
pub mod events;
pub mod executor;
pub mod patches;
pub mod pool;
pub mod redact;
pub mod report;
pub mod resources;
pub mod roles;
pub mod scheduler;

pub use controller::{ExitStatus, OrchestrationOptions, Orchestrator, RunMode, RunOutcome};
pub use decompose::{CommandDecomposer, Decomposer, UnderstandingGate, UnderstandingVerdict};
pub use events::{EventData, EventEmitter, EventKind, StdoutMode, StreamEvent};
pub use executor::{CommandExecutor, ExecutionOutcome, ExecutionRequest, TaskExecutor};
pub use patches::PatchTracker;
pub use pool::{CancelPolicy, WorkerPool};
pub use report::{RunReport, RunStatus};
pub use resources::{ResourceMonitor, ResourceProbe, ResourceSnapshot, SystemProbe};
pub use roles::{RoleAssigner, RoleFallback};
pub use scheduler::{Scheduler, SchedulerConfig};
