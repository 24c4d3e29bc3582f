//! Event stream contents: numbering, patch events, task derivation and
//! roles.

use futures::future::BoxFuture;
use serde_json::{json, Value};

use maestro::core::patch::PatchReport;
use maestro::core::task::TaskSpec;
use maestro::orchestration::controller::{REASON_DECOMPOSITION_FAILED, REASON_UNDERSTANDING_FAILED};
use maestro::orchestration::events::validate_stream_event;
use maestro::orchestration::roles::{RoleFallback, RoleSuggestion};
use maestro::orchestration::{
    Decomposer, ExitStatus, OrchestrationOptions, RunMode, StdoutMode, UnderstandingGate,
    UnderstandingVerdict,
};
use maestro::{Error, Result};

use crate::fixtures::{names, summary, task_names, ScriptedExecutor, TestSession};

/// Decomposer answering with a fixed task list.
struct FixedDecomposer(Value);

impl Decomposer for FixedDecomposer {
    fn decompose<'a>(&'a self, _requirement: &'a str) -> BoxFuture<'a, Result<Vec<TaskSpec>>> {
        Box::pin(async move { Ok(serde_json::from_value(self.0.clone())?) })
    }
}

struct BrokenDecomposer;

impl Decomposer for BrokenDecomposer {
    fn decompose<'a>(&'a self, _requirement: &'a str) -> BoxFuture<'a, Result<Vec<TaskSpec>>> {
        Box::pin(async { Err(Error::Decomposition("planner exited with code 2".to_string())) })
    }
}

struct FixedGate(UnderstandingVerdict);

impl UnderstandingGate for FixedGate {
    fn check<'a>(&'a self, _requirement: &'a str) -> BoxFuture<'a, Result<UnderstandingVerdict>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

struct FixedFallback(&'static str);

impl RoleFallback for FixedFallback {
    fn suggest<'a>(&'a self, _text: &'a str) -> BoxFuture<'a, Result<Option<RoleSuggestion>>> {
        Box::pin(async move {
            Ok(Some(RoleSuggestion {
                role: self.0.to_string(),
                reasoning: "classified by fallback".to_string(),
            }))
        })
    }
}

fn auto(session: &TestSession, requirement: &str) -> OrchestrationOptions {
    OrchestrationOptions {
        requirement: requirement.to_string(),
        mode: RunMode::Auto,
        save_stream: Some(session.stream_path()),
        stdout_mode: Some(StdoutMode::Essential),
        ..Default::default()
    }
}

/// Given a run with retries and every event on stdout
/// When the run finishes
/// Then stdout equals the saved stream, every line validates, and seq
///      runs 1..n without gaps
#[tokio::test]
async fn test_seq_consecutive_and_lines_validate() {
    let session = TestSession::new();
    let tasks = session.write_tasks(
        r#"[{"id":"a"},{"id":"b","dependencies":["a"],"retry":{"maxAttempts":2}}]"#,
    );
    let executor = ScriptedExecutor::new().failing_first("b", 1);

    let mut options = session.manual(&tasks);
    options.stdout_mode = Some(StdoutMode::All);
    let outcome = session.orchestrator(&executor).start(options).await.unwrap();

    let lines = session.out.lines();
    let events = session.events();
    assert_eq!(lines.len(), events.len());

    for (i, line) in lines.iter().enumerate() {
        validate_stream_event(line).unwrap();
        assert_eq!(line["seq"], (i + 1) as u64);
        assert_eq!(line["orchestrationId"], outcome.orchestration_id.as_str());
    }
    assert_eq!(names(&events).first(), Some(&"start"));
    assert_eq!(names(&events).last(), Some(&"orchestration_completed"));
    assert_eq!(
        names(&events).iter().filter(|n| **n == "report_written").count(),
        1
    );
}

/// Given a task declaring a quick-validation command that passes
/// When the run executes
/// Then quick_validate_passed lands between task_started and task_completed
#[tokio::test]
async fn test_quick_validation_reported() {
    let session = TestSession::new();
    let tasks = session.write_tasks(r#"[{"id":"v","validate":"cargo check"},{"id":"plain"}]"#);

    let outcome = session
        .orchestrator(&ScriptedExecutor::new())
        .start(session.manual(&tasks))
        .await
        .unwrap();
    assert_eq!(outcome.exit, ExitStatus::Success);

    let events = session.events();
    assert_eq!(
        task_names(&events, "v"),
        vec![
            "task_scheduled",
            "task_started",
            "quick_validate_passed",
            "task_completed",
            "task_execution_summary"
        ]
    );
    let passed = events
        .iter()
        .find(|e| e.event.as_str() == "quick_validate_passed")
        .unwrap();
    assert_eq!(passed.data["command"], "cargo check");
    assert_eq!(passed.data["durationMs"], 3);
    assert!(passed.agent_id.is_some());
    assert!(!task_names(&events, "plain").contains(&"quick_validate_passed"));
}

/// Given two tasks patching the same file, plus a failed patch and a patch
///      that could not be generated
/// When the run executes
/// Then patch events are emitted in order, the overlap requests manual
///      intervention, and summaries count applied and failed patches
#[tokio::test]
async fn test_patch_events_and_conflicts() {
    let session = TestSession::new();
    let tasks = session.write_tasks(r#"[{"id":"a"},{"id":"b","dependencies":["a"]}]"#);
    let executor = ScriptedExecutor::new()
        .with_patches("a", vec![PatchReport::applied("p1", &["src/lib.rs"])])
        .with_patches(
            "b",
            vec![
                PatchReport::applied("p2", &["src/lib.rs"]),
                PatchReport::failed("p3", &["src/main.rs"], "hunk 2 did not apply"),
                PatchReport::generation_failed("p4", "agent produced no diff"),
            ],
        );

    let outcome = session
        .orchestrator(&executor)
        .start(session.manual(&tasks))
        .await
        .unwrap();
    assert_eq!(outcome.exit, ExitStatus::Success);

    let events = session.events();
    assert_eq!(
        task_names(&events, "a"),
        vec![
            "task_scheduled",
            "task_started",
            "patch_generated",
            "tool_use",
            "patch_applied",
            "task_completed",
            "session_workspace_updated",
            "task_execution_summary",
        ]
    );
    assert_eq!(
        task_names(&events, "b"),
        vec![
            "task_scheduled",
            "task_started",
            "patch_generated",
            "tool_use",
            "patch_applied",
            "manual_intervention_requested",
            "patch_generated",
            "patch_failed",
            "patch_generation_failed",
            "task_completed",
            "session_workspace_updated",
            "task_execution_summary",
        ]
    );

    let of = |name: &str| -> Vec<&Value> {
        events
            .iter()
            .filter(|e| e.task_id.as_deref() == Some("b") && e.event.as_str() == name)
            .map(|e| &e.data)
            .collect()
    };
    assert_eq!(of("patch_applied")[0]["conflictsWith"], json!(["a"]));
    assert_eq!(of("manual_intervention_requested")[0]["files"], json!(["src/lib.rs"]));
    assert_eq!(of("patch_failed")[0]["sequence"], 2);
    assert_eq!(of("patch_failed")[0]["reason"], "hunk 2 did not apply");
    assert_eq!(of("patch_generation_failed")[0]["sequence"], 3);
    assert_eq!(of("tool_use")[0]["tool"], "patch_applier");
    assert_eq!(of("session_workspace_updated")[0]["files"], json!(["src/lib.rs"]));

    let b = summary(&events, "b");
    assert_eq!(b["patchesApplied"], 1);
    assert_eq!(b["patchesFailed"], 2);

    let a_applied = events
        .iter()
        .find(|e| e.task_id.as_deref() == Some("a") && e.event.as_str() == "patch_applied")
        .unwrap();
    assert_eq!(a_applied.data["conflictsWith"], json!([]));
    assert!(a_applied.agent_id.is_some());
}

/// Given auto mode and a decomposer returning two dependent tasks
/// When the run executes
/// Then decomposition is reported before any task event and both tasks run
#[tokio::test]
async fn test_auto_mode_with_decomposer() {
    let session = TestSession::new();
    let executor = ScriptedExecutor::new();
    let decomposer = FixedDecomposer(json!([
        {"id": "api", "title": "Implement the API"},
        {"id": "api_tests", "title": "Write unit test coverage", "dependencies": ["api"]}
    ]));

    let outcome = session
        .orchestrator(&executor)
        .with_decomposer(Box::new(decomposer))
        .start(auto(&session, "Build a REST API with tests"))
        .await
        .unwrap();
    assert_eq!(outcome.exit, ExitStatus::Success);
    assert_eq!(executor.started(), vec!["api", "api_tests"]);

    let events = session.events();
    let names = names(&events);
    assert_eq!(&names[..3], &["start", "decomposition_completed", "task_scheduled"]);
    assert_eq!(events[0].data["totalTasks"], 2);
    assert_eq!(events[0].data["mode"], "auto");
    assert_eq!(events[1].data["source"], "decomposer");
    assert_eq!(events[1].data["taskCount"], 2);
    assert_eq!(events[1].data["dependencyCount"], 1);
}

/// Given auto mode and a decomposer that fails
/// When the run starts
/// Then start, decomposition_failed and orchestration_failed are emitted,
///      no report is written, exit 1
#[tokio::test]
async fn test_decomposition_failure_aborts_run() {
    let session = TestSession::new();
    let executor = ScriptedExecutor::new();

    let outcome = session
        .orchestrator(&executor)
        .with_decomposer(Box::new(BrokenDecomposer))
        .start(auto(&session, "Build a REST API"))
        .await
        .unwrap();

    assert_eq!(outcome.exit, ExitStatus::Failed);
    assert!(outcome.report_path.is_none());
    assert!(executor.started().is_empty());

    let events = session.events();
    assert_eq!(
        names(&events),
        vec!["start", "decomposition_failed", "orchestration_failed"]
    );
    assert_eq!(events[0].data["totalTasks"], 0);
    assert!(events[1].data["reason"]
        .as_str()
        .unwrap()
        .contains("planner exited with code 2"));
    assert_eq!(events[2].data["failureReason"], REASON_DECOMPOSITION_FAILED);
    assert!(events[2].data["reportPath"].is_null());

    let lines = session.out.lines();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1]["event"], "orchestration_failed");
}

/// Given an understanding gate that restates the requirement faithfully
/// When an auto run without a decomposer starts
/// Then understanding_validated precedes a single-task decomposition
#[tokio::test]
async fn test_understanding_gate_passes() {
    let session = TestSession::new();
    let executor = ScriptedExecutor::new();
    let gate = FixedGate(UnderstandingVerdict::consistent("Write the README"));

    let outcome = session
        .orchestrator(&executor)
        .with_gate(Box::new(gate))
        .start(auto(&session, "Write the README\nInclude install steps"))
        .await
        .unwrap();
    assert_eq!(outcome.exit, ExitStatus::Success);

    let events = session.events();
    assert_eq!(
        &names(&events)[..3],
        &["start", "understanding_validated", "decomposition_completed"]
    );
    assert_eq!(events[1].data["restatement"], "Write the README");
    assert_eq!(events[2].data["source"], "requirement");
    assert_eq!(events[2].data["taskCount"], 1);
    assert_eq!(executor.started(), vec!["t1"]);
}

/// Given an understanding gate that finds the restatement inconsistent
/// When the run starts
/// Then the run fails before any task exists
#[tokio::test]
async fn test_understanding_gate_rejects() {
    let session = TestSession::new();
    let executor = ScriptedExecutor::new();
    let gate = FixedGate(UnderstandingVerdict::inconsistent(
        "Delete the database",
        "restatement contradicts the requirement",
    ));

    let outcome = session
        .orchestrator(&executor)
        .with_gate(Box::new(gate))
        .start(auto(&session, "Back up the database"))
        .await
        .unwrap();

    assert_eq!(outcome.exit, ExitStatus::Failed);
    assert!(executor.started().is_empty());

    let events = session.events();
    assert_eq!(
        names(&events),
        vec!["start", "understanding_failed", "orchestration_failed"]
    );
    assert_eq!(events[1].data["reason"], "restatement contradicts the requirement");
    assert_eq!(events[2].data["failureReason"], REASON_UNDERSTANDING_FAILED);
}

/// Given tasks whose text matches several role keywords
/// When roles are assigned
/// Then the longest keyword wins and explicit roles are kept
#[tokio::test]
async fn test_roles_on_task_events() {
    let session = TestSession::new();
    let tasks = session.write_tasks(
        r#"[
            {"id":"it","title":"Add integration test for the parser"},
            {"id":"docs","title":"Update the changelog"},
            {"id":"audit","title":"Implement caching","role":"reviewer"}
        ]"#,
    );
    let executor = ScriptedExecutor::new();

    session
        .orchestrator(&executor)
        .start(session.manual(&tasks))
        .await
        .unwrap();

    let events = session.events();
    let role_of = |task: &str| {
        events
            .iter()
            .find(|e| e.task_id.as_deref() == Some(task) && e.event.as_str() == "task_started")
            .and_then(|e| e.role.clone())
    };
    assert_eq!(role_of("it").as_deref(), Some("tester"));
    assert_eq!(role_of("docs").as_deref(), Some("documenter"));
    assert_eq!(role_of("audit").as_deref(), Some("reviewer"));
}

/// Given a task no keyword rule matches and a role fallback
/// When roles are assigned
/// Then the fallback decides the role
#[tokio::test]
async fn test_role_fallback_for_unmatched_task() {
    let session = TestSession::new();
    let tasks = session.write_tasks(
        r#"[{"id":"mig","title":"Migrate the database"},{"id":"t","title":"Run unit test suite"}]"#,
    );
    let executor = ScriptedExecutor::new();

    session
        .orchestrator(&executor)
        .with_role_fallback(Box::new(FixedFallback("dba")))
        .start(session.manual(&tasks))
        .await
        .unwrap();

    let events = session.events();
    let role_of = |task: &str| {
        events
            .iter()
            .find(|e| e.task_id.as_deref() == Some(task))
            .and_then(|e| e.role.clone())
    };
    assert_eq!(role_of("mig").as_deref(), Some("dba"));
    assert_eq!(role_of("t").as_deref(), Some("tester"));
}
