//! Cancellation and resume.

use std::time::Duration;

use maestro::core::task::TaskStatus;
use maestro::orchestration::events::read_stream;
use maestro::orchestration::pool::CancelPolicy;
use maestro::orchestration::report::REASON_CANCELLED;
use maestro::orchestration::ExitStatus;
use maestro::state::{RolloutState, SEQ_FILE, STATE_FILE};

use crate::fixtures::{independent_tasks, names, summary, task_names, ScriptedExecutor, TestSession};

/// Given 3 tasks, max concurrency 1 and the drain policy
/// When the run is cancelled while the first task runs
/// Then the running task finishes, the rest fail as cancelled, exit 1
#[tokio::test]
async fn test_cancel_drains_in_flight() {
    let session = TestSession::new();
    let tasks = session.write_tasks(&independent_tasks(3));
    let executor = ScriptedExecutor::new().with_delay(200);

    let mut options = session.manual(&tasks);
    options.max_concurrency = Some(1);
    let orchestrator = session.orchestrator(&executor);
    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let outcome = orchestrator.start(options).await.unwrap();
    assert_eq!(outcome.exit, ExitStatus::Failed);
    assert_eq!(outcome.report.failure_reason.as_deref(), Some(REASON_CANCELLED));
    assert_eq!(executor.log(), vec!["start:t1", "end:t1"]);

    let events = session.events();
    let requested = events
        .iter()
        .find(|e| e.event.as_str() == "cancel_requested")
        .expect("cancel_requested should be emitted");
    assert_eq!(requested.data["policy"], "drain");
    assert_eq!(requested.data["inFlight"], 1);

    assert_eq!(summary(&events, "t1")["status"], "completed");
    for id in ["t2", "t3"] {
        assert_eq!(
            task_names(&events, id),
            vec!["task_scheduled", "task_failed", "task_execution_summary"]
        );
        assert_eq!(summary(&events, id)["errorType"], "CANCELLED");
    }
    assert_eq!(names(&events).last(), Some(&"orchestration_failed"));
}

/// Given the abort policy
/// When the run is cancelled while a task runs
/// Then the running attempt is stopped and fails as cancelled, without retry
#[tokio::test]
async fn test_cancel_aborts_in_flight() {
    let mut session = TestSession::new();
    session.config.orchestrator.cancel_policy = CancelPolicy::Abort;
    let tasks = session.write_tasks(&independent_tasks(2));
    let executor = ScriptedExecutor::new().with_delay(5_000);

    let mut options = session.manual(&tasks);
    options.max_concurrency = Some(1);
    let orchestrator = session.orchestrator(&executor);
    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(3), orchestrator.start(options))
        .await
        .expect("abort should not wait for the running attempt")
        .unwrap();
    assert_eq!(outcome.exit, ExitStatus::Failed);
    assert_eq!(executor.log(), vec!["start:t1"]);

    let events = session.events();
    let failed = events
        .iter()
        .find(|e| e.event.as_str() == "task_failed" && e.task_id.as_deref() == Some("t1"))
        .unwrap();
    assert_eq!(failed.data["errorType"], "CANCELLED");
    assert_eq!(failed.data["willRetry"], false);
    assert!(!names(&events).contains(&"task_retry_scheduled"));
    assert_eq!(outcome.report.failed_task_ids, vec!["t1", "t2"]);
}

/// Given a run whose token is cancelled before it starts
/// When the run executes
/// Then no task is dispatched and every task fails as cancelled
#[tokio::test]
async fn test_cancel_before_start_dispatches_nothing() {
    let session = TestSession::new();
    let tasks = session.write_tasks(&independent_tasks(3));
    let executor = ScriptedExecutor::new();

    let orchestrator = session.orchestrator(&executor);
    orchestrator.cancel();
    let outcome = orchestrator.start(session.manual(&tasks)).await.unwrap();

    assert_eq!(outcome.exit, ExitStatus::Failed);
    assert_eq!(outcome.report.failure_reason.as_deref(), Some(REASON_CANCELLED));
    assert!(executor.log().is_empty());

    let events = session.events();
    let names = names(&events);
    assert_eq!(names[..2], ["start", "cancel_requested"]);
    assert!(!names.contains(&"task_started"));
    for id in ["t1", "t2", "t3"] {
        assert_eq!(summary(&events, id)["errorType"], "CANCELLED");
        assert_eq!(summary(&events, id)["attempts"], 0);
    }
}

/// Given a run interrupted while t1 is still running
/// When it is resumed into the same saved stream
/// Then numbering continues after the last event written, never reusing one
#[tokio::test]
async fn test_resume_after_interrupt_continues_seq() {
    let session = TestSession::new();
    let tasks = session.write_tasks(r#"[{"id":"t1"},{"id":"t2","dependencies":["t1"]}]"#);
    let first = ScriptedExecutor::new().with_delay(5_000);

    let interrupted = tokio::time::timeout(
        Duration::from_millis(200),
        session.orchestrator(&first).start(session.manual(&tasks)),
    )
    .await;
    assert!(interrupted.is_err(), "run should still be in flight");
    assert_eq!(first.log(), vec!["start:t1"]);

    let before = session.events();
    let written = before.last().unwrap().seq;
    assert_eq!(names(&before), vec!["start", "task_scheduled", "task_started"]);

    let session_dir = session.sessions_dir().join(&before[0].orchestration_id);
    let saved = RolloutState::load(&session_dir.join(STATE_FILE)).unwrap();
    assert!(saved.last_seq < written);
    assert_eq!(
        std::fs::read_to_string(session_dir.join(SEQ_FILE)).unwrap(),
        written.to_string()
    );

    let second = ScriptedExecutor::new();
    let mut options = session.manual(&tasks);
    options.tasks_file = None;
    let resumed = session
        .orchestrator(&second)
        .resume(&session_dir.join(STATE_FILE), options)
        .await
        .unwrap();
    assert_eq!(resumed.exit, ExitStatus::Success);
    assert_eq!(second.started(), vec!["t1", "t2"]);

    let all = session.events();
    assert_eq!(all[before.len()].event.as_str(), "start");
    assert_eq!(all[before.len()].seq, written + 1);
    for pair in all.windows(2) {
        assert!(pair[1].seq > pair[0].seq, "seq {} reused", pair[1].seq);
    }
}

/// Given a finished run where t2 failed and t3 depended on it
/// When it is resumed with a healthy executor
/// Then only t2 and t3 run, t1 emits nothing, and seq continues
#[tokio::test]
async fn test_resume_skips_completed_tasks() {
    let session = TestSession::new();
    let tasks = session.write_tasks(
        r#"[
            {"id":"t1"},
            {"id":"t2","retry":{"maxAttempts":1}},
            {"id":"t3","dependencies":["t2"]}
        ]"#,
    );
    let first = ScriptedExecutor::new().failing(&["t2"]);
    let outcome = session
        .orchestrator(&first)
        .start(session.manual(&tasks))
        .await
        .unwrap();
    assert_eq!(outcome.exit, ExitStatus::Failed);

    let rollout = outcome.session_dir.join(STATE_FILE);
    let saved = RolloutState::load(&rollout).unwrap();
    let last_seq = session.events().last().unwrap().seq;
    assert_eq!(saved.last_seq, last_seq);

    let second = ScriptedExecutor::new();
    let resume_stream = session.workdir().join("resume.jsonl");
    let mut options = session.manual(&tasks);
    options.tasks_file = None;
    options.save_stream = Some(resume_stream.clone());
    let resumed = session
        .orchestrator(&second)
        .resume(&rollout, options)
        .await
        .unwrap();

    assert_eq!(resumed.exit, ExitStatus::Success);
    assert_eq!(resumed.orchestration_id, outcome.orchestration_id);
    assert_eq!(second.started(), vec!["t2", "t3"]);

    let events = read_stream(&resume_stream).unwrap();
    assert_eq!(events[0].event.as_str(), "start");
    assert_eq!(events[0].seq, last_seq + 1);
    assert_eq!(events[0].data["resumed"], true);
    assert_eq!(events[0].data["totalTasks"], 3);
    for pair in events.windows(2) {
        assert_eq!(pair[1].seq, pair[0].seq + 1);
    }
    assert!(task_names(&events, "t1").is_empty());
    assert_eq!(summary(&events, "t2")["attempts"], 1);

    let state = RolloutState::load(&rollout).unwrap();
    assert!(state.tasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert_eq!(state.last_seq, events.last().unwrap().seq);
}

/// Given a rollout path that does not exist
/// When a resume is requested
/// Then it is an input error
#[tokio::test]
async fn test_resume_missing_rollout_is_input_error() {
    let session = TestSession::new();
    let err = session
        .orchestrator(&ScriptedExecutor::new())
        .resume(&session.workdir().join("nope/state.json"), Default::default())
        .await
        .unwrap_err();
    assert_eq!(ExitStatus::for_error(&err), ExitStatus::InvalidInput);
}
