//! Resource-driven concurrency scaling.

use maestro::orchestration::ExitStatus;

use crate::fixtures::{independent_tasks, names, ScriptedExecutor, ScriptedProbe, TestSession};

fn position(names: &[&str], name: &str) -> usize {
    names
        .iter()
        .position(|n| *n == name)
        .unwrap_or_else(|| panic!("{} not in {:?}", name, names))
}

/// Given CPU at 0.9 for two samples, then 0.5, and max concurrency 3
/// When the run executes
/// Then concurrency is reduced twice and later restored, each change
///      immediately followed by its resource event
#[tokio::test]
async fn test_downscale_then_restore() {
    let mut session = TestSession::new();
    session.config.resources.cpu_threshold = 0.8;
    session.config.resources.hysteresis = 0.1;
    let tasks = session.write_tasks(&independent_tasks(6));
    let executor = ScriptedExecutor::new().with_delay(80);

    let mut options = session.manual(&tasks);
    options.max_concurrency = Some(3);
    let outcome = session
        .orchestrator(&executor)
        .with_probe(Some(Box::new(ScriptedProbe::new(&[0.9, 0.9, 0.5]))))
        .start(options)
        .await
        .unwrap();
    assert_eq!(outcome.exit, ExitStatus::Success);

    let events = session.events();
    let names = names(&events);

    let reduced: Vec<_> = events
        .iter()
        .filter(|e| e.event.as_str() == "concurrency_reduced")
        .map(|e| (e.data["from"].as_u64().unwrap(), e.data["to"].as_u64().unwrap()))
        .collect();
    assert_eq!(reduced, vec![(3, 2), (2, 1)]);

    for (i, name) in names.iter().enumerate() {
        if *name == "concurrency_reduced" {
            assert_eq!(names[i + 1], "resource_downscale");
        }
        if *name == "concurrency_increased" {
            assert_eq!(names[i + 1], "resource_restore");
        }
    }

    let increased = events
        .iter()
        .find(|e| e.event.as_str() == "concurrency_increased")
        .expect("concurrency should be restored");
    assert_eq!(increased.data["from"], 1);
    assert_eq!(increased.data["to"], 2);
    assert!(position(&names, "resource_downscale") < position(&names, "resource_restore"));

    let downscale = events
        .iter()
        .find(|e| e.event.as_str() == "resource_downscale")
        .unwrap();
    assert_eq!(downscale.data["cpuUsage"], 0.9);
    assert!(downscale.task_id.is_none());
}

/// Given max concurrency 1 and CPU overloaded for three samples
/// When the run executes
/// Then resources are reported exhausted exactly once, then restored
#[tokio::test]
async fn test_exhaustion_at_floor_reported_once() {
    let mut session = TestSession::new();
    session.config.resources.cpu_threshold = 0.8;
    let tasks = session.write_tasks(&independent_tasks(2));
    let executor = ScriptedExecutor::new().with_delay(60);

    let mut options = session.manual(&tasks);
    options.max_concurrency = Some(1);
    let outcome = session
        .orchestrator(&executor)
        .with_probe(Some(Box::new(ScriptedProbe::new(&[0.95, 0.95, 0.95, 0.5]))))
        .start(options)
        .await
        .unwrap();
    assert_eq!(outcome.exit, ExitStatus::Success);
    assert_eq!(executor.peak_concurrency(), 1);

    let events = session.events();
    let names = names(&events);
    assert_eq!(names.iter().filter(|n| **n == "resource_exhausted").count(), 1);
    assert!(!names.contains(&"concurrency_reduced"));
    assert!(position(&names, "resource_exhausted") < position(&names, "resource_restore"));

    let restore = events
        .iter()
        .find(|e| e.event.as_str() == "resource_restore")
        .unwrap();
    assert_eq!(restore.data["concurrency"], 1);
}

/// Given resource scaling disabled
/// When the run executes
/// Then no resource events are emitted
#[tokio::test]
async fn test_no_probe_no_resource_events() {
    let session = TestSession::new();
    let tasks = session.write_tasks(&independent_tasks(3));
    let executor = ScriptedExecutor::new().with_delay(10);

    session
        .orchestrator(&executor)
        .start(session.manual(&tasks))
        .await
        .unwrap();

    let events = session.events();
    assert!(names(&events)
        .iter()
        .all(|n| !n.starts_with("resource_") && !n.starts_with("concurrency_")));
}
