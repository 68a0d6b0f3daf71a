use std::sync::Arc;

use dagrun::engine::TaskState;
use dagrun::events::{Event, EventSink, MemorySink};
use dagrun::history::read_history;
use dagrun::{
    schedule, Backend, EdgeStatus, Executable, JobSpec, ScheduleOptions, WorkflowBuilder,
};

fn options(workdir: &std::path::Path, backend: Backend) -> ScheduleOptions {
    ScheduleOptions {
        backend,
        name: Some("testrun".into()),
        workdir: workdir.to_path_buf(),
        handle_interrupts: false,
        ..ScheduleOptions::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn schedule_writes_events_and_history() {
    let workdir = tempfile::tempdir().unwrap();

    let mut b = WorkflowBuilder::new();
    let a = b
        .add_job(JobSpec::new("a", Executable::scalar(|| Ok(()))))
        .unwrap();
    let c = b
        .add_job(JobSpec::new("b", Executable::scalar(|| Ok(()))))
        .unwrap();
    b.add_edge(a, c, EdgeStatus::Success).unwrap();
    let workflow = b.freeze(&[c]).unwrap();

    let sink = Arc::new(MemorySink::new());
    let report = schedule(
        workflow,
        options(workdir.path(), Backend::Async),
        sink.clone() as Arc<dyn EventSink>,
    )
    .await
    .unwrap();

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.job_count(), 2);

    let events = sink.events();
    assert!(matches!(events.first(), Some(Event::WorkflowStarted { .. })));
    assert!(matches!(events.last(), Some(Event::WorkflowFinished { .. })));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::TaskFinished { .. }))
            .count(),
        2
    );

    let events_log = workdir.path().join("testrun").join("events.jsonl");
    assert!(events_log.exists());
    let lines = std::fs::read_to_string(events_log).unwrap();
    assert_eq!(lines.lines().count(), events.len());

    let history = read_history(workdir.path()).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].name, "testrun");
    assert_eq!(history[0].backend, "async");
    assert_eq!(history[0].job_count, 2);
    assert_eq!(history[0].error_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn dummy_backend_replaces_bodies() {
    let workdir = tempfile::tempdir().unwrap();

    let mut b = WorkflowBuilder::new();
    let a = b
        .add_job(JobSpec::new(
            "a",
            Executable::scalar(|| Err(anyhow::anyhow!("real body must not run"))),
        ))
        .unwrap();
    let workflow = b.freeze(&[a]).unwrap();

    let report = schedule(
        workflow,
        options(workdir.path(), Backend::Dummy),
        Arc::new(MemorySink::new()),
    )
    .await
    .unwrap();

    assert_eq!(report.state_of("a"), Some(TaskState::Succeeded));
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_runs_are_counted_in_history() {
    let workdir = tempfile::tempdir().unwrap();

    let mut b = WorkflowBuilder::new();
    b.add_job(JobSpec::new(
        "bad",
        Executable::scalar(|| Err(anyhow::anyhow!("nope"))),
    ))
    .unwrap();
    let bad = b.job_id("bad").unwrap();
    let workflow = b.freeze(&[bad]).unwrap();

    let report = schedule(
        workflow,
        options(workdir.path(), Backend::Async),
        Arc::new(MemorySink::new()),
    )
    .await
    .unwrap();

    assert_eq!(report.exit_code(), 1);
    let history = read_history(workdir.path()).unwrap();
    assert_eq!(history[0].error_count, 1);
}

#[test]
fn backend_parses_from_user_input() {
    assert_eq!("async".parse::<Backend>().unwrap(), Backend::Async);
    assert_eq!("Dummy".parse::<Backend>().unwrap(), Backend::Dummy);
    assert_eq!("slurm".parse::<Backend>().unwrap(), Backend::Slurm);
    assert!("pbs".parse::<Backend>().is_err());
}
