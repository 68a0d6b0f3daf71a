// src/lib.rs

//! Declare directed acyclic workflow graphs and run them.
//!
//! A workflow is a DAG of jobs built through [`WorkflowBuilder`], each job an
//! opaque body with optional array fan-out, resource hints, pre- and
//! postconditions, and per-edge completion requirements. [`schedule`] derives
//! the active subgraph from the frozen targets, optionally prunes work whose
//! postconditions already hold, and hands the rest to one of two backends:
//! the local async engine, or a translator that emits an equivalent Slurm
//! submission.

pub mod cli;
pub mod engine;
pub mod errors;
pub mod events;
pub mod exec;
pub mod history;
pub mod logging;
pub mod slurm;
pub mod workflow;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::engine::{JobResult, RunReport, Runtime, RuntimeOptions, TaskState};
use crate::errors::{Result, WorkflowError};
use crate::events::{Event, EventSink, JsonlSink, MultiSink};
use crate::history::{append_history, HistoryEntry, RunDir};
use crate::slurm::SlurmBackend;
use crate::workflow::{active_subgraph, ActiveGraph, Workflow};

pub use crate::engine::CancelHandle;
pub use crate::workflow::{
    EdgeStatus, Executable, Job, JobId, JobSpec, Join, Predicate, Resources, WorkflowBuilder,
};

/// Which engine executes the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Local asynchronous engine.
    #[default]
    Async,
    /// Local engine with every body replaced by a short randomised sleep.
    Dummy,
    /// Translate and hand off to Slurm.
    Slurm,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "async" => Ok(Backend::Async),
            "dummy" => Ok(Backend::Dummy),
            "slurm" => Ok(Backend::Slurm),
            other => Err(format!(
                "invalid backend: {other} (expected \"async\", \"dummy\" or \"slurm\")"
            )),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Backend::Async => "async",
            Backend::Dummy => "dummy",
            Backend::Slurm => "slurm",
        };
        f.write_str(s)
    }
}

/// Options for one scheduled run.
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub backend: Backend,
    /// Evaluate postconditions up front and skip already-satisfied work.
    pub prune: bool,
    /// Run name; defaults to a timestamp.
    pub name: Option<String>,
    /// Root directory for run directories and the history index.
    pub workdir: PathBuf,
    /// Upper bound on concurrently executing bodies (local backends).
    pub workers: usize,
    /// Install a Ctrl-C handler that cancels the run. Tests turn this off.
    pub handle_interrupts: bool,
    pub slurm: SlurmBackend,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            backend: Backend::Async,
            prune: false,
            name: None,
            workdir: PathBuf::from(".dagrun"),
            workers: 4,
            handle_interrupts: true,
            slurm: SlurmBackend::default(),
        }
    }
}

/// Run a frozen workflow to quiescence on the configured backend.
///
/// Validation problems surface as errors before any task runs. Task failures
/// do not: the engine always reaches a quiescent state and reports them in
/// the returned [`RunReport`] (see [`RunReport::exit_code`]).
pub async fn schedule(
    workflow: Workflow,
    options: ScheduleOptions,
    sink: Arc<dyn EventSink>,
) -> Result<RunReport> {
    let workflow = Arc::new(workflow);
    let active = active_subgraph(&workflow, options.prune, &*sink);

    let rundir = RunDir::create(&options.workdir, options.name.clone())?;
    let sink: Arc<dyn EventSink> = Arc::new(MultiSink::new(vec![
        Box::new(sink),
        Box::new(JsonlSink::create(&rundir.events_path())?),
    ]));

    sink.emit(&Event::WorkflowStarted {
        workflow_id: rundir.workflow_id.to_string(),
        name: rundir.name.clone(),
        backend: options.backend.to_string(),
        job_count: active.job_count(),
        task_count: active.task_count(),
        timestamp: Utc::now(),
    });

    let report = match options.backend {
        Backend::Async | Backend::Dummy => {
            run_local(&workflow, &active, &options, sink.clone()).await?
        }
        Backend::Slurm => {
            let ids = options.slurm.submit(&workflow, &active, &rundir).await?;
            submission_report(&workflow, &active, ids)
        }
    };

    sink.emit(&Event::WorkflowFinished {
        summary: report.summary(),
    });

    append_history(
        &options.workdir,
        &HistoryEntry {
            name: rundir.name.clone(),
            workflow_id: rundir.workflow_id,
            timestamp: Utc::now(),
            backend: options.backend.to_string(),
            job_count: report.job_count(),
            error_count: report.error_count(),
        },
    )?;

    Ok(report)
}

async fn run_local(
    workflow: &Arc<Workflow>,
    active: &ActiveGraph,
    options: &ScheduleOptions,
    sink: Arc<dyn EventSink>,
) -> Result<RunReport> {
    let runtime = Runtime::new(
        workflow.clone(),
        active,
        RuntimeOptions {
            workers: options.workers,
            dummy: options.backend == Backend::Dummy,
        },
        sink,
    );

    if options.handle_interrupts {
        let handle = runtime.cancel_handle();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            info!("interrupt received; cancelling workflow");
            handle.cancel();
        });
    }

    runtime.run().await
}

/// Report for a cluster handoff: every job submitted, nothing locally
/// terminal except skipped jobs.
fn submission_report(
    workflow: &Workflow,
    active: &ActiveGraph,
    ids: std::collections::BTreeMap<String, String>,
) -> RunReport {
    let jobs = active
        .scheduled_jobs(workflow)
        .map(|id| {
            let job = workflow.job(id);
            let state = if active.is_skipped(id) {
                TaskState::Skipped
            } else {
                TaskState::Pending
            };
            JobResult {
                name: job.name.clone(),
                state,
                tasks: Vec::new(),
            }
        })
        .collect();

    RunReport {
        jobs,
        failures: Vec::new(),
        cancelled: false,
        external_ids: Some(ids),
    }
}

/// Validation shortcut for embedding programs: exit code for a `schedule`
/// error, matching the binary's conventions.
pub fn error_exit_code(err: &WorkflowError) -> i32 {
    match err {
        WorkflowError::Cancelled => 3,
        _ => 2,
    }
}
