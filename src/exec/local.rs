// src/exec/local.rs

//! Task execution off the scheduler loop.
//!
//! Each ready task runs in its own Tokio task: preconditions, then the body,
//! then postconditions. Closure bodies are delegated to the blocking pool
//! under a semaphore bound so that concurrent tasks truly overlap during
//! blocking work; command bodies run as `sh -c` child processes.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::engine::runtime::{RuntimeEvent, RuntimeOptions};
use crate::engine::state::{TaskKey, TaskState};
use crate::errors::WorkflowError;
use crate::workflow::job::{Executable, Job, Predicate};
use crate::workflow::Workflow;

/// Spawns one Tokio task per ready workflow task and reports outcomes back
/// to the runtime over the event channel.
pub struct LocalExecutor {
    workflow: Arc<Workflow>,
    events_tx: mpsc::Sender<RuntimeEvent>,
    /// Bounds concurrently executing bodies.
    permits: Arc<Semaphore>,
    dummy: bool,
}

impl LocalExecutor {
    pub(crate) fn new(
        workflow: Arc<Workflow>,
        events_tx: mpsc::Sender<RuntimeEvent>,
        options: &RuntimeOptions,
    ) -> Self {
        Self {
            workflow,
            events_tx,
            permits: Arc::new(Semaphore::new(options.workers.max(1))),
            dummy: options.dummy,
        }
    }

    pub(crate) fn spawn(&self, key: TaskKey) {
        let workflow = self.workflow.clone();
        let tx = self.events_tx.clone();
        let permits = self.permits.clone();
        let dummy = self.dummy;

        tokio::spawn(async move {
            let _ = tx.send(RuntimeEvent::TaskStarted { key }).await;

            let (outcome, error) = match run_task(&workflow, key, &permits, dummy).await {
                Ok(()) => (TaskState::Succeeded, None),
                Err(err) => (TaskState::Failed, Some(error_chain(&err))),
            };

            // The receiver only goes away at engine teardown.
            let _ = tx
                .send(RuntimeEvent::TaskCompleted { key, outcome, error })
                .await;
        });
    }
}

/// Format an error with its cause chain, oldest cause last.
fn error_chain(err: &WorkflowError) -> String {
    let mut out = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

async fn run_task(
    workflow: &Workflow,
    key: TaskKey,
    permits: &Semaphore,
    dummy: bool,
) -> Result<(), WorkflowError> {
    let job = workflow.job(key.job);
    let index = job.body_index(key.index);
    let label = job.task_label(index);

    for (position, predicate) in job.preconditions.iter().enumerate() {
        match evaluate(predicate, index).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(WorkflowError::PreconditionViolated {
                    task: label,
                    predicate: position,
                })
            }
            Err(err) => {
                warn!(task = %label, predicate = position, error = %format!("{err:#}"),
                      "precondition errored; treating as violated");
                return Err(WorkflowError::PreconditionViolated {
                    task: label,
                    predicate: position,
                });
            }
        }
    }

    if job.skipped {
        debug!(task = %label, "job flagged skipped; synthesising success");
        return Ok(());
    }

    if dummy {
        run_dummy(&label).await;
    } else {
        run_body(job, index, &label, permits).await?;
    }

    for (position, predicate) in job.postconditions.iter().enumerate() {
        match evaluate(predicate, index).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(WorkflowError::PostconditionViolated {
                    task: label,
                    predicate: position,
                })
            }
            Err(err) => {
                warn!(task = %label, predicate = position, error = %format!("{err:#}"),
                      "postcondition errored; treating as violated");
                return Err(WorkflowError::PostconditionViolated {
                    task: label,
                    predicate: position,
                });
            }
        }
    }

    Ok(())
}

async fn run_body(
    job: &Job,
    index: Option<usize>,
    label: &str,
    permits: &Semaphore,
) -> Result<(), WorkflowError> {
    // Never closed; acquire can only fail after that.
    let _permit = permits
        .acquire()
        .await
        .map_err(|e| WorkflowError::Other(anyhow!("worker pool closed: {e}")))?;

    match &job.body {
        Executable::Func(f) => {
            let f = f.clone();
            match tokio::task::spawn_blocking(move || f(index)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(source)) => Err(WorkflowError::JobFailed {
                    task: label.to_string(),
                    source,
                }),
                Err(join_err) => Err(WorkflowError::JobFailed {
                    task: label.to_string(),
                    source: anyhow!("job body panicked: {join_err}"),
                }),
            }
        }
        Executable::Command(cmd) => run_command(cmd, index, label).await,
    }
}

/// Run a shell command body, passing the array index as `$1` when present.
async fn run_command(cmd: &str, index: Option<usize>, label: &str) -> Result<(), WorkflowError> {
    info!(task = %label, cmd = %cmd, "starting task process");

    let mut command = tokio::process::Command::new("sh");
    command.arg("-c").arg(cmd).arg("dagrun");
    if let Some(i) = index {
        command.arg(i.to_string());
    }
    command.kill_on_drop(true);

    let status = command
        .status()
        .await
        .with_context(|| format!("spawning process for task '{label}'"))
        .map_err(|source| WorkflowError::JobFailed {
            task: label.to_string(),
            source,
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(WorkflowError::JobFailed {
            task: label.to_string(),
            source: anyhow!("command exited with status {}", status.code().unwrap_or(-1)),
        })
    }
}

/// Dummy backend body: a short randomised sleep between START and END
/// traces.
async fn run_dummy(label: &str) {
    let ms = rand::thread_rng().gen_range(200..700);
    info!(task = %label, "START");
    tokio::time::sleep(Duration::from_millis(ms)).await;
    info!(task = %label, "END");
}

async fn evaluate(predicate: &Predicate, index: Option<usize>) -> anyhow::Result<bool> {
    match predicate {
        Predicate::Scalar(f) => {
            let f = f.clone();
            tokio::task::spawn_blocking(move || f())
                .await
                .map_err(|e| anyhow!("predicate panicked: {e}"))?
        }
        Predicate::PerTask(f) => {
            let i = index.ok_or_else(|| anyhow!("per-task predicate evaluated without an index"))?;
            let f = f.clone();
            tokio::task::spawn_blocking(move || f(i))
                .await
                .map_err(|e| anyhow!("predicate panicked: {e}"))?
        }
        Predicate::Command(cmd) => {
            let mut command = tokio::process::Command::new("sh");
            command.arg("-c").arg(cmd).arg("dagrun");
            if let Some(i) = index {
                command.arg(i.to_string());
            }
            let status = command.status().await?;
            Ok(status.success())
        }
    }
}
