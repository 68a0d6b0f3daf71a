// src/engine/runtime.rs

//! The local asynchronous execution engine.
//!
//! A single event loop owns all task state. The executor sends
//! [`RuntimeEvent`]s over an mpsc channel; the loop feeds them to the
//! [`TaskTracker`](crate::engine::tracker::TaskTracker), emits sink events
//! and dispatches newly ready tasks. Failures are captured per task and the
//! loop always drives the run to quiescence.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::engine::state::{TaskKey, TaskState};
use crate::engine::tracker::{GateOutcome, TaskTracker};
use crate::engine::RunReport;
use crate::errors::Result;
use crate::events::{Event, EventSink};
use crate::exec::LocalExecutor;
use crate::workflow::{ActiveGraph, Workflow};

/// Events sent into the runtime by the executor and by cancel handles.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    TaskStarted {
        key: TaskKey,
    },
    TaskCompleted {
        key: TaskKey,
        outcome: TaskState,
        error: Option<String>,
    },
    CancelRequested,
}

/// Knobs for the local engine.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Upper bound on concurrently executing job bodies.
    pub workers: usize,
    /// Replace every body with a short randomised sleep (the `dummy`
    /// backend).
    pub dummy: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            dummy: false,
        }
    }
}

/// Requests cooperative cancellation of a running workflow.
///
/// Cancellation is monotonic: pending tasks are cancelled immediately,
/// running tasks are awaited and then recorded as cancelled.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: mpsc::Sender<RuntimeEvent>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.try_send(RuntimeEvent::CancelRequested);
    }
}

/// The local engine: tracker + executor + event loop.
pub struct Runtime {
    tracker: TaskTracker,
    executor: LocalExecutor,
    events_tx: mpsc::Sender<RuntimeEvent>,
    events_rx: mpsc::Receiver<RuntimeEvent>,
    sink: Arc<dyn EventSink>,
    workflow: Arc<Workflow>,
    cancelled: bool,
}

impl Runtime {
    pub fn new(
        workflow: Arc<Workflow>,
        active: &ActiveGraph,
        options: RuntimeOptions,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        let executor = LocalExecutor::new(workflow.clone(), events_tx.clone(), &options);

        Self {
            tracker: TaskTracker::new(workflow.clone(), active),
            executor,
            events_tx,
            events_rx,
            sink,
            workflow,
            cancelled: false,
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.events_tx.clone(),
        }
    }

    /// Drive the run to quiescence and return the aggregated report.
    ///
    /// Individual task failures never abort the loop; the only errors that
    /// surface here are wiring failures.
    pub async fn run(mut self) -> Result<RunReport> {
        info!("local engine started");

        let initial = self.tracker.initial_ready();
        self.apply(initial);

        while !self.tracker.is_quiescent() {
            // The runtime holds a sender itself, so the channel cannot close
            // while tasks are in flight.
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            debug!(?event, "runtime received event");

            match event {
                RuntimeEvent::TaskStarted { key } => {
                    let job = self.workflow.job(key.job);
                    self.sink.emit(&Event::TaskStarted {
                        job: job.name.clone(),
                        index: job.body_index(key.index),
                    });
                }
                RuntimeEvent::TaskCompleted { key, outcome, error } => {
                    let (recorded, gates) =
                        self.tracker.record_completion(key, outcome, error.clone());
                    self.emit_finished(key, recorded, error);
                    self.apply(gates);
                }
                RuntimeEvent::CancelRequested => self.handle_cancel(),
            }
        }

        info!("local engine quiescent");
        Ok(self.report())
    }

    /// Emit events for cancelled tasks and hand ready tasks to the executor.
    fn apply(&mut self, gates: GateOutcome) {
        for (key, reason) in gates.cancelled {
            self.emit_finished(key, TaskState::Cancelled, Some(reason));
        }
        for key in gates.ready {
            self.executor.spawn(key);
        }
    }

    fn handle_cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        info!("cancellation requested; no new tasks will start");

        for key in self.tracker.cancel_pending() {
            self.emit_finished(key, TaskState::Cancelled, Some("workflow cancelled".into()));
        }
    }

    fn emit_finished(&self, key: TaskKey, state: TaskState, error: Option<String>) {
        let job = self.workflow.job(key.job);
        self.sink.emit(&Event::TaskFinished {
            job: job.name.clone(),
            index: job.body_index(key.index),
            state,
            error,
        });
    }

    fn report(&self) -> RunReport {
        let jobs = self
            .tracker
            .job_states()
            .into_iter()
            .map(|(id, state, tasks)| crate::engine::JobResult {
                name: self.workflow.job(id).name.clone(),
                state,
                tasks,
            })
            .collect();

        RunReport {
            jobs,
            failures: self.tracker.failures().to_vec(),
            cancelled: self.cancelled,
            external_ids: None,
        }
    }
}
