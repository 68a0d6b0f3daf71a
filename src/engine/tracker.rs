// src/engine/tracker.rs

//! Per-task state table and readiness logic.
//!
//! The tracker owns one state per (job, index) pair of the active subgraph
//! and decides, on every completion, which jobs become ready and which become
//! unsatisfiable. All tasks of a job are gated together because dependency
//! edges are job-level; their states only diverge once dispatched.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::state::{aggregate, compatible, TaskFailure, TaskKey, TaskState};
use crate::workflow::{ActiveGraph, JobId, JobPlan, Join, Workflow};

/// Result of a gate re-evaluation: tasks to dispatch and tasks cancelled
/// because their join can no longer be satisfied.
#[derive(Debug, Default)]
pub(crate) struct GateOutcome {
    pub ready: Vec<TaskKey>,
    pub cancelled: Vec<(TaskKey, String)>,
}

enum JobEntry {
    /// Pruned or empty; behaves as a terminal skipped aggregate.
    Skipped,
    /// Live tasks keyed by array index (scalar jobs use index 0).
    Tasks(BTreeMap<usize, TaskState>),
}

enum Gate {
    Wait,
    Open,
    Unsatisfiable(String),
}

pub(crate) struct TaskTracker {
    workflow: Arc<Workflow>,
    /// Indexed by job id; `None` outside the active subgraph.
    entries: Vec<Option<JobEntry>>,
    /// Jobs whose tasks are still pending, awaiting their gate.
    waiting: Vec<JobId>,
    failures: Vec<TaskFailure>,
    cancelling: bool,
}

impl TaskTracker {
    pub fn new(workflow: Arc<Workflow>, active: &ActiveGraph) -> Self {
        let mut entries: Vec<Option<JobEntry>> = Vec::with_capacity(workflow.len());
        let mut waiting = Vec::new();

        for id in 0..workflow.len() {
            let id = JobId(id);
            let entry = match active.plan(id) {
                None => None,
                Some(JobPlan::Skipped) => Some(JobEntry::Skipped),
                Some(JobPlan::Live { indices }) => {
                    waiting.push(id);
                    Some(JobEntry::Tasks(
                        indices.iter().map(|i| (*i, TaskState::Pending)).collect(),
                    ))
                }
            };
            entries.push(entry);
        }

        Self {
            workflow,
            entries,
            waiting,
            failures: Vec::new(),
            cancelling: false,
        }
    }

    /// Evaluate every gate once at startup.
    pub fn initial_ready(&mut self) -> GateOutcome {
        self.evaluate_gates()
    }

    /// Record a terminal outcome for one task and re-evaluate gates.
    ///
    /// Returns the state actually recorded (a completion arriving during
    /// cancellation is recorded as cancelled regardless of its own outcome)
    /// together with any newly ready or newly cancelled tasks.
    pub fn record_completion(
        &mut self,
        key: TaskKey,
        outcome: TaskState,
        error: Option<String>,
    ) -> (TaskState, GateOutcome) {
        let job = self.workflow.job(key.job);
        let recorded = if self.cancelling {
            TaskState::Cancelled
        } else {
            outcome
        };

        match self.entries[key.job.0] {
            Some(JobEntry::Tasks(ref mut tasks)) => match tasks.get_mut(&key.index) {
                Some(state) if state.is_terminal() => {
                    warn!(task = %job.task_label(job.body_index(key.index)),
                          "completion for a task already terminal; ignoring");
                    return (*state, GateOutcome::default());
                }
                Some(state) => {
                    *state = recorded;
                }
                None => {
                    warn!(job = %job.name, index = key.index,
                          "completion for an unknown task index; ignoring");
                    return (recorded, GateOutcome::default());
                }
            },
            _ => {
                warn!(job = %job.name, "completion for an unscheduled job; ignoring");
                return (recorded, GateOutcome::default());
            }
        }

        if recorded == TaskState::Failed {
            self.failures.push(TaskFailure {
                job: job.name.clone(),
                index: job.body_index(key.index),
                error: error.unwrap_or_else(|| "task failed".into()),
            });
        }

        debug!(task = %job.task_label(job.body_index(key.index)), state = %recorded,
               "task reached a terminal state");

        let gates = if self.cancelling {
            GateOutcome::default()
        } else {
            self.evaluate_gates()
        };
        (recorded, gates)
    }

    /// Cancel every pending task. Running tasks are left to finish; their
    /// completions will be recorded as cancelled.
    pub fn cancel_pending(&mut self) -> Vec<TaskKey> {
        self.cancelling = true;
        let mut cancelled = Vec::new();

        for id in std::mem::take(&mut self.waiting) {
            if let Some(JobEntry::Tasks(tasks)) = &mut self.entries[id.0] {
                for (index, state) in tasks.iter_mut() {
                    if *state == TaskState::Pending {
                        *state = TaskState::Cancelled;
                        cancelled.push(TaskKey { job: id, index: *index });
                    }
                }
            }
        }

        debug!(count = cancelled.len(), "cancelled all pending tasks");
        cancelled
    }

    /// True once every task of the active subgraph is terminal.
    pub fn is_quiescent(&self) -> bool {
        self.entries.iter().flatten().all(|entry| match entry {
            JobEntry::Skipped => true,
            JobEntry::Tasks(tasks) => tasks.values().all(|s| s.is_terminal()),
        })
    }

    pub fn failures(&self) -> &[TaskFailure] {
        &self.failures
    }

    /// Aggregate outcome of a job, once all of its tasks are terminal.
    pub fn aggregate_of(&self, id: JobId) -> Option<TaskState> {
        match self.entries[id.0].as_ref()? {
            JobEntry::Skipped => Some(TaskState::Skipped),
            JobEntry::Tasks(tasks) => aggregate(tasks.values().copied()),
        }
    }

    /// Final per-job and per-task states for the run report.
    pub fn job_states(&self) -> Vec<(JobId, TaskState, Vec<(usize, TaskState)>)> {
        let mut out = Vec::new();
        for id in 0..self.entries.len() {
            let id = JobId(id);
            match &self.entries[id.0] {
                None => {}
                Some(JobEntry::Skipped) => out.push((id, TaskState::Skipped, Vec::new())),
                Some(JobEntry::Tasks(tasks)) => {
                    let agg = aggregate(tasks.values().copied()).unwrap_or(TaskState::Pending);
                    let per_task = tasks.iter().map(|(i, s)| (*i, *s)).collect();
                    out.push((id, agg, per_task));
                }
            }
        }
        out
    }

    /// Re-evaluate the gate of every waiting job until a fixpoint: a
    /// cancellation can make further joins unsatisfiable in cascade.
    fn evaluate_gates(&mut self) -> GateOutcome {
        let mut outcome = GateOutcome::default();

        loop {
            let mut changed = false;

            for id in std::mem::take(&mut self.waiting) {
                match self.gate(id) {
                    Gate::Wait => self.waiting.push(id),
                    Gate::Open => {
                        changed = true;
                        self.release(id, &mut outcome.ready);
                    }
                    Gate::Unsatisfiable(reason) => {
                        changed = true;
                        self.cancel_job(id, &reason, &mut outcome.cancelled);
                    }
                }
            }

            if !changed {
                break;
            }
        }

        outcome
    }

    /// Decide whether a waiting job can start, must keep waiting, or can
    /// never be admitted.
    fn gate(&self, id: JobId) -> Gate {
        let job = self.workflow.job(id);
        let deps = self.workflow.dependencies_of(id);

        match job.join {
            Join::All => {
                let mut all_terminal = true;
                for (dep, status) in deps {
                    match self.aggregate_of(*dep) {
                        Some(agg) if !compatible(agg, *status) => {
                            return Gate::Unsatisfiable(format!(
                                "unsatisfied dependency: '{}' finished {}",
                                self.workflow.job(*dep).name,
                                agg
                            ));
                        }
                        Some(_) => {}
                        None => all_terminal = false,
                    }
                }
                if all_terminal {
                    Gate::Open
                } else {
                    Gate::Wait
                }
            }
            Join::Any => {
                if deps.is_empty() {
                    return Gate::Open;
                }
                let mut all_terminal = true;
                for (dep, status) in deps {
                    match self.aggregate_of(*dep) {
                        Some(agg) if compatible(agg, *status) => return Gate::Open,
                        Some(_) => {}
                        None => all_terminal = false,
                    }
                }
                if all_terminal {
                    Gate::Unsatisfiable("no dependency satisfied".into())
                } else {
                    Gate::Wait
                }
            }
        }
    }

    /// Move every pending task of the job to running and queue it for
    /// dispatch. Array tasks are released together; the engine imposes no
    /// intra-array ordering.
    fn release(&mut self, id: JobId, ready: &mut Vec<TaskKey>) {
        if let Some(JobEntry::Tasks(tasks)) = &mut self.entries[id.0] {
            for (index, state) in tasks.iter_mut() {
                if *state == TaskState::Pending {
                    *state = TaskState::Running;
                    ready.push(TaskKey { job: id, index: *index });
                }
            }
        }
        debug!(job = %self.workflow.job(id).name, "dependencies satisfied; job released");
    }

    fn cancel_job(&mut self, id: JobId, reason: &str, cancelled: &mut Vec<(TaskKey, String)>) {
        if let Some(JobEntry::Tasks(tasks)) = &mut self.entries[id.0] {
            for (index, state) in tasks.iter_mut() {
                if *state == TaskState::Pending {
                    *state = TaskState::Cancelled;
                    cancelled.push((TaskKey { job: id, index: *index }, reason.to_string()));
                }
            }
        }
        debug!(job = %self.workflow.job(id).name, reason, "join unsatisfiable; job cancelled");
    }
}
