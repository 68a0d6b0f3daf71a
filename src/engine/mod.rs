// src/engine/mod.rs

//! Local asynchronous execution engine: per-task state tracking plus the
//! runtime event loop.

pub mod runtime;
pub mod state;
pub(crate) mod tracker;

use std::collections::BTreeMap;

pub use runtime::{CancelHandle, Runtime, RuntimeEvent, RuntimeOptions};
pub use state::{TaskFailure, TaskKey, TaskState};

use crate::events::RunSummary;

/// Final state of one scheduled job.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub name: String,
    /// Aggregate outcome; for arrays, the join of the per-index states.
    pub state: TaskState,
    /// Per-index states. Empty for scalar and fully skipped jobs.
    pub tasks: Vec<(usize, TaskState)>,
}

/// Aggregated result of a run that reached quiescence.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub jobs: Vec<JobResult>,
    pub failures: Vec<TaskFailure>,
    pub cancelled: bool,
    /// Batch scheduler ids by job name, present on cluster submissions.
    pub external_ids: Option<BTreeMap<String, String>>,
}

impl RunReport {
    /// Aggregate state of a job by name.
    pub fn state_of(&self, name: &str) -> Option<TaskState> {
        self.jobs.iter().find(|j| j.name == name).map(|j| j.state)
    }

    /// State of one array task by name and index.
    pub fn task_state_of(&self, name: &str, index: usize) -> Option<TaskState> {
        self.jobs
            .iter()
            .find(|j| j.name == name)?
            .tasks
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, s)| *s)
    }

    pub fn error_count(&self) -> usize {
        self.failures.len()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Process exit code: 0 when quiescent with no failures, 1 on any
    /// failure, 3 on user cancellation.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            3
        } else if self.failures.is_empty() {
            0
        } else {
            1
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            job_count: self.job_count(),
            error_count: self.error_count(),
            cancelled: self.cancelled,
        }
    }
}
