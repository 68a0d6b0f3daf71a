// src/engine/state.rs

//! Per-task state machine and outcome aggregation.

use serde::Serialize;

use crate::workflow::job::{EdgeStatus, JobId};

/// Identifies one task of the active subgraph.
///
/// Scalar jobs have a single task with `index == 0`; engines never hand a
/// scalar body an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub job: JobId,
    pub index: usize,
}

/// Lifecycle of a task.
///
/// `Pending -> Running -> {Succeeded, Failed, Cancelled, Skipped}`; terminal
/// states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Aggregate outcome of an array across its per-index states.
///
/// Defined only once every index is terminal: failed if any index failed,
/// else cancelled if any index was cancelled, else skipped if every index
/// was skipped, else succeeded.
pub(crate) fn aggregate(states: impl IntoIterator<Item = TaskState>) -> Option<TaskState> {
    let mut any_cancelled = false;
    let mut all_skipped = true;
    let mut seen = false;

    for state in states {
        seen = true;
        match state {
            TaskState::Failed => return Some(TaskState::Failed),
            TaskState::Cancelled => any_cancelled = true,
            TaskState::Skipped => {}
            TaskState::Succeeded => all_skipped = false,
            TaskState::Pending | TaskState::Running => return None,
        }
    }

    if !seen {
        return Some(TaskState::Skipped);
    }
    if any_cancelled {
        Some(TaskState::Cancelled)
    } else if all_skipped {
        Some(TaskState::Skipped)
    } else {
        Some(TaskState::Succeeded)
    }
}

/// Whether a predecessor's aggregate outcome satisfies an edge requirement.
///
/// A skipped predecessor counts as success.
pub(crate) fn compatible(outcome: TaskState, status: EdgeStatus) -> bool {
    match status {
        EdgeStatus::Success => matches!(outcome, TaskState::Succeeded | TaskState::Skipped),
        EdgeStatus::Failure => matches!(outcome, TaskState::Failed),
        EdgeStatus::Any => outcome.is_terminal(),
    }
}

/// One captured task failure, kept for the aggregated report.
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub job: String,
    pub index: Option<usize>,
    /// Head of the error chain, formatted with causes.
    pub error: String,
}
