// src/errors.rs

//! Crate-wide error types.
//!
//! Validation errors abort scheduling before any task runs. Runtime errors in
//! individual tasks never abort the engine; they are captured per task and
//! surfaced in the aggregated run report instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("duplicate job name '{0}'")]
    DuplicateJob(String),

    #[error("unknown job '{0}'")]
    UnknownJob(String),

    #[error("duplicate dependency edge {from} -> {to}")]
    DuplicateEdge { from: String, to: String },

    #[error("cycle detected in workflow graph involving job '{0}'")]
    CycleDetected(String),

    #[error("unknown target job '{0}'")]
    UnknownTarget(String),

    #[error("bad array spec for job '{job}': {reason}")]
    BadArraySpec { job: String, reason: String },

    /// A precondition returned false or errored. `task` includes the array
    /// index when the job is an array; `predicate` is the position of the
    /// predicate in declaration order.
    #[error("precondition {predicate} of {task} did not hold")]
    PreconditionViolated { task: String, predicate: usize },

    #[error("postcondition {predicate} of {task} did not hold")]
    PostconditionViolated { task: String, predicate: usize },

    /// A job body returned an error. The original error is kept as the cause
    /// chain.
    #[error("job {task} failed")]
    JobFailed {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("submitting job '{job}' to the batch scheduler failed")]
    SubmissionFailed {
        job: String,
        #[source]
        source: anyhow::Error,
    },

    /// The job (or one of its predicates) is an in-process closure and cannot
    /// be shipped to a cluster backend.
    #[error("cannot serialise {what} of job '{job}' for cluster execution")]
    CallableSerializationFailed { job: String, what: &'static str },

    /// The run was cancelled. Never treated as a failure in aggregates.
    #[error("workflow cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = WorkflowError> = std::result::Result<T, E>;
