// src/events.rs

//! Event sink interface shared by both backends.
//!
//! Engines push lifecycle events; consumers (logging, the persisted event
//! log, the history CLI) decide what to do with them. Implementations must
//! not block for long: the local runtime emits events from its scheduler
//! loop.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::state::TaskState;

/// Summary reported when a run reaches quiescence.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub job_count: usize,
    pub error_count: usize,
    pub cancelled: bool,
}

/// A lifecycle event pushed by an engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    WorkflowStarted {
        workflow_id: String,
        name: String,
        backend: String,
        job_count: usize,
        task_count: usize,
        timestamp: DateTime<Utc>,
    },
    TaskStarted {
        job: String,
        index: Option<usize>,
    },
    TaskFinished {
        job: String,
        index: Option<usize>,
        state: TaskState,
        error: Option<String>,
    },
    /// A pruning-time predicate errored; the job was conservatively left
    /// live.
    PredicateError {
        job: String,
        index: Option<usize>,
        predicate: usize,
        error: String,
    },
    WorkflowFinished {
        summary: RunSummary,
    },
}

/// Push interface for run events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    fn emit(&self, event: &Event) {
        (**self).emit(event)
    }
}

/// Default sink: structured logs via `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &Event) {
        match event {
            Event::WorkflowStarted {
                name,
                backend,
                job_count,
                task_count,
                ..
            } => {
                info!(workflow = %name, %backend, job_count, task_count, "workflow started");
            }
            Event::TaskStarted { job, index } => {
                info!(task = %label(job, *index), "task started");
            }
            Event::TaskFinished {
                job,
                index,
                state,
                error,
            } => match error {
                Some(err) => warn!(task = %label(job, *index), %state, error = %err, "task finished"),
                None => info!(task = %label(job, *index), %state, "task finished"),
            },
            Event::PredicateError {
                job,
                index,
                predicate,
                error,
            } => {
                warn!(
                    task = %label(job, *index),
                    predicate,
                    error = %error,
                    "postcondition errored during pruning; leaving job live"
                );
            }
            Event::WorkflowFinished { summary } => {
                info!(
                    job_count = summary.job_count,
                    error_count = summary.error_count,
                    cancelled = summary.cancelled,
                    "workflow finished"
                );
            }
        }
    }
}

fn label(job: &str, index: Option<usize>) -> String {
    match index {
        Some(i) => format!("{job}[{i}]"),
        None => job.to_string(),
    }
}

/// Sink that records events in memory. Used by tests to assert event order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Sink that appends one JSON object per line to an open file.
///
/// Write failures are logged and otherwise ignored; the event log must never
/// take the run down with it.
pub struct JsonlSink {
    file: Mutex<std::fs::File>,
}

impl JsonlSink {
    pub fn create(path: &std::path::Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, event: &Event) {
        use std::io::Write;

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "failed to serialise event for the event log");
                return;
            }
        };
        if let Err(err) = writeln!(file, "{line}") {
            warn!(error = %err, "failed to append to the event log");
        }
    }
}

/// Fans events out to several sinks.
pub struct MultiSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for MultiSink {
    fn emit(&self, event: &Event) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
