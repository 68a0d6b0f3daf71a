// src/workflow/job.rs

//! Immutable job descriptors: bodies, predicates, resources and edge kinds.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;

/// Opaque identifier of a job inside one workflow.
///
/// Ids are arena indices handed out by the builder; they are only meaningful
/// for the builder (and the workflow frozen from it) that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) usize);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Predecessor outcome required by a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeStatus {
    Success,
    Failure,
    Any,
}

/// How a job combines its incoming edge requirements.
///
/// `All` is a conjunction over every edge, `Any` a disjunction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Join {
    #[default]
    All,
    Any,
}

type BodyFn = dyn Fn(Option<usize>) -> Result<()> + Send + Sync;

/// The opaque unit of work attached to a job.
///
/// `Func` bodies run in-process on the local backend and cannot be shipped to
/// a cluster. `Command` bodies are shell commands run via `sh -c`; the Slurm
/// translator writes them to a body file that the generated submission script
/// invokes with the array index as `$1`.
#[derive(Clone)]
pub enum Executable {
    Func(Arc<BodyFn>),
    Command(String),
}

impl Executable {
    /// Body for a scalar job; the closure takes no index.
    pub fn scalar<F>(f: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        Executable::Func(Arc::new(move |_| f()))
    }

    /// Body for an array job; the closure receives the task index.
    pub fn per_task<F>(f: F) -> Self
    where
        F: Fn(usize) -> Result<()> + Send + Sync + 'static,
    {
        Executable::Func(Arc::new(move |index| match index {
            Some(i) => f(i),
            None => Err(anyhow::anyhow!("array body invoked without an index")),
        }))
    }

    /// Shell command body, runnable on both backends.
    pub fn command(cmd: impl Into<String>) -> Self {
        Executable::Command(cmd.into())
    }
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Executable::Func(_) => f.write_str("Executable::Func(..)"),
            Executable::Command(cmd) => write!(f, "Executable::Command({cmd:?})"),
        }
    }
}

type ScalarPredFn = dyn Fn() -> Result<bool> + Send + Sync;
type PerTaskPredFn = dyn Fn(usize) -> Result<bool> + Send + Sync;

/// A side-effect-free check attached to a job as pre- or postcondition.
///
/// An `Err` from a predicate is treated as "does not hold". `Command`
/// predicates hold when the command exits 0; like bodies, they receive the
/// array index as `$1` when the job is an array.
#[derive(Clone)]
pub enum Predicate {
    Scalar(Arc<ScalarPredFn>),
    PerTask(Arc<PerTaskPredFn>),
    Command(String),
}

impl Predicate {
    pub fn scalar<F>(f: F) -> Self
    where
        F: Fn() -> Result<bool> + Send + Sync + 'static,
    {
        Predicate::Scalar(Arc::new(f))
    }

    pub fn per_task<F>(f: F) -> Self
    where
        F: Fn(usize) -> Result<bool> + Send + Sync + 'static,
    {
        Predicate::PerTask(Arc::new(f))
    }

    pub fn command(cmd: impl Into<String>) -> Self {
        Predicate::Command(cmd.into())
    }

    pub(crate) fn is_per_task(&self) -> bool {
        matches!(self, Predicate::PerTask(_))
    }

    /// Evaluate the predicate for the given task index.
    ///
    /// Blocking: `Command` predicates spawn a process and wait for it. Callers
    /// on the async runtime evaluate predicates off the scheduler loop.
    pub(crate) fn holds(&self, index: Option<usize>) -> Result<bool> {
        match self {
            Predicate::Scalar(f) => f(),
            Predicate::PerTask(f) => match index {
                Some(i) => f(i),
                None => Err(anyhow::anyhow!("per-task predicate evaluated without an index")),
            },
            Predicate::Command(cmd) => {
                let mut command = std::process::Command::new("sh");
                command.arg("-c").arg(cmd).arg("dagrun");
                if let Some(i) = index {
                    command.arg(i.to_string());
                }
                let status = command.status()?;
                Ok(status.success())
            }
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Scalar(_) => f.write_str("Predicate::Scalar(..)"),
            Predicate::PerTask(_) => f.write_str("Predicate::PerTask(..)"),
            Predicate::Command(cmd) => write!(f, "Predicate::Command({cmd:?})"),
        }
    }
}

/// Ordered scheduler hints, uninterpreted by the core.
///
/// Known keys (`cpus`, `gpus`, `ram`, `time`, `partition`) are translated to
/// the matching `#SBATCH` directives by the Slurm backend; unknown keys pass
/// through verbatim. A `None` value renders as a bare flag.
#[derive(Debug, Clone, Default)]
pub struct Resources {
    entries: Vec<(String, Option<String>)>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a hint, keeping declaration order for new keys.
    pub fn set(&mut self, key: impl Into<String>, value: Option<String>) {
        let key = key.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Chainable form of [`set`](Self::set) for declaration sites.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, Some(value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }
}

/// An immutable job record.
///
/// Constructed through [`JobSpec`] and the builder; frozen together with the
/// graph. `array_size == 1` means scalar.
#[derive(Debug, Clone)]
pub struct Job {
    pub(crate) id: JobId,
    pub name: String,
    pub body: Executable,
    pub array_size: usize,
    pub array_throttle: Option<usize>,
    pub resources: Resources,
    pub preconditions: Vec<Predicate>,
    pub postconditions: Vec<Predicate>,
    pub join: Join,
    pub skipped: bool,
}

impl Job {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn is_array(&self) -> bool {
        self.array_size > 1
    }

    /// Human label for a task of this job: `name` or `name[index]`.
    pub fn task_label(&self, index: Option<usize>) -> String {
        match index {
            Some(i) if self.is_array() => format!("{}[{}]", self.name, i),
            _ => self.name.clone(),
        }
    }

    /// The index passed to bodies and predicates of this job's tasks.
    pub(crate) fn body_index(&self, index: usize) -> Option<usize> {
        if self.is_array() {
            Some(index)
        } else {
            None
        }
    }
}

/// Declaration-time description of a job, consumed by the builder.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub body: Executable,
    pub array_size: usize,
    pub array_throttle: Option<usize>,
    pub resources: Resources,
    pub skipped: bool,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, body: Executable) -> Self {
        Self {
            name: name.into(),
            body,
            array_size: 1,
            array_throttle: None,
            resources: Resources::new(),
            skipped: false,
        }
    }

    /// Fan the job out as an array of `size` tasks.
    pub fn array(mut self, size: usize) -> Self {
        self.array_size = size;
        self
    }

    /// Cap concurrent array tasks on cluster backends. Ignored locally.
    pub fn array_throttle(mut self, throttle: usize) -> Self {
        self.array_throttle = Some(throttle);
        self
    }

    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Treat the job as completed without running its body.
    pub fn skipped(mut self, skipped: bool) -> Self {
        self.skipped = skipped;
        self
    }
}
