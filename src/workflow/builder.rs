// src/workflow/builder.rs

//! Workflow builder and validator.
//!
//! Jobs and edges may be declared in any order; every operation validates
//! eagerly so that mistakes surface at the declaration site. Acyclicity is
//! enforced at edge insertion with a reachability walk, and once more with a
//! petgraph toposort when the graph is frozen (the frozen order doubles as
//! the submission order for cluster backends).

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::errors::{Result, WorkflowError};
use crate::workflow::graph::{Edge, Workflow};
use crate::workflow::job::{EdgeStatus, Job, JobId, JobSpec, Join, Predicate};

/// Accumulates job and edge declarations, then freezes them into a
/// [`Workflow`].
#[derive(Debug, Default)]
pub struct WorkflowBuilder {
    jobs: Vec<Job>,
    names: HashMap<String, JobId>,
    edges: Vec<Edge>,
    /// Incoming edges per job, parallel to `jobs`.
    deps: Vec<Vec<(JobId, EdgeStatus)>>,
    /// Outgoing edges per job, parallel to `jobs`.
    dependents: Vec<Vec<JobId>>,
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a job. Fails on name collisions and malformed array specs.
    pub fn add_job(&mut self, spec: JobSpec) -> Result<JobId> {
        if self.names.contains_key(&spec.name) {
            return Err(WorkflowError::DuplicateJob(spec.name));
        }
        if spec.array_size == 0 {
            return Err(WorkflowError::BadArraySpec {
                job: spec.name,
                reason: "array size must be >= 1".into(),
            });
        }
        if let Some(throttle) = spec.array_throttle {
            if throttle == 0 || throttle > spec.array_size {
                return Err(WorkflowError::BadArraySpec {
                    job: spec.name,
                    reason: format!(
                        "array throttle {} outside [1, {}]",
                        throttle, spec.array_size
                    ),
                });
            }
        }

        let id = JobId(self.jobs.len());
        debug!(job = %spec.name, %id, array_size = spec.array_size, "job declared");

        self.names.insert(spec.name.clone(), id);
        self.jobs.push(Job {
            id,
            name: spec.name,
            body: spec.body,
            array_size: spec.array_size,
            array_throttle: spec.array_throttle,
            resources: spec.resources,
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            join: Join::default(),
            skipped: spec.skipped,
        });
        self.deps.push(Vec::new());
        self.dependents.push(Vec::new());
        Ok(id)
    }

    /// Declare that `to` depends on `from` with the given status requirement.
    ///
    /// At most one edge may exist per ordered pair. The edge is rejected if it
    /// would close a cycle.
    pub fn add_edge(&mut self, from: JobId, to: JobId, status: EdgeStatus) -> Result<()> {
        self.check_id(from)?;
        self.check_id(to)?;

        if from == to {
            return Err(WorkflowError::CycleDetected(self.jobs[to.0].name.clone()));
        }
        if self.deps[to.0].iter().any(|(dep, _)| *dep == from) {
            return Err(WorkflowError::DuplicateEdge {
                from: self.jobs[from.0].name.clone(),
                to: self.jobs[to.0].name.clone(),
            });
        }
        // Adding from -> to closes a cycle iff `from` is already downstream
        // of `to`.
        if self.reaches(to, from) {
            return Err(WorkflowError::CycleDetected(self.jobs[from.0].name.clone()));
        }

        self.deps[to.0].push((from, status));
        self.dependents[from.0].push(to);
        self.edges.push(Edge { from, to, status });
        Ok(())
    }

    /// Convenience: make `job` depend on every entry of `deps`.
    pub fn after(&mut self, job: JobId, deps: &[JobId], status: EdgeStatus) -> Result<()> {
        for dep in deps {
            self.add_edge(*dep, job, status)?;
        }
        Ok(())
    }

    /// Set how the job combines its incoming edges. Default is [`Join::All`].
    pub fn waitfor(&mut self, job: JobId, join: Join) -> Result<()> {
        self.check_id(job)?;
        self.jobs[job.0].join = join;
        Ok(())
    }

    /// Attach a precondition, evaluated immediately before the body.
    pub fn require(&mut self, job: JobId, predicate: Predicate) -> Result<()> {
        self.check_predicate(job, &predicate)?;
        self.jobs[job.0].preconditions.push(predicate);
        Ok(())
    }

    /// Attach a postcondition, evaluated after the body and consulted by the
    /// pruner to skip already-satisfied work.
    pub fn ensure(&mut self, job: JobId, predicate: Predicate) -> Result<()> {
        self.check_predicate(job, &predicate)?;
        self.jobs[job.0].postconditions.push(predicate);
        Ok(())
    }

    /// Look a declared job up by name.
    pub fn job_id(&self, name: &str) -> Option<JobId> {
        self.names.get(name).copied()
    }

    /// Validate the targets and freeze the graph into an immutable
    /// [`Workflow`].
    pub fn freeze(self, targets: &[JobId]) -> Result<Workflow> {
        for target in targets {
            if target.0 >= self.jobs.len() {
                return Err(WorkflowError::UnknownTarget(target.to_string()));
            }
        }

        let topo = self.topo_order()?;
        debug!(
            jobs = self.jobs.len(),
            edges = self.edges.len(),
            targets = targets.len(),
            "workflow frozen"
        );

        Ok(Workflow::new(
            self.jobs,
            self.deps,
            self.dependents,
            self.edges,
            targets.to_vec(),
            topo,
        ))
    }

    fn check_id(&self, id: JobId) -> Result<()> {
        if id.0 < self.jobs.len() {
            Ok(())
        } else {
            Err(WorkflowError::UnknownJob(id.to_string()))
        }
    }

    fn check_predicate(&self, job: JobId, predicate: &Predicate) -> Result<()> {
        self.check_id(job)?;
        let job = &self.jobs[job.0];
        if predicate.is_per_task() && !job.is_array() {
            return Err(WorkflowError::BadArraySpec {
                job: job.name.clone(),
                reason: "per-task predicates are only allowed on array jobs".into(),
            });
        }
        Ok(())
    }

    /// Depth-first reachability over outgoing edges.
    fn reaches(&self, from: JobId, needle: JobId) -> bool {
        let mut stack = vec![from];
        let mut visited = vec![false; self.jobs.len()];

        while let Some(node) = stack.pop() {
            if node == needle {
                return true;
            }
            if std::mem::replace(&mut visited[node.0], true) {
                continue;
            }
            stack.extend(self.dependents[node.0].iter().copied());
        }
        false
    }

    /// Dependency-first topological order over the whole graph.
    ///
    /// Edge insertion already rejects cycles; this re-checks the invariant on
    /// the assembled graph and produces a stable submission order.
    fn topo_order(&self) -> Result<Vec<JobId>> {
        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();

        for id in 0..self.jobs.len() {
            graph.add_node(id);
        }
        for edge in &self.edges {
            graph.add_edge(edge.from.0, edge.to.0, ());
        }

        match toposort(&graph, None) {
            Ok(order) => Ok(order.into_iter().map(JobId).collect()),
            Err(cycle) => Err(WorkflowError::CycleDetected(
                self.jobs[cycle.node_id()].name.clone(),
            )),
        }
    }
}
