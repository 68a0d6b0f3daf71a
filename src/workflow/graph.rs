// src/workflow/graph.rs

//! The frozen workflow graph.
//!
//! Jobs live in an id-indexed arena with forward and reverse adjacency built
//! once at freeze time. Engines treat the whole structure as read-only for
//! the duration of a run.

use crate::workflow::job::{EdgeStatus, Job, JobId};

/// A dependency edge `(from, to, status)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: JobId,
    pub to: JobId,
    pub status: EdgeStatus,
}

/// An immutable workflow: jobs, edges and the scheduled targets.
#[derive(Debug, Clone)]
pub struct Workflow {
    jobs: Vec<Job>,
    /// Incoming edges per job, parallel to `jobs`.
    deps: Vec<Vec<(JobId, EdgeStatus)>>,
    /// Outgoing edges per job, parallel to `jobs`.
    dependents: Vec<Vec<JobId>>,
    edges: Vec<Edge>,
    targets: Vec<JobId>,
    /// Dependency-first order over all jobs.
    topo: Vec<JobId>,
}

impl Workflow {
    pub(crate) fn new(
        jobs: Vec<Job>,
        deps: Vec<Vec<(JobId, EdgeStatus)>>,
        dependents: Vec<Vec<JobId>>,
        edges: Vec<Edge>,
        targets: Vec<JobId>,
        topo: Vec<JobId>,
    ) -> Self {
        Self {
            jobs,
            deps,
            dependents,
            edges,
            targets,
            topo,
        }
    }

    pub fn job(&self, id: JobId) -> &Job {
        &self.jobs[id.0]
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Direct dependencies of a job, with the status each edge requires.
    pub fn dependencies_of(&self, id: JobId) -> &[(JobId, EdgeStatus)] {
        &self.deps[id.0]
    }

    /// Direct dependents of a job.
    pub fn dependents_of(&self, id: JobId) -> &[JobId] {
        &self.dependents[id.0]
    }

    pub fn targets(&self) -> &[JobId] {
        &self.targets
    }

    /// Dependency-first order over the whole graph, fixed at freeze time.
    pub fn topo_order(&self) -> &[JobId] {
        &self.topo
    }

    /// Every ancestor of the targets, targets included, via a reverse walk
    /// over incoming edges.
    pub(crate) fn reachable_from_targets(&self) -> Vec<JobId> {
        let mut visited = vec![false; self.jobs.len()];
        let mut stack: Vec<JobId> = self.targets.clone();

        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut visited[id.0], true) {
                continue;
            }
            stack.extend(self.deps[id.0].iter().map(|(dep, _)| *dep));
        }

        // Report in topological order so downstream consumers get a stable,
        // dependency-first view.
        self.topo
            .iter()
            .copied()
            .filter(|id| visited[id.0])
            .collect()
    }
}
