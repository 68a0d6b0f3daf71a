// src/workflow/prune.rs

//! Traversal and pruning: derives the active subgraph for a run.
//!
//! The active subgraph is the set of ancestors of the scheduled targets.
//! With pruning enabled, jobs whose postconditions already hold are marked
//! skipped instead of live; skipped jobs stay in the subgraph so that their
//! dependents' edges remain answerable, and contribute a synthetic success
//! downstream.

use tracing::{debug, warn};

use crate::events::{Event, EventSink};
use crate::workflow::graph::Workflow;
use crate::workflow::job::{Job, JobId};

/// Plan for one scheduled job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPlan {
    /// Task indices that still need to run. Scalar jobs hold a single `0`.
    Live { indices: Vec<usize> },
    /// Every task's postconditions already hold; nothing to run.
    Skipped,
}

/// The subset of the workflow scheduled from the target set, after pruning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveGraph {
    /// Indexed by job id; `None` for jobs outside the active subgraph.
    plans: Vec<Option<JobPlan>>,
}

impl ActiveGraph {
    /// Jobs in the active subgraph, in dependency-first order.
    pub fn scheduled_jobs<'a>(
        &'a self,
        workflow: &'a Workflow,
    ) -> impl Iterator<Item = JobId> + 'a {
        workflow
            .topo_order()
            .iter()
            .copied()
            .filter(|id| self.plans[id.0].is_some())
    }

    pub fn plan(&self, id: JobId) -> Option<&JobPlan> {
        self.plans[id.0].as_ref()
    }

    pub fn is_scheduled(&self, id: JobId) -> bool {
        self.plans[id.0].is_some()
    }

    pub fn is_skipped(&self, id: JobId) -> bool {
        matches!(self.plans[id.0], Some(JobPlan::Skipped))
    }

    /// Indices still needing execution; empty for skipped or unscheduled
    /// jobs.
    pub fn live_indices(&self, id: JobId) -> &[usize] {
        match &self.plans[id.0] {
            Some(JobPlan::Live { indices }) => indices,
            _ => &[],
        }
    }

    /// Number of jobs in the active subgraph, skipped ones included.
    pub fn job_count(&self) -> usize {
        self.plans.iter().filter(|p| p.is_some()).count()
    }

    /// Number of tasks that will actually execute.
    pub fn task_count(&self) -> usize {
        self.plans
            .iter()
            .map(|p| match p {
                Some(JobPlan::Live { indices }) => indices.len(),
                _ => 0,
            })
            .sum()
    }
}

/// Compute the active subgraph for the workflow's targets.
///
/// With `prune` set, postconditions are evaluated exactly once per job, in
/// declaration order, stopping at the first that does not hold. A predicate
/// error is surfaced through the sink and leaves the job (or index) live.
pub fn active_subgraph(workflow: &Workflow, prune: bool, sink: &dyn EventSink) -> ActiveGraph {
    let mut plans: Vec<Option<JobPlan>> = vec![None; workflow.len()];

    for id in workflow.reachable_from_targets() {
        let job = workflow.job(id);
        plans[id.0] = Some(plan_for(job, prune, sink));
    }

    let graph = ActiveGraph { plans };
    debug!(
        jobs = graph.job_count(),
        tasks = graph.task_count(),
        prune,
        "active subgraph computed"
    );
    graph
}

fn plan_for(job: &Job, prune: bool, sink: &dyn EventSink) -> JobPlan {
    let all_indices = || (0..job.array_size).collect::<Vec<_>>();

    if !prune || job.postconditions.is_empty() {
        return JobPlan::Live {
            indices: all_indices(),
        };
    }

    if !job.is_array() {
        return if postconditions_hold(job, None, sink) {
            debug!(job = %job.name, "postconditions hold; skipping job");
            JobPlan::Skipped
        } else {
            JobPlan::Live {
                indices: all_indices(),
            }
        };
    }

    let indices: Vec<usize> = (0..job.array_size)
        .filter(|i| !postconditions_hold(job, Some(*i), sink))
        .collect();

    if indices.is_empty() {
        debug!(job = %job.name, "postconditions hold for every index; skipping job");
        JobPlan::Skipped
    } else {
        if indices.len() < job.array_size {
            debug!(
                job = %job.name,
                live = indices.len(),
                of = job.array_size,
                "dropped array indices with satisfied postconditions"
            );
        }
        JobPlan::Live { indices }
    }
}

/// Evaluate the job's postconditions for one task, stopping at the first
/// that does not hold. An error counts as "does not hold" and is surfaced.
fn postconditions_hold(job: &Job, index: Option<usize>, sink: &dyn EventSink) -> bool {
    for (position, predicate) in job.postconditions.iter().enumerate() {
        match predicate.holds(index) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => {
                warn!(
                    task = %job.task_label(index),
                    predicate = position,
                    error = %err,
                    "postcondition errored during pruning"
                );
                sink.emit(&Event::PredicateError {
                    job: job.name.clone(),
                    index,
                    predicate: position,
                    error: format!("{err:#}"),
                });
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::events::MemorySink;
    use crate::workflow::builder::WorkflowBuilder;
    use crate::workflow::job::{EdgeStatus, Executable, JobSpec, Predicate};

    fn noop(name: &str) -> JobSpec {
        JobSpec::new(name, Executable::scalar(|| Ok(())))
    }

    #[test]
    fn reachable_set_is_the_ancestor_closure() {
        let mut b = WorkflowBuilder::new();
        let a = b.add_job(noop("a")).unwrap();
        let c = b.add_job(noop("b")).unwrap();
        let d = b.add_job(noop("c")).unwrap();
        let unrelated = b.add_job(noop("d")).unwrap();
        b.add_edge(a, c, EdgeStatus::Success).unwrap();
        b.add_edge(c, d, EdgeStatus::Success).unwrap();
        let wf = b.freeze(&[d]).unwrap();

        let active = active_subgraph(&wf, false, &MemorySink::new());
        assert!(active.is_scheduled(a));
        assert!(active.is_scheduled(c));
        assert!(active.is_scheduled(d));
        assert!(!active.is_scheduled(unrelated));
        assert_eq!(active.job_count(), 3);
    }

    #[test]
    fn targeting_a_root_schedules_only_that_job() {
        let mut b = WorkflowBuilder::new();
        let a = b.add_job(noop("a")).unwrap();
        let c = b.add_job(noop("b")).unwrap();
        b.add_edge(a, c, EdgeStatus::Success).unwrap();
        let wf = b.freeze(&[a]).unwrap();

        let active = active_subgraph(&wf, false, &MemorySink::new());
        assert_eq!(active.job_count(), 1);
        assert_eq!(active.task_count(), 1);
        assert!(active.is_scheduled(a));
    }

    #[test]
    fn satisfied_scalar_job_is_skipped_and_not_evaluated_twice() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let mut b = WorkflowBuilder::new();
        let a = b.add_job(noop("a")).unwrap();
        b.ensure(
            a,
            Predicate::scalar(move || {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }),
        )
        .unwrap();
        let wf = b.freeze(&[a]).unwrap();

        let active = active_subgraph(&wf, true, &MemorySink::new());
        assert!(active.is_skipped(a));
        assert_eq!(active.task_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsatisfied_indices_stay_live() {
        let mut b = WorkflowBuilder::new();
        let a = b
            .add_job(JobSpec::new("a", Executable::per_task(|_| Ok(()))).array(10))
            .unwrap();
        b.ensure(a, Predicate::per_task(|i| Ok(i != 3 && i != 7)))
            .unwrap();
        let wf = b.freeze(&[a]).unwrap();

        let active = active_subgraph(&wf, true, &MemorySink::new());
        assert_eq!(active.live_indices(a), &[3, 7]);
    }

    #[test]
    fn predicate_error_leaves_the_job_live_and_is_surfaced() {
        let mut b = WorkflowBuilder::new();
        let a = b.add_job(noop("a")).unwrap();
        b.ensure(a, Predicate::scalar(|| Err(anyhow::anyhow!("boom"))))
            .unwrap();
        let wf = b.freeze(&[a]).unwrap();

        let sink = MemorySink::new();
        let active = active_subgraph(&wf, true, &sink);
        assert!(!active.is_skipped(a));
        assert_eq!(active.task_count(), 1);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, Event::PredicateError { .. })));
    }

    #[test]
    fn pruning_is_idempotent() {
        let mut b = WorkflowBuilder::new();
        let a = b
            .add_job(JobSpec::new("a", Executable::per_task(|_| Ok(()))).array(5))
            .unwrap();
        b.ensure(a, Predicate::per_task(|i| Ok(i % 2 == 0))).unwrap();
        let wf = b.freeze(&[a]).unwrap();

        let first = active_subgraph(&wf, true, &MemorySink::new());
        let second = active_subgraph(&wf, true, &MemorySink::new());
        assert_eq!(first, second);
    }

    #[test]
    fn pruning_disabled_keeps_everything_live() {
        let mut b = WorkflowBuilder::new();
        let a = b.add_job(noop("a")).unwrap();
        b.ensure(a, Predicate::scalar(|| Ok(true))).unwrap();
        let wf = b.freeze(&[a]).unwrap();

        let active = active_subgraph(&wf, false, &MemorySink::new());
        assert!(!active.is_skipped(a));
        assert_eq!(active.task_count(), 1);
    }
}
