// src/slurm/script.rs

//! Submission script generation.
//!
//! One script per job. The dependency directive reproduces the engine's edge
//! and join semantics with Slurm's native vocabulary: `afterok`,
//! `afternotok` and `afterany` terms joined by `,` (conjunction) or `?`
//! (disjunction).

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

use crate::workflow::job::{EdgeStatus, Job, JobId, Join};
use crate::workflow::Workflow;

fn status_keyword(status: EdgeStatus) -> &'static str {
    match status {
        EdgeStatus::Success => "afterok",
        EdgeStatus::Failure => "afternotok",
        EdgeStatus::Any => "afterany",
    }
}

/// Build the `--dependency` value for a job, or `None` when it has no
/// dependencies. `ids` must contain the external id of every dependency.
pub fn dependency_spec(
    workflow: &Workflow,
    id: JobId,
    ids: &HashMap<JobId, String>,
) -> Option<String> {
    let deps = workflow.dependencies_of(id);
    if deps.is_empty() {
        return None;
    }

    let job = workflow.job(id);
    let separator = match job.join {
        Join::All => ",",
        Join::Any => "?",
    };

    if job.join == Join::Any
        && deps.len() > 1
        && deps.iter().any(|(_, s)| *s == EdgeStatus::Failure)
    {
        // Some deployments reject OR-joined expressions that mix afternotok
        // with other terms. Emitted as-is rather than silently altered.
        warn!(
            job = %job.name,
            "any-join mixes failure and non-failure dependency terms; \
             the scheduler may reject this expression"
        );
    }

    let terms: Vec<String> = deps
        .iter()
        .map(|(dep, status)| format!("{}:{}", status_keyword(*status), ids[dep]))
        .collect();

    Some(terms.join(separator))
}

/// Format array indices as Slurm interval syntax, e.g. `0-41,43-99`.
///
/// Pruning can leave holes, so a plain `0-(N-1)` range is not always enough.
pub fn format_indices(indices: &[usize]) -> String {
    let mut sorted = indices.to_vec();
    sorted.sort_unstable();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;

    for i in iter {
        if i == end + 1 {
            end = i;
        } else {
            parts.push(interval(start, end));
            start = i;
            end = i;
        }
    }
    parts.push(interval(start, end));
    parts.join(",")
}

fn interval(start: usize, end: usize) -> String {
    if start == end {
        format!("{start}")
    } else {
        format!("{start}-{end}")
    }
}

/// Quote a string for safe embedding in single quotes in a shell script.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// A predicate line: run the command with the array index (when present) as
/// `$1`, matching how the local backend invokes command predicates.
fn predicate_line(cmd: &str, array: bool) -> String {
    if array {
        format!("sh -c {} dagrun \"$SLURM_ARRAY_TASK_ID\"", shell_quote(cmd))
    } else {
        format!("sh -c {} dagrun", shell_quote(cmd))
    }
}

/// Render the full submission script for one job.
///
/// `indices` is the set of live array indices (ignored for scalar jobs),
/// `dependency` the value produced by [`dependency_spec`], `body_file` the
/// path the body was written to, and `log_pattern` the `--output` value.
/// `pruned` marks a job whose postconditions already held at pruning time:
/// it must succeed unconditionally, like the synthetic success the local
/// engine contributes, so no conditions are emitted and no array is fanned
/// out.
pub fn render_script(
    job: &Job,
    indices: &[usize],
    dependency: Option<&str>,
    body_file: &Path,
    log_pattern: &str,
    pruned: bool,
) -> String {
    let array = job.is_array() && !indices.is_empty();

    let mut lines = vec![
        "#!/usr/bin/env bash".to_string(),
        "#".to_string(),
        format!("#SBATCH --job-name={}", job.name),
    ];

    if array {
        let mut directive = format!("#SBATCH --array={}", format_indices(indices));
        if let Some(throttle) = job.array_throttle {
            directive.push_str(&format!("%{throttle}"));
        }
        lines.push(directive);
    }

    lines.push(format!("#SBATCH --output={log_pattern}"));
    lines.push("#".to_string());

    for (key, value) in job.resources.iter() {
        let key = match key {
            "cpus" => "cpus-per-task",
            "gpus" => "gpus-per-task",
            "ram" => "mem",
            "timelimit" => "time",
            other => other,
        };
        match value {
            Some(value) => lines.push(format!("#SBATCH --{key}={value}")),
            None => lines.push(format!("#SBATCH --{key}")),
        }
    }

    if let Some(dependency) = dependency {
        lines.push("#".to_string());
        lines.push(format!("#SBATCH --dependency={dependency}"));
    }

    lines.extend([
        "#".to_string(),
        "#SBATCH --export=ALL".to_string(),
        "#SBATCH --parsable".to_string(),
        "#SBATCH --requeue".to_string(),
        String::new(),
        "set -o errexit".to_string(),
        String::new(),
    ]);

    // Preconditions run before the body; with errexit a false predicate
    // makes the whole submission exit non-zero before the body starts.
    // They run for explicitly skipped jobs too, just like the local engine
    // evaluates them before synthesising success.
    if !pruned {
        for predicate in &job.preconditions {
            if let crate::workflow::job::Predicate::Command(cmd) = predicate {
                lines.push(predicate_line(cmd, array));
            }
        }
    }

    if array {
        lines.push(format!(
            "sh {} \"$SLURM_ARRAY_TASK_ID\"",
            body_file.display()
        ));
    } else {
        lines.push(format!("sh {}", body_file.display()));
    }

    // Skipped jobs never run their body, so there is no result for
    // postconditions to check.
    if !pruned && !job.skipped {
        for predicate in &job.postconditions {
            if let crate::workflow::job::Predicate::Command(cmd) = predicate {
                lines.push(predicate_line(cmd, array));
            }
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::workflow::builder::WorkflowBuilder;
    use crate::workflow::job::{Executable, JobSpec, Predicate, Resources};

    fn cmd_job(name: &str) -> JobSpec {
        JobSpec::new(name, Executable::command("echo hi"))
    }

    fn diamond_into(join: Join) -> (Workflow, JobId, HashMap<JobId, String>) {
        let mut b = WorkflowBuilder::new();
        let a = b.add_job(cmd_job("a")).unwrap();
        let c = b.add_job(cmd_job("b")).unwrap();
        let d = b.add_job(cmd_job("c")).unwrap();
        let e = b.add_job(cmd_job("e")).unwrap();
        b.add_edge(a, e, EdgeStatus::Any).unwrap();
        b.add_edge(c, e, EdgeStatus::Success).unwrap();
        b.add_edge(d, e, EdgeStatus::Success).unwrap();
        b.waitfor(e, join).unwrap();
        let wf = b.freeze(&[e]).unwrap();

        let ids: HashMap<JobId, String> = [
            (a, "101".to_string()),
            (c, "102".to_string()),
            (d, "103".to_string()),
        ]
        .into_iter()
        .collect();
        (wf, e, ids)
    }

    #[test]
    fn all_join_uses_comma_separated_terms() {
        let (wf, e, ids) = diamond_into(Join::All);
        assert_eq!(
            dependency_spec(&wf, e, &ids).unwrap(),
            "afterany:101,afterok:102,afterok:103"
        );
    }

    #[test]
    fn any_join_uses_question_mark_separated_terms() {
        let (wf, e, ids) = diamond_into(Join::Any);
        assert_eq!(
            dependency_spec(&wf, e, &ids).unwrap(),
            "afterany:101?afterok:102?afterok:103"
        );
    }

    #[test]
    fn failure_edges_map_to_afternotok() {
        let mut b = WorkflowBuilder::new();
        let a = b.add_job(cmd_job("a")).unwrap();
        let c = b.add_job(cmd_job("b")).unwrap();
        b.add_edge(a, c, EdgeStatus::Failure).unwrap();
        let wf = b.freeze(&[c]).unwrap();

        let ids: HashMap<JobId, String> = [(a, "7".to_string())].into_iter().collect();
        assert_eq!(dependency_spec(&wf, c, &ids).unwrap(), "afternotok:7");
    }

    #[test]
    fn roots_have_no_dependency_spec() {
        let mut b = WorkflowBuilder::new();
        let a = b.add_job(cmd_job("a")).unwrap();
        let wf = b.freeze(&[a]).unwrap();
        assert_eq!(dependency_spec(&wf, a, &HashMap::new()), None);
    }

    #[test]
    fn indices_collapse_into_intervals() {
        assert_eq!(format_indices(&[0, 1, 2, 3]), "0-3");
        assert_eq!(format_indices(&[42]), "42");
        let sparse: Vec<usize> = (0..100).filter(|i| *i != 42).collect();
        assert_eq!(format_indices(&sparse), "0-41,43-99");
    }

    #[test]
    fn script_carries_resources_array_and_conditions() {
        let mut b = WorkflowBuilder::new();
        let spec = JobSpec::new("train", Executable::command("run-train"))
            .array(100)
            .array_throttle(10)
            .resources(
                Resources::new()
                    .with("cpus", "4")
                    .with("ram", "16GB")
                    .with("time", "01:00:00")
                    .with("partition", "gpu"),
            );
        let id = b.add_job(spec).unwrap();
        b.require(id, Predicate::command("test -d data")).unwrap();
        b.ensure(id, Predicate::command("test -f out/$1")).unwrap();
        let wf = b.freeze(&[id]).unwrap();

        let indices: Vec<usize> = (0..100).collect();
        let script = render_script(
            wf.job(id),
            &indices,
            None,
            &PathBuf::from("/tmp/run/train.body.sh"),
            "/tmp/run/train_%a.log",
            false,
        );

        assert!(script.starts_with("#!/usr/bin/env bash"));
        assert!(script.contains("#SBATCH --job-name=train"));
        assert!(script.contains("#SBATCH --array=0-99%10"));
        assert!(script.contains("#SBATCH --cpus-per-task=4"));
        assert!(script.contains("#SBATCH --mem=16GB"));
        assert!(script.contains("#SBATCH --time=01:00:00"));
        assert!(script.contains("#SBATCH --partition=gpu"));
        assert!(script.contains("set -o errexit"));
        assert!(script.contains("sh -c 'test -d data' dagrun \"$SLURM_ARRAY_TASK_ID\""));
        assert!(script.contains("sh /tmp/run/train.body.sh \"$SLURM_ARRAY_TASK_ID\""));
        assert!(script.contains("sh -c 'test -f out/$1' dagrun \"$SLURM_ARRAY_TASK_ID\""));
    }

    #[test]
    fn scalar_script_invokes_body_without_an_index() {
        let mut b = WorkflowBuilder::new();
        let id = b.add_job(cmd_job("solo")).unwrap();
        let wf = b.freeze(&[id]).unwrap();

        let script = render_script(
            wf.job(id),
            &[0],
            Some("afterok:9"),
            &PathBuf::from("/tmp/run/solo.body.sh"),
            "/tmp/run/solo.log",
            false,
        );
        assert!(script.contains("#SBATCH --dependency=afterok:9"));
        assert!(!script.contains("--array"));
        assert!(script.contains("sh /tmp/run/solo.body.sh\n"));
    }

    #[test]
    fn pruned_job_script_is_a_bare_no_op() {
        let mut b = WorkflowBuilder::new();
        let spec = JobSpec::new("done", Executable::command("run-it")).array(20);
        let id = b.add_job(spec).unwrap();
        b.require(id, Predicate::command("test -d data")).unwrap();
        b.ensure(id, Predicate::command("test -f out")).unwrap();
        let wf = b.freeze(&[id]).unwrap();

        let script = render_script(
            wf.job(id),
            &[],
            None,
            &PathBuf::from("/tmp/run/done.body.sh"),
            "/tmp/run/done.log",
            true,
        );

        // Must succeed unconditionally so downstream afterok terms hold.
        assert!(!script.contains("sh -c"));
        assert!(!script.contains("--array"));
        assert!(script.contains("sh /tmp/run/done.body.sh\n"));
    }

    #[test]
    fn skipped_job_script_keeps_preconditions_but_not_postconditions() {
        let mut b = WorkflowBuilder::new();
        let spec = JobSpec::new("gate", Executable::command("real-work")).skipped(true);
        let id = b.add_job(spec).unwrap();
        b.require(id, Predicate::command("test -d data")).unwrap();
        b.ensure(id, Predicate::command("test -f out")).unwrap();
        let wf = b.freeze(&[id]).unwrap();

        let script = render_script(
            wf.job(id),
            &[0],
            None,
            &PathBuf::from("/tmp/run/gate.body.sh"),
            "/tmp/run/gate.log",
            false,
        );

        assert!(script.contains("sh -c 'test -d data' dagrun"));
        assert!(!script.contains("test -f out"));
        assert!(script.contains("sh /tmp/run/gate.body.sh\n"));
    }
}
