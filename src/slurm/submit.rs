// src/slurm/submit.rs

//! Submission of the active subgraph to Slurm.
//!
//! Jobs are submitted in topological order because every dependency
//! directive embeds the external ids of its predecessors. The translator is
//! serial; all concurrency is the batch scheduler's business. A failed
//! submission rolls back everything submitted so far with `scancel`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use tracing::{debug, info, warn};

use crate::errors::{Result, WorkflowError};
use crate::history::RunDir;
use crate::slurm::script::{dependency_spec, render_script};
use crate::workflow::job::{Executable, Job, JobId, Predicate};
use crate::workflow::{ActiveGraph, Workflow};

/// External commands used for submission. Tests point these at stubs.
#[derive(Debug, Clone)]
pub struct SlurmBackend {
    pub sbatch: PathBuf,
    pub scancel: PathBuf,
}

impl Default for SlurmBackend {
    fn default() -> Self {
        Self {
            sbatch: PathBuf::from("sbatch"),
            scancel: PathBuf::from("scancel"),
        }
    }
}

impl SlurmBackend {
    /// Submit every scheduled job and return the job-name to external-id
    /// mapping. On failure, previously submitted jobs are cancelled before
    /// the error is surfaced.
    pub async fn submit(
        &self,
        workflow: &Workflow,
        active: &ActiveGraph,
        rundir: &RunDir,
    ) -> Result<BTreeMap<String, String>> {
        let mut ids: HashMap<JobId, String> = HashMap::new();
        let mut by_name: BTreeMap<String, String> = BTreeMap::new();

        for id in active.scheduled_jobs(workflow) {
            let job = workflow.job(id);
            let pruned = active.is_skipped(id);

            match self.submit_job(workflow, active, rundir, id, pruned, &ids).await {
                Ok(external) => {
                    debug!(job = %job.name, external_id = %external, "job submitted");
                    ids.insert(id, external.clone());
                    by_name.insert(job.name.clone(), external);
                }
                Err(err) => {
                    self.rollback(&by_name).await;
                    return Err(err);
                }
            }
        }

        rundir.write_submissions(&by_name)?;
        info!(jobs = by_name.len(), run = %rundir.name, "all jobs submitted");
        Ok(by_name)
    }

    async fn submit_job(
        &self,
        workflow: &Workflow,
        active: &ActiveGraph,
        rundir: &RunDir,
        id: JobId,
        pruned: bool,
        ids: &HashMap<JobId, String>,
    ) -> Result<String> {
        let job = workflow.job(id);

        // Body delivery: the command text goes to a file the script invokes
        // with the array index as $1. Pruned and explicitly skipped jobs
        // ship a no-op; the latter still carry their preconditions, so those
        // must be shippable.
        let body_file = rundir.body_path(&job.name);
        if pruned || job.skipped {
            fs::write(&body_file, "exit 0\n")?;
            if !pruned {
                ensure_command_predicates(job, job.preconditions.iter())?;
            }
        } else {
            ensure_shippable(job)?;
            let Executable::Command(cmd) = &job.body else {
                unreachable!("ensure_shippable admits only command bodies");
            };
            fs::write(&body_file, format!("{cmd}\n"))?;
        }

        let log_pattern = if job.is_array() {
            rundir.path().join(format!("{}_%a.log", job.name))
        } else {
            rundir.path().join(format!("{}.log", job.name))
        };

        let dependency = dependency_spec(workflow, id, ids);
        let script = render_script(
            job,
            active.live_indices(id),
            dependency.as_deref(),
            &body_file,
            &log_pattern.display().to_string(),
            pruned,
        );

        let script_file = rundir.script_path(&job.name);
        fs::write(&script_file, script)?;

        let output = tokio::process::Command::new(&self.sbatch)
            .arg("--parsable")
            .arg(&script_file)
            .output()
            .await
            .with_context(|| format!("running {}", self.sbatch.display()))
            .map_err(|source| WorkflowError::SubmissionFailed {
                job: job.name.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkflowError::SubmissionFailed {
                job: job.name.clone(),
                source: anyhow!(
                    "sbatch exited with status {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }

        parse_job_id(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            WorkflowError::SubmissionFailed {
                job: job.name.clone(),
                source: anyhow!("sbatch produced no job id"),
            }
        })
    }

    /// Cancel everything submitted in this run. Cancellation failures are
    /// logged and swallowed so the original error stays visible.
    async fn rollback(&self, submitted: &BTreeMap<String, String>) {
        if submitted.is_empty() {
            return;
        }
        warn!(
            jobs = submitted.len(),
            "submission failed; cancelling already-submitted jobs"
        );

        for (job, external) in submitted {
            let result = tokio::process::Command::new(&self.scancel)
                .arg(external)
                .status()
                .await;
            match result {
                Ok(status) if status.success() => {
                    debug!(job = %job, external_id = %external, "cancelled");
                }
                Ok(status) => {
                    warn!(job = %job, external_id = %external, code = status.code(),
                          "scancel exited non-zero");
                }
                Err(err) => {
                    warn!(job = %job, external_id = %external, error = %err,
                          "failed to run scancel");
                }
            }
        }
    }
}

/// With `--parsable`, sbatch prints `<id>` or `<id>;<cluster>`.
fn parse_job_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().next()?.trim();
    let id = line.split(';').next()?.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Closure bodies and predicates cannot be shipped to the cluster.
fn ensure_shippable(job: &Job) -> Result<()> {
    if matches!(job.body, Executable::Func(_)) {
        return Err(WorkflowError::CallableSerializationFailed {
            job: job.name.clone(),
            what: "body",
        });
    }
    ensure_command_predicates(job, job.preconditions.iter().chain(&job.postconditions))
}

fn ensure_command_predicates<'a>(
    job: &Job,
    predicates: impl Iterator<Item = &'a Predicate>,
) -> Result<()> {
    for predicate in predicates {
        if !matches!(predicate, Predicate::Command(_)) {
            return Err(WorkflowError::CallableSerializationFailed {
                job: job.name.clone(),
                what: "predicate",
            });
        }
    }
    Ok(())
}
