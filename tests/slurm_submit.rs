use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dagrun::errors::WorkflowError;
use dagrun::events::MemorySink;
use dagrun::slurm::SlurmBackend;
use dagrun::{
    schedule, Backend, EdgeStatus, Executable, JobSpec, Predicate, ScheduleOptions,
    WorkflowBuilder,
};

/// Write an executable stub that hands out sequential job ids and records
/// the scripts it was given. `fail_from` makes submissions fail once the
/// counter reaches that value.
fn write_sbatch_stub(dir: &Path, fail_from: Option<u32>) -> PathBuf {
    let path = dir.join("sbatch");
    let guard = match fail_from {
        Some(n) => format!("if [ \"$n\" -ge {n} ]; then exit 1; fi\n"),
        None => String::new(),
    };
    let script = format!(
        "#!/bin/sh\n\
         dir=\"$(dirname \"$0\")\"\n\
         n=$(cat \"$dir/count\" 2>/dev/null || echo 0)\n\
         n=$((n+1))\n\
         printf '%s' \"$n\" > \"$dir/count\"\n\
         {guard}\
         echo \"$2\" >> \"$dir/scripts.log\"\n\
         echo \"$n\"\n"
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn write_scancel_stub(dir: &Path) -> PathBuf {
    let path = dir.join("scancel");
    let script = "#!/bin/sh\n\
                  dir=\"$(dirname \"$0\")\"\n\
                  echo \"$1\" >> \"$dir/scancel.log\"\n";
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn options(workdir: &Path, stubs: &Path, fail_from: Option<u32>) -> ScheduleOptions {
    ScheduleOptions {
        backend: Backend::Slurm,
        name: Some("testrun".into()),
        workdir: workdir.to_path_buf(),
        handle_interrupts: false,
        slurm: SlurmBackend {
            sbatch: write_sbatch_stub(stubs, fail_from),
            scancel: write_scancel_stub(stubs),
        },
        ..ScheduleOptions::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn diamond_submits_in_dependency_order_with_embedded_ids() {
    let workdir = tempfile::tempdir().unwrap();
    let stubs = tempfile::tempdir().unwrap();

    let mut b = WorkflowBuilder::new();
    let a = b
        .add_job(JobSpec::new("a", Executable::command("echo a")))
        .unwrap();
    let left = b
        .add_job(JobSpec::new("left", Executable::command("echo left")))
        .unwrap();
    let right = b
        .add_job(JobSpec::new("right", Executable::command("echo right")))
        .unwrap();
    let d = b
        .add_job(JobSpec::new("d", Executable::command("echo d")))
        .unwrap();
    b.add_edge(a, left, EdgeStatus::Success).unwrap();
    b.add_edge(a, right, EdgeStatus::Success).unwrap();
    b.add_edge(left, d, EdgeStatus::Success).unwrap();
    b.add_edge(right, d, EdgeStatus::Any).unwrap();

    let report = schedule(
        b.freeze(&[d]).unwrap(),
        options(workdir.path(), stubs.path(), None),
        Arc::new(MemorySink::new()),
    )
    .await
    .unwrap();

    let ids = report.external_ids.unwrap();
    assert_eq!(ids.len(), 4);
    // Root was submitted first.
    assert_eq!(ids["a"], "1");

    let rundir = workdir.path().join("testrun");
    let submissions = std::fs::read_to_string(rundir.join("submissions.json")).unwrap();
    let parsed: std::collections::BTreeMap<String, String> =
        serde_json::from_str(&submissions).unwrap();
    assert_eq!(parsed, ids);

    // The sink's dependency directive embeds the predecessors' external ids.
    let d_script = std::fs::read_to_string(rundir.join("d.sbatch")).unwrap();
    let expected = format!("#SBATCH --dependency=afterok:{},afterany:{}", ids["left"], ids["right"]);
    assert!(d_script.contains(&expected), "missing directive in:\n{d_script}");

    let a_script = std::fs::read_to_string(rundir.join("a.sbatch")).unwrap();
    assert!(!a_script.contains("--dependency"));
    assert!(rundir.join("a.body.sh").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_submission_rolls_back_with_scancel() {
    let workdir = tempfile::tempdir().unwrap();
    let stubs = tempfile::tempdir().unwrap();

    let mut b = WorkflowBuilder::new();
    let a = b
        .add_job(JobSpec::new("a", Executable::command("echo a")))
        .unwrap();
    let c = b
        .add_job(JobSpec::new("b", Executable::command("echo b")))
        .unwrap();
    b.add_edge(a, c, EdgeStatus::Success).unwrap();

    let err = schedule(
        b.freeze(&[c]).unwrap(),
        options(workdir.path(), stubs.path(), Some(2)),
        Arc::new(MemorySink::new()),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, WorkflowError::SubmissionFailed { ref job, .. } if job == "b"));
    let cancelled = std::fs::read_to_string(stubs.path().join("scancel.log")).unwrap();
    assert_eq!(cancelled.trim(), "1");
}

#[tokio::test(flavor = "multi_thread")]
async fn closure_bodies_cannot_be_shipped() {
    let workdir = tempfile::tempdir().unwrap();
    let stubs = tempfile::tempdir().unwrap();

    let mut b = WorkflowBuilder::new();
    b.add_job(JobSpec::new("a", Executable::scalar(|| Ok(()))))
        .unwrap();
    let a = b.job_id("a").unwrap();

    let err = schedule(
        b.freeze(&[a]).unwrap(),
        options(workdir.path(), stubs.path(), None),
        Arc::new(MemorySink::new()),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        WorkflowError::CallableSerializationFailed { .. }
    ));
    // Nothing was handed to sbatch.
    assert!(!stubs.path().join("scripts.log").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn pruned_jobs_submit_a_no_op_body() {
    let workdir = tempfile::tempdir().unwrap();
    let stubs = tempfile::tempdir().unwrap();

    let mut b = WorkflowBuilder::new();
    let a = b
        .add_job(JobSpec::new("a", Executable::command("echo a")))
        .unwrap();
    b.ensure(a, Predicate::command("true")).unwrap();
    let c = b
        .add_job(JobSpec::new("b", Executable::command("echo b")))
        .unwrap();
    b.add_edge(a, c, EdgeStatus::Success).unwrap();

    let opts = ScheduleOptions {
        prune: true,
        ..options(workdir.path(), stubs.path(), None)
    };
    let report = schedule(
        b.freeze(&[c]).unwrap(),
        opts,
        Arc::new(MemorySink::new()),
    )
    .await
    .unwrap();

    // The satisfied job is still submitted so its dependent's dependency
    // term stays well-formed, but its body is a no-op.
    let ids = report.external_ids.unwrap();
    assert_eq!(ids.len(), 2);
    let rundir = workdir.path().join("testrun");
    let body = std::fs::read_to_string(rundir.join("a.body.sh")).unwrap();
    assert_eq!(body.trim(), "exit 0");

    // No condition lines either: the submission must succeed unconditionally
    // to mirror the synthetic success the local engine would contribute.
    let a_script = std::fs::read_to_string(rundir.join("a.sbatch")).unwrap();
    assert!(!a_script.contains("sh -c"));

    let b_script = std::fs::read_to_string(rundir.join("b.sbatch")).unwrap();
    assert!(b_script.contains(&format!("afterok:{}", ids["a"])));
}

#[tokio::test(flavor = "multi_thread")]
async fn array_submission_renders_range_and_throttle() {
    let workdir = tempfile::tempdir().unwrap();
    let stubs = tempfile::tempdir().unwrap();

    let mut b = WorkflowBuilder::new();
    let a = b
        .add_job(
            JobSpec::new("fan", Executable::command("process-chunk"))
                .array(50)
                .array_throttle(5),
        )
        .unwrap();

    schedule(
        b.freeze(&[a]).unwrap(),
        options(workdir.path(), stubs.path(), None),
        Arc::new(MemorySink::new()),
    )
    .await
    .unwrap();

    let script =
        std::fs::read_to_string(workdir.path().join("testrun").join("fan.sbatch")).unwrap();
    assert!(script.contains("#SBATCH --array=0-49%5"));
    assert!(script.contains("\"$SLURM_ARRAY_TASK_ID\""));
}
