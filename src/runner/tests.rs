//! Unit tests for runner fragments.

use std::sync::Arc;

use super::*;
use crate::mount::{SharedMount, Simple};
use crate::test_support::RecordingMount;
use rstest::{fixture, rstest};

fn options(text: &str) -> Mapping {
    serde_yaml::from_str(text).expect("yaml fixture")
}

#[fixture]
fn job() -> Job {
    Job::new(["python", "-u", "train.py"])
        .arg(3)
        .kwarg("lr", 0.1)
}

fn payload(job: &Job) -> String {
    job.encode().expect("job encodes")
}

#[rstest]
fn job_payload_is_base64_json(job: Job) {
    let decoded = STANDARD.decode(payload(&job)).expect("valid base64");
    let value: serde_json::Value = serde_json::from_slice(&decoded).expect("valid json");

    assert_eq!(value["command"][2], "train.py");
    assert_eq!(value["args"][0], 3);
    assert_eq!(value["kwargs"]["lr"], 0.1);
}

#[rstest]
fn merge_options_keeps_untouched_keys() {
    let mut spec = RunnerSpec::new(RunnerKind::Docker, options("image: x\ngpu: false\n"));

    spec.merge_options(&options("gpu: true\n"));

    assert_eq!(spec.options, options("image: x\ngpu: true\n"));
}

#[rstest]
fn docker_runs_job_in_container_with_volumes(job: Job) {
    let spec = RunnerSpec::new(RunnerKind::Docker, Mapping::new());
    let mounts: Vec<SharedMount> = vec![Arc::new(Simple::new("/srv/code", true))];
    let opts = options(
        "image: python:3.12\nwork_dir: /srv/code\npypath: /srv/code\n\
         name: trainer\nipc: host\nmemory: 4g\nsetup: docker pull python:3.12\n",
    );

    let fragments = spec.fragments(&opts, &job, &mounts).expect("renders");

    assert_eq!(fragments.setup, "docker pull python:3.12");
    assert!(fragments.run.contains("docker kill trainer"), "{}", fragments.run);
    let expected = format!(
        "docker run -i --ipc=host --memory=4g -v '/srv/code':'/srv/code' --name 'trainer' \
         python:3.12 /bin/bash -c 'echo \"Running in docker\";\
         export PYTHONPATH=$PYTHONPATH:/srv/code;cd /srv/code;\
         SORTIE_PARAMS={} python -u train.py'",
        payload(&job)
    );
    assert_eq!(fragments.run.lines().last(), Some(expected.as_str()));
    assert!(!fragments.run.contains("nvidia-smi"));
}

#[rstest]
fn docker_binds_every_mount_in_declaration_order(job: Job) {
    let spec = RunnerSpec::new(RunnerKind::Docker, Mapping::new());
    let mounts: Vec<SharedMount> = vec![
        Arc::new(RecordingMount::new("").with_paths("/srv/data", "/data", false)),
        Arc::new(RecordingMount::new("").with_paths("/srv/code", "/code", true)),
    ];

    let fragments = spec
        .fragments(&options("image: x\n"), &job, &mounts)
        .expect("renders");

    assert!(
        fragments
            .run
            .contains("-v '/srv/data':'/data' -v '/srv/code':'/code'"),
        "{}",
        fragments.run
    );
}

#[rstest]
fn docker_without_name_skips_removal_and_tests_gpu(job: Job) {
    let spec = RunnerSpec::new(RunnerKind::Docker, Mapping::new());
    let opts = options("image: cuda\ngpus: all\n");

    let fragments = spec.fragments(&opts, &job, &[]).expect("renders");

    assert!(!fragments.run.contains("docker kill"));
    assert!(fragments.run.contains("docker run --rm --gpus=all cuda nvidia-smi"));
}

#[rstest]
fn docker_requires_an_image(job: Job) {
    let spec = RunnerSpec::new(RunnerKind::Docker, Mapping::new());

    let err = spec
        .fragments(&options("work_dir: /x\n"), &job, &[])
        .expect_err("image is required");

    assert!(matches!(err, RunnerError::Options { kind: "Docker", .. }), "{err}");
}

#[rstest]
fn simple_runner_uses_entry_script_override(job: Job) {
    let spec = RunnerSpec::new(RunnerKind::Simple, Mapping::new());
    let opts = options(
        "work_dir: /work\nentry_script: python -m entry\nenvs: LANG=C\nstartup: source venv/bin/activate\n",
    );

    let fragments = spec.fragments(&opts, &job, &[]).expect("renders");

    assert_eq!(
        fragments.run,
        format!(
            "LANG=C /bin/bash -c 'source venv/bin/activate;export PYTHONPATH=$PYTHONPATH:;\
             cd /work;SORTIE_PARAMS={} python -m entry'",
            payload(&job)
        )
    );
    assert!(fragments.setup.is_empty());
    assert!(fragments.post.is_empty());
}

#[rstest]
fn detached_simple_runner_pipes_through_fifo(job: Job) {
    let spec = RunnerSpec::new(RunnerKind::Simple, Mapping::new());

    let fragments = spec
        .fragments(&options("detach: true\n"), &job, &[])
        .expect("renders");

    assert!(fragments.setup.starts_with("export pipe=`mktemp -u`\nmkfifo $pipe"));
    assert!(fragments.run.starts_with("screen -md /bin/bash -c '"));
    assert!(fragments.run.ends_with(" |& tee -p $pipe'"));
    assert_eq!(fragments.post, "cat $pipe\nrm -f $pipe");
}

#[rstest]
fn slurm_interactive_prefixes_params_before_srun(job: Job) {
    let spec = RunnerSpec::new(RunnerKind::Slurm, Mapping::new());
    let opts = options("partition: dev\nn_gpu: 1\ntime_limit: '0:30:00'\nmem: 8G\n");

    let fragments = spec.fragments(&opts, &job, &[]).expect("renders");

    assert_eq!(
        fragments.run,
        format!(
            "SORTIE_PARAMS={} srun --partition=dev --time=0:30:00 --cpus-per-task=4 \
             --gres=gpu:1 --mem=\"8G\" python -u train.py",
            payload(&job)
        )
    );
}

#[rstest]
fn slurm_batch_chains_singleton_submissions(job: Job) {
    let spec = RunnerSpec::new(RunnerKind::Slurm, Mapping::new());
    let opts = options("interactive: false\nn_seq_jobs: 3\nstartup: module load cuda\n");

    let fragments = spec.fragments(&opts, &job, &[]).expect("renders");

    assert_eq!(fragments.run.matches("sbatch ").count(), 3);
    assert!(fragments.run.contains("-d singleton <<<'#!/bin/bash\n"));
    assert!(fragments.run.contains("module load cuda;"));
}

#[rstest]
fn slurm_rejects_sequences_in_interactive_mode(job: Job) {
    let spec = RunnerSpec::new(RunnerKind::Slurm, Mapping::new());

    let err = spec
        .fragments(&options("n_seq_jobs: 2\n"), &job, &[])
        .expect_err("sequences need sbatch");

    assert!(matches!(err, RunnerError::Options { kind: "Slurm", .. }), "{err}");
}

#[rstest]
#[case("", "")]
#[case("  ls  ", "ls;")]
#[case("ls;", "ls;")]
fn inline_terminates_scripts(#[case] script: &str, #[case] expected: &str) {
    assert_eq!(inline(script), expected);
}
