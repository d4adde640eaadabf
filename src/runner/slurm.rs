//! SLURM runner submitting through `srun` or a chain of `sbatch` jobs.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_yaml::Value;

use super::{EntryPoint, RunnerError, RunnerFragments, extra_flags, inline, lines, with_envs, words};

fn default_shell() -> String {
    String::from("/bin/bash")
}

const fn default_interactive() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub(super) struct SlurmOptions {
    #[serde(default)]
    pypath: String,
    #[serde(default)]
    setup: String,
    #[serde(default)]
    startup: Option<String>,
    #[serde(default)]
    work_dir: Option<String>,
    #[serde(default)]
    envs: Option<String>,
    #[serde(default)]
    n_gpu: Option<u32>,
    #[serde(default = "default_shell")]
    shell: String,
    #[serde(default)]
    entry_script: Option<String>,
    #[serde(default)]
    partition: Option<String>,
    /// `srun` when true, otherwise `sbatch`.
    #[serde(default = "default_interactive")]
    interactive: bool,
    #[serde(default)]
    n_seq_jobs: Option<u32>,
    #[serde(default)]
    time_limit: Option<String>,
    #[serde(default)]
    n_cpu: Option<u32>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    label: bool,
    /// Bare switches rendered as `--<arg>`.
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    post_script: String,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

pub(super) fn fragments(
    options: SlurmOptions,
    entry: &EntryPoint,
) -> Result<RunnerFragments, RunnerError> {
    if options.interactive && options.n_seq_jobs.is_some_and(|count| count > 1) {
        return Err(RunnerError::Options {
            kind: "Slurm",
            message: String::from("interactive mode only supports non-sequential jobs"),
        });
    }

    let mut flags = Vec::new();
    if let Some(ref partition) = options.partition {
        flags.push(format!("--partition={partition}"));
    }
    if let Some(ref limit) = options.time_limit {
        flags.push(format!("--time={limit}"));
    }
    flags.push(format!("--cpus-per-task={}", options.n_cpu.unwrap_or(4)));
    if let Some(gpus) = options.n_gpu.filter(|count| *count > 0) {
        flags.push(format!("--gres=gpu:{gpus}"));
    }
    if let Some(ref name) = options.name {
        flags.push(format!("--job-name=\"{name}\""));
    }
    if options.label {
        flags.push(String::from("--label"));
    }
    if let Some(ref comment) = options.comment {
        flags.push(format!("--comment=\"{comment}\""));
    }
    flags.extend(options.args.iter().map(|arg| format!("--{arg}")));
    let extra = extra_flags(&options.extra, true);
    if !extra.is_empty() {
        flags.push(extra);
    }
    let flag_text = flags.join(" ");

    let invocation = entry.invocation(options.entry_script.as_deref());
    let worker_cmd = options.startup.as_deref().map(|startup| {
        let mut cmd = String::from(
            "printf \"\\e[1;34m%-6s\\e[m\\n\" \"Running inside worker `hostname`\";",
        );
        cmd.push_str(&inline(startup));
        if let Some(ref dir) = options.work_dir {
            cmd.push_str(&format!("cd {dir};"));
        }
        cmd
    });

    let envs = options.envs.as_deref();
    let run = if options.interactive {
        let srun = match worker_cmd {
            Some(ref cmd) => words([
                "srun",
                &flag_text,
                &options.shell,
                "-c",
                &format!("'{cmd} {invocation}'"),
            ]),
            None => words([
                entry.assignment().as_str(),
                "srun",
                &flag_text,
                entry.entry(options.entry_script.as_deref()),
            ]),
        };
        with_envs(envs, &srun)
    } else {
        let body = worker_cmd.unwrap_or_default();
        let submission = with_envs(
            envs,
            &format!("sbatch {flag_text} -d singleton <<<'#!/bin/bash\n{body}\n{invocation}'"),
        );
        let count = options.n_seq_jobs.unwrap_or(1).max(1);
        (0..count)
            .map(|_| submission.clone())
            .collect::<Vec<_>>()
            .join("\n")
    };

    let pypath = (!options.pypath.is_empty())
        .then(|| format!("export PYTHONPATH=$PYTHONPATH:{}", options.pypath));

    Ok(RunnerFragments {
        setup: lines(
            [
                "printf \"\\e[1;34m%-6s\\e[m\\n\" \"Running on login-node `hostname`\"",
                options.setup.as_str(),
                pypath.as_deref().unwrap_or_default(),
            ],
        ),
        run,
        post: options.post_script.trim().to_owned(),
    })
}
