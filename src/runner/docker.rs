//! `docker run` runner.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_yaml::Value;
use uuid::Uuid;

use super::{EntryPoint, RunnerError, RunnerFragments, extra_flags, inline, lines, with_envs, words};
use crate::mount::SharedMount;

fn default_docker_cmd() -> String {
    String::from("docker")
}

#[derive(Debug, Deserialize)]
pub(super) struct DockerOptions {
    image: String,
    #[serde(default)]
    work_dir: Option<String>,
    /// Passed to docker as `--workdir`, unlike `work_dir` which is a `cd`.
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    setup: String,
    #[serde(default)]
    startup: Option<String>,
    #[serde(default)]
    pypath: Option<String>,
    #[serde(default)]
    envs: Option<String>,
    #[serde(default)]
    entry_script: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_docker_cmd")]
    docker_cmd: String,
    #[serde(default)]
    ipc: Option<String>,
    #[serde(default)]
    net: Option<String>,
    #[serde(default)]
    tty: bool,
    #[serde(default)]
    post_script: String,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

pub(super) fn fragments(
    options: DockerOptions,
    entry: &EntryPoint,
    mounts: &[SharedMount],
) -> Result<RunnerFragments, RunnerError> {
    if options.image.trim().is_empty() {
        return Err(RunnerError::Options {
            kind: "Docker",
            message: String::from("`image` must not be empty"),
        });
    }

    let DockerOptions {
        image,
        work_dir,
        workdir,
        setup,
        startup,
        pypath,
        envs,
        entry_script,
        name,
        docker_cmd,
        ipc,
        net,
        tty,
        post_script,
        mut extra,
    } = options;

    let is_gpu = extra.get("gpus").is_some_and(is_truthy) || docker_cmd.contains("nvidia");

    let mut cmd = format!("echo \"Running in {docker_cmd}\";");
    cmd.push_str(&inline(startup.as_deref().unwrap_or_default()));
    if let Some(ref path) = pypath {
        cmd.push_str(&format!("export PYTHONPATH=$PYTHONPATH:{path};"));
    }
    if let Some(ref dir) = work_dir {
        cmd.push_str(&format!("cd {dir};"));
    }
    cmd.push_str(&entry.invocation(entry_script.as_deref()));

    for (key, value) in [("workdir", workdir), ("net", net), ("ipc", ipc)] {
        if let Some(text) = value {
            extra.insert(key.to_owned(), Value::String(text));
        }
    }
    let rest = extra_flags(&extra, false);
    let envs_ref = envs.as_deref();

    let container = name
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let remove_by_name = name.as_ref().map(|_| {
        lines([
            "echo -ne 'kill running instances '",
            &format!("{docker_cmd} kill {container}"),
            "echo -ne 'remove existing container '",
            &with_envs(envs_ref, &format!("{docker_cmd} rm {container}")),
        ])
    });
    let test_gpu = is_gpu.then(|| {
        lines([
            "echo 'Testing nvidia-smi inside docker'",
            &with_envs(
                envs_ref,
                &words([docker_cmd.as_str(), "run", "--rm", &rest, &image, "nvidia-smi"]),
            ),
        ])
    });

    let volumes = mounts
        .iter()
        .map(|mount| mount.docker_volume())
        .collect::<Vec<_>>()
        .join(" ");
    let interactive = if tty { "-it" } else { "-i" };
    let name_flag = format!("--name '{container}'");
    let shell = format!("/bin/bash -c '{cmd}'");
    let run_words = [
        docker_cmd.as_str(),
        "run",
        interactive,
        &rest,
        &volumes,
        &name_flag,
        &image,
        &shell,
    ];
    let run_line = with_envs(envs_ref, &words(run_words));

    Ok(RunnerFragments {
        setup: setup.trim().to_owned(),
        run: lines([
            remove_by_name.as_deref().unwrap_or_default(),
            test_gpu.as_deref().unwrap_or_default(),
            "echo 'Now run docker'",
            &run_line,
        ]),
        post: post_script.trim().to_owned(),
    })
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::String(text) => !text.is_empty(),
        _ => true,
    }
}
