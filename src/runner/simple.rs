//! Plain shell runner, optionally detached under `screen`.

use serde::Deserialize;

use super::{EntryPoint, RunnerFragments, inline, lines, with_envs};

fn default_shell() -> String {
    String::from("/bin/bash")
}

#[derive(Debug, Deserialize)]
pub(super) struct SimpleOptions {
    #[serde(default)]
    pypath: String,
    #[serde(default)]
    work_dir: Option<String>,
    #[serde(default)]
    setup: String,
    #[serde(default)]
    startup: Option<String>,
    #[serde(default)]
    envs: Option<String>,
    #[serde(default = "default_shell")]
    shell: String,
    #[serde(default)]
    entry_script: Option<String>,
    #[serde(default)]
    pipe: String,
    #[serde(default)]
    cleanup: String,
    /// Keeps the job alive after the SSH session detaches.
    #[serde(default)]
    detach: bool,
    #[serde(default)]
    use_gpu: bool,
    #[serde(default)]
    verbose: bool,
    #[serde(default)]
    post_script: String,
}

pub(super) fn fragments(options: SimpleOptions, entry: &EntryPoint) -> RunnerFragments {
    let mut cmd = String::new();
    if options.verbose {
        let gpu = if options.use_gpu { " (gpu)" } else { "" };
        cmd.push_str(&format!(
            "printf \"\\e[1;34m%-6s\\e[m\" \"Running on remote host{gpu}\";"
        ));
    }
    cmd.push_str(&inline(options.startup.as_deref().unwrap_or_default()));
    cmd.push_str(&format!("export PYTHONPATH=$PYTHONPATH:{};", options.pypath));
    if let Some(ref dir) = options.work_dir {
        cmd.push_str(&format!("cd {dir};"));
    }
    cmd.push_str(&entry.invocation(options.entry_script.as_deref()));

    let envs = options.envs.as_deref();
    let (setup, cleanup, pipe, shell) = if options.detach {
        (
            format!("export pipe=`mktemp -u`\nmkfifo $pipe\n{}", options.setup),
            format!("cat $pipe\nrm -f $pipe\n{}", options.cleanup),
            format!(" |& tee -p $pipe{}", options.pipe),
            format!("screen -md {}", options.shell),
        )
    } else {
        (options.setup, options.cleanup, options.pipe, options.shell)
    };

    let test_gpu = options.use_gpu.then(|| {
        lines([
            "echo 'Testing nvidia-smi'",
            &with_envs(envs, "nvidia-smi"),
        ])
    });

    RunnerFragments {
        setup: lines(setup.lines()),
        run: lines([
            test_gpu.as_deref().unwrap_or_default(),
            &with_envs(envs, &format!("{shell} -c '{cmd}{pipe}'")),
        ]),
        post: lines(cleanup.lines().chain(options.post_script.lines())),
    }
}
