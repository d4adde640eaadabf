//! Unit tests for script composition.

use super::*;
use rstest::{fixture, rstest};

#[fixture]
fn body() -> ScriptBody {
    ScriptBody {
        host_setup: vec![String::from("a;"), String::from("b;")],
        uploads: vec![String::from("sync &")],
        runner: RunnerFragments {
            setup: String::from("prep;"),
            run: String::from("r;"),
            post: String::from("done;"),
        },
    }
}

fn position(script: &str, needle: &str) -> usize {
    script
        .find(needle)
        .unwrap_or_else(|| panic!("`{needle}` missing from script:\n{script}"))
}

#[rstest]
fn fragments_follow_the_fixed_order(body: ScriptBody) {
    let options = ScriptOptions {
        root_config: Some(String::from("source /etc/profile")),
        setup: Some(String::from("echo setup")),
        ..ScriptOptions::default()
    };

    let script = compose(BackendKind::Ssh, &options, &body).expect("composes");

    let order = [
        "#!/bin/bash",
        "set +o posix",
        "source /etc/profile",
        "mkdir -p /tmp/sortie-launch",
        "SORTIE_LAUNCH_DIR=/tmp/sortie-launch",
        "{",
        "echo setup",
        "a;",
        "b;",
        "sync &",
        "prep;",
        "r;",
        "done;",
        "} > >(tee -a /tmp/sortie-launch/sortie-launch.log)",
    ];
    let positions: Vec<usize> = order.iter().map(|needle| position(&script, needle)).collect();
    assert!(
        positions.windows(2).all(|pair| pair.first() < pair.get(1)),
        "out of order:\n{script}"
    );
}

#[rstest]
fn empty_fragments_leave_no_blank_lines() {
    let body = ScriptBody {
        runner: RunnerFragments {
            run: String::from("r;"),
            ..RunnerFragments::default()
        },
        ..ScriptBody::default()
    };

    let script = compose(BackendKind::LocalDocker, &ScriptOptions::default(), &body)
        .expect("composes");

    assert_eq!(
        script,
        "#!/bin/bash\n\
         # process substitution needs bash outside posix mode\n\
         set +o posix\n\
         mkdir -p /tmp/sortie-launch\n\
         SORTIE_LAUNCH_DIR=/tmp/sortie-launch\n\
         {\n\
         r;\n\
         } > >(tee -a /tmp/sortie-launch/sortie-launch.log) 2> >(tee -a /tmp/sortie-launch/sortie-launch.err.log >&2)\n"
    );
}

#[rstest]
fn pipe_out_replaces_the_log_redirection(body: ScriptBody) {
    let options = ScriptOptions {
        pipe_out: Some(String::from("> /dev/null 2>&1")),
        ..ScriptOptions::default()
    };

    let script = compose(BackendKind::Manager, &options, &body).expect("composes");

    assert!(script.ends_with("} > /dev/null 2>&1\n"), "{script}");
    assert!(!script.contains("tee -a"));
}

#[rstest]
#[case(BackendKind::Ssh, "ssh")]
#[case(BackendKind::LocalDocker, "local-docker")]
#[case(BackendKind::Manager, "manager")]
fn termination_is_rejected_without_a_strategy(
    body: ScriptBody,
    #[case] kind: BackendKind,
    #[case] name: &'static str,
) {
    let options = ScriptOptions {
        terminate_after: true,
        ..ScriptOptions::default()
    };

    let err = compose(kind, &options, &body).expect_err("must fail fast");

    assert_eq!(err, ScriptError::UnsupportedCapability { kind: name });
}

#[rstest]
fn ec2_scripts_tag_and_terminate_last(body: ScriptBody) {
    let options = ScriptOptions {
        terminate_after: true,
        delay: Some(60),
        instance_name: Some(String::from("sweep-1")),
        ..ScriptOptions::default()
    };

    let script = compose(BackendKind::Ec2, &options, &body).expect("composes");

    let tag = position(&script, "Key=Name,Value='sweep-1'");
    let terminate = position(&script, "aws ec2 terminate-instances");
    assert!(tag < position(&script, "a;"));
    assert!(position(&script, "done;") < position(&script, "sleep 60"));
    assert!(position(&script, "sleep 60") < terminate);
}

#[rstest]
fn gce_scripts_delete_themselves(body: ScriptBody) {
    let options = ScriptOptions {
        terminate_after: true,
        instance_name: Some(String::from("ignored-for-gce")),
        ..ScriptOptions::default()
    };

    let script = compose(BackendKind::Gce, &options, &body).expect("composes");

    assert!(script.contains("gcloud compute instances delete"));
    assert!(!script.contains("create-tags"));
}

#[rstest]
fn overlong_instance_names_are_rejected(body: ScriptBody) {
    let options = ScriptOptions {
        instance_name: Some("x".repeat(129)),
        ..ScriptOptions::default()
    };

    let err = compose(BackendKind::Ec2, &options, &body).expect_err("name too long");

    assert_eq!(err, ScriptError::InstanceNameTooLong { length: 129 });
}

#[test]
fn host_unpack_script_holds_only_setup_and_delay() {
    let options = ScriptOptions {
        launch_dir: String::from("/srv/launch"),
        delay: Some(3),
        root_config: Some(String::from("ulimit -n 4096")),
        ..ScriptOptions::default()
    };

    let script = compose_host_unpack(&options, &[String::from("a;"), String::from("b;")]);

    assert_eq!(
        script,
        "#!/bin/bash\n\
         # process substitution needs bash outside posix mode\n\
         set +o posix\n\
         ulimit -n 4096\n\
         mkdir -p /srv/launch\n\
         {\n\
         a;\n\
         b;\n\
         sleep 3\n\
         } > >(tee -a /srv/launch/sortie-launch.log) 2> >(tee -a /srv/launch/sortie-launch.err.log >&2)\n"
    );
}
