//! Unit tests for mount kinds.

use super::*;
use crate::test_support::ScriptedRunner;
use rstest::{fixture, rstest};

fn yaml(text: &str) -> Value {
    serde_yaml::from_str(text).expect("yaml fixture")
}

fn args_of(runner: &ScriptedRunner, index: usize) -> Vec<String> {
    runner
        .invocations()
        .get(index)
        .expect("invocation recorded")
        .args
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

#[fixture]
fn settings() -> Settings {
    Settings::default()
}

#[rstest]
fn s3_code_host_setup_downloads_and_unpacks() {
    let mount = S3Code::from_value(yaml(
        "s3_prefix: s3://bucket/code/\nhost_path: /srv/proj\nname: proj\n",
    ))
    .expect("valid declaration");

    let setup = mount.host_setup().expect("code mounts unpack on the host");

    assert_eq!(
        setup,
        "aws s3 cp s3://bucket/code/proj.tar.gz /tmp/proj.tar.gz\n\
         mkdir -p /srv/proj\n\
         tar -xzf /tmp/proj.tar.gz -C /srv/proj"
    );
    assert_eq!(mount.container_path(), "/srv/proj");
    assert!(mount.upload_fragment().is_none());
}

#[rstest]
fn s3_code_upload_packs_then_copies(settings: Settings) {
    let mount = S3Code::from_value(yaml(
        "local_path: ./proj\ns3_prefix: s3://bucket/code\nhost_path: /srv/proj\n\
         name: proj\nexcludes: ['.git', '*.pyc']\n",
    ))
    .expect("valid declaration");
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_success();
    let launch = Mapping::new();
    let ctx = UploadContext {
        runner: &runner,
        settings: &settings,
        launch: &launch,
    };

    mount.upload(&ctx).expect("upload succeeds");

    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 2);
    assert_eq!(invocations.first().map(|call| call.program.as_str()), Some("tar"));
    let tar_args = args_of(&runner, 0);
    assert_eq!(tar_args.first().map(String::as_str), Some("-czf"));
    assert!(tar_args.contains(&String::from("--exclude=.git")));
    assert!(tar_args.contains(&String::from("--exclude=*.pyc")));
    assert_eq!(
        tar_args.get(tar_args.len() - 3..),
        Some(&["-C", "./proj", "."].map(String::from)[..])
    );

    let aws_args = args_of(&runner, 1);
    assert_eq!(aws_args.get(..2), Some(&["s3", "cp"].map(String::from)[..]));
    assert_eq!(aws_args.get(2), tar_args.get(1));
    assert_eq!(
        aws_args.last().map(String::as_str),
        Some("s3://bucket/code/proj.tar.gz")
    );
}

#[rstest]
fn failed_pack_stops_before_copy(settings: Settings) {
    let mount = GsCode::from_value(yaml("gs_prefix: gs://bucket\nhost_path: /srv/proj\n"))
        .expect("valid declaration");
    let runner = ScriptedRunner::new();
    runner.push_failure(2);
    let launch = Mapping::new();
    let ctx = UploadContext {
        runner: &runner,
        settings: &settings,
        launch: &launch,
    };

    let err = mount.upload(&ctx).expect_err("tar failure propagates");

    assert!(matches!(err, MountError::Exec(ExecError::CommandFailure { .. })), "{err}");
    assert_eq!(runner.invocations().len(), 1);
}

#[rstest]
fn ssh_code_upload_requires_a_host(settings: Settings) {
    let mount = SshCode::from_value(yaml("host_path: /srv/proj\n")).expect("valid declaration");
    let runner = ScriptedRunner::new();
    let launch = Mapping::new();
    let ctx = UploadContext {
        runner: &runner,
        settings: &settings,
        launch: &launch,
    };

    let err = mount.upload(&ctx).expect_err("missing ip should fail");

    assert!(matches!(err, MountError::Target { kind: "SshCode", .. }), "{err}");
    assert!(runner.invocations().is_empty());
}

#[rstest]
fn ssh_code_upload_copies_to_remote_tar(settings: Settings) {
    let mount = SshCode::from_value(yaml(
        "host_path: /srv/proj\nname: proj\ncompress: false\n",
    ))
    .expect("valid declaration");
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_success();
    let Value::Mapping(launch) = yaml("type: ssh\nip: 10.0.0.5\nusername: ada\n") else {
        panic!("launch fixture must be a mapping");
    };
    let ctx = UploadContext {
        runner: &runner,
        settings: &settings,
        launch: &launch,
    };

    mount.upload(&ctx).expect("upload succeeds");

    let scp = runner.invocations().pop().expect("scp recorded");
    assert_eq!(scp.program, "scp");
    assert!(scp.command_string().ends_with("ada@10.0.0.5:/tmp/proj.tar"));
    assert_eq!(
        mount.host_setup().as_deref(),
        Some("mkdir -p /srv/proj\ntar -xf /tmp/proj.tar -C /srv/proj")
    );
}

#[rstest]
#[case("s3_prefix: s3://b\nhost_path: /x\nbucket: nope\n")]
#[case("host_path: /x\n")]
fn s3_code_rejects_bad_declarations(#[case] text: &str) {
    let err = S3Code::from_value(yaml(text)).expect_err("declaration should be rejected");
    assert!(matches!(err, MountError::Spec { kind: "S3Code", .. }), "{err}");
}

#[test]
fn simple_mount_maps_into_docker() {
    let mount = Simple::from_value(yaml("host_path: /data\ncontainer_path: /mnt/data\n"))
        .expect("valid declaration");

    assert_eq!(mount.docker_volume(), "-v '/data':'/mnt/data'");
    assert!(mount.host_setup().is_none());
}

#[test]
fn output_mount_contributes_a_sync_loop() {
    let mount = S3Output::from_value(yaml(
        "s3_prefix: s3://bucket/runs/7\nhost_path: /srv/out\ninterval: 30\n",
    ))
    .expect("valid declaration");

    assert_eq!(
        mount.upload_fragment().as_deref(),
        Some("while true; do aws s3 sync /srv/out s3://bucket/runs/7 --quiet; sleep 30; done &")
    );
    assert!(!mount.on_search_path());
}

#[test]
fn search_path_joins_flagged_mounts_in_order() {
    let mounts: Vec<SharedMount> = vec![
        Arc::new(Simple::new("/a", true)),
        Arc::new(Simple::new("/b", false)),
        Arc::new(Simple::new("/c", true)),
    ];

    assert_eq!(search_path(&mounts, false), "/a:/c");
}

#[test]
fn mount_ids_are_unique_per_instance() {
    let first = Simple::new("/a", false);
    let second = Simple::new("/a", false);
    assert_ne!(first.id(), second.id());
}
