//! Unit tests for document loading and resolution.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use serde_yaml::{Mapping, Value};

use super::*;
use crate::mount::Mount;
use crate::runner::RunnerKind;
use crate::template::ContextValue;

const DOCUMENT: &str = r#"
verbose: false
mounts:
  - !mounts.Simple
    host_path: "{env.HOME}/data"
    pypath: true
runner: !runners.Docker
  image: "python:3.11"
  gpu: false
  envs: "RUN={run.count}"
run:
  type: ssh
  launch: !ENV
    type: ssh
    launch_dir: "{env.HOME}/launch"
modes:
  fast:
    type: local-docker
    launch:
      type: local-docker
  gpu:
    runner: !runners.Slurm
      partition: gpu
"#;

#[fixture]
fn ctx() -> ResolutionContext {
    ResolutionContext::new().with(
        "env",
        ContextValue::map([("HOME", ContextValue::text("/home/sam"))]),
    )
}

fn path() -> Utf8PathBuf {
    Utf8PathBuf::from("/work/project/.sortie.yml")
}

fn document(ctx: &ResolutionContext) -> Document {
    Document::parse(&path(), DOCUMENT, ctx).expect("document parses")
}

fn text(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str)
}

#[rstest]
fn run_block_applies_without_a_mode(ctx: ResolutionContext) {
    let resolved = document(&ctx)
        .resolve(None, &Overrides::default(), &BTreeMap::new())
        .expect("resolves");

    assert_eq!(text(resolved.get("type")), Some("ssh"));
    assert_eq!(resolved.mode, None);
    assert_eq!(
        text(resolved.launch.get("launch_dir")),
        Some("/home/sam/launch")
    );
}

#[rstest]
fn named_mode_overrides_the_root(ctx: ResolutionContext) {
    let resolved = document(&ctx)
        .resolve(Some("fast"), &Overrides::default(), &BTreeMap::new())
        .expect("resolves");

    assert_eq!(text(resolved.get("type")), Some("local-docker"));
    assert_eq!(resolved.mode.as_deref(), Some("fast"));
    let launch = resolved.launch_config().expect("launch parses");
    assert_eq!(launch.kind, crate::launch::BackendKind::LocalDocker);
}

#[rstest]
fn modes_inherit_root_runner_and_mounts(ctx: ResolutionContext) {
    let doc = document(&ctx);

    let fast = doc
        .resolve(Some("fast"), &Overrides::default(), &BTreeMap::new())
        .expect("resolves");
    let gpu = doc
        .resolve(Some("gpu"), &Overrides::default(), &BTreeMap::new())
        .expect("resolves");

    assert_eq!(fast.runner.map(|spec| spec.kind), Some(RunnerKind::Docker));
    assert_eq!(gpu.runner.map(|spec| spec.kind), Some(RunnerKind::Slurm));
    assert_eq!(fast.mounts.len(), 1);
    assert_eq!(
        fast.mounts.first().map(|mount| mount.id()),
        gpu.mounts.first().map(|mount| mount.id())
    );
}

#[rstest]
fn mount_fields_are_interpolated_at_load_time(ctx: ResolutionContext) {
    let resolved = document(&ctx)
        .resolve(None, &Overrides::default(), &BTreeMap::new())
        .expect("resolves");

    let mount = resolved.mounts.first().expect("one mount");
    assert_eq!(mount.host_path(), "/home/sam/data");
    assert!(mount.on_search_path());
}

#[rstest]
fn runner_options_keep_placeholders_until_run_time(ctx: ResolutionContext) {
    let resolved = document(&ctx)
        .resolve(None, &Overrides::default(), &BTreeMap::new())
        .expect("resolves");

    let spec = resolved.runner.expect("runner declared");
    assert_eq!(text(spec.options.get("envs")), Some("RUN={run.count}"));
}

#[rstest]
fn unknown_mode_lists_available_modes(ctx: ResolutionContext) {
    let err = document(&ctx)
        .resolve(Some("slow"), &Overrides::default(), &BTreeMap::new())
        .expect_err("mode is not declared");

    match err {
        ConfigError::UnknownMode { mode, available } => {
            assert_eq!(mode, "slow");
            assert_eq!(available, vec![String::from("fast"), String::from("gpu")]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[rstest]
fn missing_run_block_requires_a_mode(ctx: ResolutionContext) {
    let doc = Document::parse(&path(), "modes:\n  fast: {}\n", &ctx).expect("parses");

    let err = doc
        .resolve(None, &Overrides::default(), &BTreeMap::new())
        .expect_err("no default");

    assert!(matches!(err, ConfigError::MissingDefault { .. }));
}

#[rstest]
fn runner_override_merges_key_by_key(ctx: ResolutionContext) {
    let mut runner = Mapping::new();
    runner.insert(Value::from("gpu"), Value::from(true));
    let overrides = Overrides {
        runner: Some(runner),
        ..Overrides::default()
    };

    let resolved = document(&ctx)
        .resolve(None, &overrides, &BTreeMap::new())
        .expect("resolves");

    let options = resolved.runner.expect("runner declared").options;
    assert_eq!(text(options.get("image")), Some("python:3.11"));
    assert_eq!(options.get("gpu"), Some(&Value::from(true)));
}

#[rstest]
fn launch_and_host_overrides_merge(ctx: ResolutionContext) {
    let mut launch = Mapping::new();
    launch.insert(Value::from("delay"), Value::from(30));
    let mut host = Mapping::new();
    host.insert(Value::from("ip"), Value::from("10.0.0.5"));
    let overrides = Overrides {
        launch: Some(launch),
        host: Some(host),
        ..Overrides::default()
    };

    let resolved = document(&ctx)
        .resolve(None, &overrides, &BTreeMap::new())
        .expect("resolves");

    assert_eq!(text(resolved.launch.get("type")), Some("ssh"));
    assert_eq!(resolved.launch.get("delay"), Some(&Value::from(30)));
    assert_eq!(text(resolved.host.get("ip")), Some("10.0.0.5"));
}

#[rstest]
fn runner_override_without_runner_is_rejected(ctx: ResolutionContext) {
    let doc = Document::parse(&path(), "run:\n  launch: {type: ssh}\n", &ctx).expect("parses");
    let overrides = Overrides {
        runner: Some(Mapping::new()),
        ..Overrides::default()
    };

    let err = doc
        .resolve(None, &overrides, &BTreeMap::new())
        .expect_err("nothing to override");

    assert!(matches!(
        err,
        ConfigError::InvalidOverride {
            section: "runner",
            ..
        }
    ));
}

#[rstest]
fn extensions_apply_last(ctx: ResolutionContext) {
    let extensions = BTreeMap::from([(String::from("type"), Value::from("vm-a"))]);

    let resolved = document(&ctx)
        .resolve(None, &Overrides::default(), &extensions)
        .expect("resolves");

    assert_eq!(text(resolved.get("type")), Some("vm-a"));
}

#[rstest]
fn local_mode_needs_no_declaration(ctx: ResolutionContext) {
    let resolved = document(&ctx)
        .resolve(Some(LOCAL_MODE), &Overrides::default(), &BTreeMap::new())
        .expect("resolves");

    assert!(resolved.local);
    assert_eq!(resolved.get("type"), None);
}

#[rstest]
#[case("mounts:\n  - !mounts.Ftp {host_path: /x}\n", "mounts.Ftp")]
#[case("runner: !runners.Kubernetes {}\n", "runners.Kubernetes")]
#[case("launch: !secret {type: ssh}\n", "secret")]
fn unknown_tags_fail_the_load(ctx: ResolutionContext, #[case] text: &str, #[case] tag: &str) {
    let err = Document::parse(&path(), text, &ctx).expect_err("tag is unknown");

    match err {
        ConfigError::UnknownTag { tag: found, known } => {
            assert_eq!(found, tag);
            assert!(known.contains("mounts.S3Code"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[rstest]
#[case("mounts:\n  - host_path: /x\n")]
#[case("runner: !mounts.Simple {host_path: /x}\n")]
#[case("extra: !runners.Docker {image: x}\n")]
#[case("mounts:\n  - !mounts.S3Code {host_path: /x}\n")]
#[case("verbose: maybe\n")]
fn misplaced_or_malformed_nodes_are_invalid(ctx: ResolutionContext, #[case] text: &str) {
    let err = Document::parse(&path(), text, &ctx).expect_err("node is invalid");

    assert!(matches!(err, ConfigError::InvalidNode { .. }), "{err}");
}

#[rstest]
fn load_time_templates_report_missing_keys(ctx: ResolutionContext) {
    let text = "launch: !ENV\n  type: ssh\n  launch_dir: \"{missing_field}\"\n";

    let err = Document::parse(&path(), text, &ctx).expect_err("key is missing");

    match err {
        ConfigError::Template(TemplateError::MissingKey {
            field,
            key,
            available,
        }) => {
            assert_eq!(field, "root.launch.launch_dir");
            assert_eq!(key, "missing_field");
            assert_eq!(available, vec![String::from("env")]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[rstest]
fn invalid_yaml_is_a_parse_error(ctx: ResolutionContext) {
    let err = Document::parse(&path(), "run: [unclosed", &ctx).expect_err("not yaml");

    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[rstest]
fn verbose_flag_is_read(ctx: ResolutionContext) {
    let doc = Document::parse(&path(), "verbose: true\nrun: {}\n", &ctx).expect("parses");

    let resolved = doc
        .resolve(None, &Overrides::default(), &BTreeMap::new())
        .expect("resolves");

    assert!(resolved.verbose);
}

#[rstest]
fn discovery_walks_ancestor_directories() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8 path");
    let nested = root.join("a").join("b");
    std::fs::create_dir_all(&nested).expect("create nested dirs");
    std::fs::write(root.join(CONFIG_FILE_NAME), "run: {}\n").expect("write document");

    let found = Document::discover(&nested).expect("document found");

    assert_eq!(found, root.join(CONFIG_FILE_NAME));
}

#[rstest]
fn discovery_fails_without_a_document() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8 path");

    let result = Document::discover(&root);

    // A stray document above the temp dir would make discovery succeed.
    if let Err(err) = result {
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }
}

#[rstest]
fn load_reads_from_disk(ctx: ResolutionContext) {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8 path");
    let file = root.join(CONFIG_FILE_NAME);
    std::fs::write(&file, DOCUMENT).expect("write document");

    let doc = Document::load(&file, &ctx).expect("loads");

    assert_eq!(doc.path(), file.as_path());
    assert_eq!(doc.root_dir(), root.as_path());
    assert_eq!(doc.mode_names(), vec![String::from("fast"), String::from("gpu")]);
}

#[rstest]
fn load_reports_missing_files(ctx: ResolutionContext) {
    let err = Document::load(Utf8Path::new("/nonexistent/dir/.sortie.yml"), &ctx)
        .expect_err("file is missing");

    assert!(matches!(err, ConfigError::Read { .. }));
}
