//! Document discovery and mode resolution against files on disk.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use rstest::{fixture, rstest};
use serde_yaml::{Mapping, Value};
use tempfile::TempDir;

use sortie::config::{CONFIG_FILE_NAME, ConfigError, Document, Overrides};
use sortie::template::{ContextValue, ResolutionContext};

const DOCUMENT: &str = r#"
runner: !runners.Docker
  image: x
  gpu: false
run:
  launch:
    type: ssh
    ip: 10.0.0.5
modes:
  fast:
    launch:
      type: local-docker
"#;

struct Project {
    _dir: TempDir,
    root: Utf8PathBuf,
}

#[fixture]
fn project() -> Project {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8Path::from_path(dir.path())
        .expect("utf-8 temp dir")
        .to_path_buf();
    let handle = Dir::open_ambient_dir(&root, ambient_authority()).expect("open temp dir");
    handle
        .write(CONFIG_FILE_NAME, DOCUMENT)
        .expect("write document");
    handle.create_dir_all("src/nested").expect("nested dirs");
    Project { _dir: dir, root }
}

fn ctx() -> ResolutionContext {
    ResolutionContext::new().with(
        "env",
        ContextValue::map([("HOME", ContextValue::text("/home/sam"))]),
    )
}

fn load(project: &Project) -> Document {
    let path = Document::discover(&project.root.join("src/nested")).expect("discovers");
    Document::load(&path, &ctx()).expect("loads")
}

fn launch_type(document: &Document, mode: Option<&str>) -> Option<String> {
    document
        .resolve(mode, &Overrides::default(), &BTreeMap::new())
        .expect("resolves")
        .launch
        .get("type")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

#[rstest]
fn discovery_walks_up_from_nested_directories(project: Project) {
    let path = Document::discover(&project.root.join("src/nested")).expect("discovers");

    assert_eq!(path, project.root.join(CONFIG_FILE_NAME));
}

#[rstest]
fn the_run_block_and_modes_select_the_backend(project: Project) {
    let document = load(&project);

    assert_eq!(launch_type(&document, None).as_deref(), Some("ssh"));
    assert_eq!(
        launch_type(&document, Some("fast")).as_deref(),
        Some("local-docker")
    );
}

#[rstest]
fn unknown_modes_list_the_declared_ones(project: Project) {
    let document = load(&project);

    let err = document
        .resolve(Some("slow"), &Overrides::default(), &BTreeMap::new())
        .expect_err("mode is undeclared");

    let ConfigError::UnknownMode { mode, available } = err else {
        panic!("expected UnknownMode");
    };
    assert_eq!(mode, "slow");
    assert_eq!(available, vec![String::from("fast")]);
}

#[rstest]
fn runner_overrides_keep_untouched_options(project: Project) {
    let document = load(&project);
    let mut runner = Mapping::new();
    runner.insert(Value::from("gpu"), Value::Bool(true));

    let resolved = document
        .resolve(
            None,
            &Overrides {
                runner: Some(runner),
                ..Overrides::default()
            },
            &BTreeMap::new(),
        )
        .expect("resolves");

    let options = resolved.runner.expect("runner declared").options;
    assert_eq!(options.get("image"), Some(&Value::from("x")));
    assert_eq!(options.get("gpu"), Some(&Value::Bool(true)));
}

#[rstest]
fn extensions_land_in_the_resolved_namespace(project: Project) {
    let document = load(&project);
    let extensions = BTreeMap::from([(String::from("seed"), Value::from(7))]);

    let resolved = document
        .resolve(Some("fast"), &Overrides::default(), &extensions)
        .expect("resolves");

    assert_eq!(resolved.get("seed"), Some(&Value::from(7)));
}

#[test]
fn a_missing_document_is_reported_with_the_start_directory() {
    let dir = TempDir::new().expect("temp dir");
    let start = Utf8Path::from_path(dir.path()).expect("utf-8 temp dir");

    let err = Document::discover(start).expect_err("nothing to find");

    assert!(matches!(err, ConfigError::NotFound { start: ref dir } if dir == start));
}
