//! Converts parsed YAML into sections, building tagged nodes on the way.

use std::collections::BTreeMap;

use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};

use super::registry::{self, TagKind};
use super::{ConfigError, Section};
use crate::mount::SharedMount;
use crate::runner::RunnerSpec;
use crate::template::{ResolutionContext, yaml_key};

/// Top-level layout of a document before mode selection.
#[derive(Debug, Default)]
pub(super) struct Layout {
    pub(super) root: Section,
    pub(super) run: Option<Section>,
    pub(super) modes: BTreeMap<String, Section>,
}

/// Splits the document root into its default, `run`, and `modes` layers.
pub(super) fn layout(document: &Value, ctx: &ResolutionContext) -> Result<Layout, ConfigError> {
    let mapping = match document {
        Value::Null => return Ok(Layout::default()),
        Value::Mapping(mapping) => mapping,
        other => {
            return Err(ConfigError::InvalidNode {
                tag: String::from("document"),
                message: format!("expected a mapping at the top level, found {}", kind_of(other)),
            });
        }
    };

    let mut root = Mapping::new();
    let mut run = None;
    let mut modes = BTreeMap::new();
    for (key, value) in mapping {
        match yaml_key(key).as_deref() {
            Some("run") => run = Some(section("run", &expect_mapping("run", value)?, ctx)?),
            Some("modes") => {
                let declared = expect_mapping("modes", value)?;
                for (name, body) in &declared {
                    let Some(name) = yaml_key(name) else {
                        return Err(invalid("modes", "mode names must be scalars"));
                    };
                    let scope = format!("modes.{name}");
                    let parsed = section(&scope, &expect_mapping(&scope, body)?, ctx)?;
                    modes.insert(name, parsed);
                }
            }
            _ => {
                root.insert(key.clone(), value.clone());
            }
        }
    }

    Ok(Layout {
        root: section("root", &root, ctx)?,
        run,
        modes,
    })
}

/// Builds one configuration layer.
pub(super) fn section(
    scope: &str,
    mapping: &Mapping,
    ctx: &ResolutionContext,
) -> Result<Section, ConfigError> {
    let mut section = Section::default();
    for (key, value) in mapping {
        let Some(name) = yaml_key(key) else {
            return Err(invalid(scope, "keys must be scalars"));
        };
        let field = format!("{scope}.{name}");
        match name.as_str() {
            "mounts" => section.mounts = Some(mounts(&field, value, ctx)?),
            "runner" => section.runner = Some(runner(&field, value, ctx)?),
            "launch" => section.launch = Some(plain_mapping(&field, value, ctx)?),
            "host" => section.host = Some(plain_mapping(&field, value, ctx)?),
            "verbose" => {
                let flag = plain(&field, value, ctx)?;
                section.verbose = Some(flag.as_bool().ok_or_else(|| {
                    invalid(&field, "expected true or false")
                })?);
            }
            _ => {
                section.extra.insert(name, plain(&field, value, ctx)?);
            }
        }
    }
    Ok(section)
}

fn mounts(
    field: &str,
    value: &Value,
    ctx: &ResolutionContext,
) -> Result<Vec<SharedMount>, ConfigError> {
    let items = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Sequence(items) => items,
        other => {
            return Err(invalid(
                field,
                &format!("expected a list of mounts, found {}", kind_of(other)),
            ));
        }
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| mount(&format!("{field}[{index}]"), item, ctx))
        .collect()
}

fn mount(field: &str, value: &Value, ctx: &ResolutionContext) -> Result<SharedMount, ConfigError> {
    let Value::Tagged(tagged) = value else {
        return Err(invalid(field, "mounts must be tagged, e.g. `!mounts.S3Code`"));
    };
    let name = tag_name(tagged);
    match registry::lookup(&name) {
        Some(TagKind::Mount(build)) => {
            let resolved = plain(field, &tagged.value, ctx)?;
            let rendered = ctx.render_value(field, &resolved)?;
            build(rendered).map_err(|err| ConfigError::InvalidNode {
                tag: name,
                message: err.to_string(),
            })
        }
        Some(_) => Err(ConfigError::InvalidNode {
            tag: name,
            message: format!("`{field}` expects a `!mounts.*` tag"),
        }),
        None => Err(unknown(name)),
    }
}

fn runner(field: &str, value: &Value, ctx: &ResolutionContext) -> Result<RunnerSpec, ConfigError> {
    let Value::Tagged(tagged) = value else {
        return Err(invalid(field, "the runner must be tagged, e.g. `!runners.Docker`"));
    };
    let name = tag_name(tagged);
    match registry::lookup(&name) {
        Some(TagKind::Runner(kind)) => {
            let options = match plain(field, &tagged.value, ctx)? {
                Value::Null => Mapping::new(),
                Value::Mapping(options) => options,
                other => {
                    return Err(ConfigError::InvalidNode {
                        tag: name,
                        message: format!("expected an option mapping, found {}", kind_of(&other)),
                    });
                }
            };
            Ok(RunnerSpec::new(kind, options))
        }
        Some(_) => Err(ConfigError::InvalidNode {
            tag: name,
            message: format!("`{field}` expects a `!runners.*` tag"),
        }),
        None => Err(unknown(name)),
    }
}

fn plain_mapping(
    field: &str,
    value: &Value,
    ctx: &ResolutionContext,
) -> Result<Mapping, ConfigError> {
    match plain(field, value, ctx)? {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(mapping) => Ok(mapping),
        other => Err(invalid(
            field,
            &format!("expected a mapping, found {}", kind_of(&other)),
        )),
    }
}

/// Resolves `!ENV` / `!host` nodes anywhere inside `value`.
///
/// Strings outside those tags are left as written so runner options can be
/// interpolated per run.
pub(super) fn plain(
    field: &str,
    value: &Value,
    ctx: &ResolutionContext,
) -> Result<Value, ConfigError> {
    match value {
        Value::Tagged(tagged) => {
            let name = tag_name(tagged);
            match registry::lookup(&name) {
                Some(TagKind::Mapping) => {
                    let inner = plain(field, &tagged.value, ctx)?;
                    Ok(ctx.render_value(field, &inner)?)
                }
                Some(TagKind::Mount(_)) => Err(ConfigError::InvalidNode {
                    tag: name,
                    message: format!("mounts belong in a `mounts` list, not `{field}`"),
                }),
                Some(TagKind::Runner(_)) => Err(ConfigError::InvalidNode {
                    tag: name,
                    message: format!("runners belong under `runner`, not `{field}`"),
                }),
                None => Err(unknown(name)),
            }
        }
        Value::Sequence(items) => items
            .iter()
            .map(|item| plain(field, item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Sequence),
        Value::Mapping(mapping) => {
            let mut resolved = Mapping::new();
            for (key, item) in mapping {
                resolved.insert(key.clone(), plain(field, item, ctx)?);
            }
            Ok(Value::Mapping(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn expect_mapping(field: &str, value: &Value) -> Result<Mapping, ConfigError> {
    match value {
        Value::Mapping(mapping) => Ok(mapping.clone()),
        Value::Null => Ok(Mapping::new()),
        other => Err(invalid(
            field,
            &format!("expected a mapping, found {}", kind_of(other)),
        )),
    }
}

fn tag_name(tagged: &TaggedValue) -> String {
    let raw = tagged.tag.to_string();
    raw.strip_prefix('!').unwrap_or(&raw).to_owned()
}

fn unknown(tag: String) -> ConfigError {
    ConfigError::UnknownTag {
        tag,
        known: registry::names().join(", "),
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidNode {
        tag: field.to_owned(),
        message: message.to_owned(),
    }
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
