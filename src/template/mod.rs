//! Typed resolution context and string-template interpolation.
//!
//! Templates use `{name}` placeholders with dotted paths (`{env.HOME}`), list
//! indexing (`{mounts[0].host_path}`), optional format specs
//! (`{now:%Y-%m-%d}`, `{run.count:03}`), and `{{` / `}}` for literal braces.
//! Rendering either succeeds or names the missing key together with every
//! top-level key the context offers.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use serde_yaml::Value;
use thiserror::Error;

mod path;

use path::{Segment, parse_path};

/// Default rendering of clock values when no format spec is supplied.
pub const DEFAULT_CLOCK_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Errors raised while rendering a template.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TemplateError {
    /// Raised when a placeholder names a key absent from the context.
    #[error(
        "field `{field}` references missing key `{key}`; available keys: {}",
        .available.join(", ")
    )]
    MissingKey {
        /// Configuration field whose template failed.
        field: String,
        /// Placeholder path that could not be resolved.
        key: String,
        /// Sorted top-level keys of the context.
        available: Vec<String>,
    },
    /// Raised when a `{` has no matching `}` or a lone `}` appears.
    #[error("field `{field}` has an unbalanced brace in `{template}`")]
    Unterminated {
        /// Configuration field whose template failed.
        field: String,
        /// Offending template text.
        template: String,
    },
    /// Raised when a format spec does not apply to the referenced value.
    #[error("field `{field}` uses unsupported format `{spec}` for `{key}`")]
    InvalidFormat {
        /// Configuration field whose template failed.
        field: String,
        /// Placeholder path.
        key: String,
        /// Format spec supplied after the colon.
        spec: String,
    },
    /// Raised when a placeholder resolves to a mapping or a list.
    #[error("field `{field}` references `{key}`, which is not a scalar value")]
    NotScalar {
        /// Configuration field whose template failed.
        field: String,
        /// Placeholder path.
        key: String,
    },
}

/// Source of a clock value in the context.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClockSource {
    /// Snapshot taken once and reused for every render.
    Cached(DateTime<Local>),
    /// Sampled from the wall clock on every render.
    Fresh,
}

impl ClockSource {
    fn sample(&self) -> DateTime<Local> {
        match self {
            Self::Cached(at) => *at,
            Self::Fresh => Local::now(),
        }
    }
}

/// Value stored in a [`ResolutionContext`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ContextValue {
    /// Plain text.
    Text(String),
    /// Signed integer, formatted with optional zero padding.
    Integer(i64),
    /// Boolean flag.
    Bool(bool),
    /// Timestamp formatted with `strftime` specs.
    Clock(ClockSource),
    /// Nested names reachable with dotted paths.
    Map(BTreeMap<String, ContextValue>),
    /// Ordered values reachable with `[n]` indexing.
    List(Vec<ContextValue>),
}

impl ContextValue {
    /// Builds a text value.
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Builds a nested map from `(name, value)` pairs.
    #[must_use]
    pub fn map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Self)>,
        K: Into<String>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    /// Converts a YAML value into a context value.
    #[must_use]
    pub fn from_yaml(value: &Value) -> Self {
        match value {
            Value::Null => Self::Text(String::new()),
            Value::Bool(flag) => Self::Bool(*flag),
            Value::Number(number) => number
                .as_i64()
                .map_or_else(|| Self::Text(number.to_string()), Self::Integer),
            Value::String(text) => Self::Text(text.clone()),
            Value::Sequence(items) => Self::List(items.iter().map(Self::from_yaml).collect()),
            Value::Mapping(mapping) => Self::Map(
                mapping
                    .iter()
                    .filter_map(|(key, item)| {
                        yaml_key(key).map(|name| (name, Self::from_yaml(item)))
                    })
                    .collect(),
            ),
            Value::Tagged(tagged) => Self::from_yaml(&tagged.value),
        }
    }

    fn child(&self, segment: &Segment) -> Option<&Self> {
        match (self, segment) {
            (Self::Map(entries), Segment::Key(key)) => entries.get(key),
            (Self::List(items), Segment::Index(index)) => items.get(*index),
            _ => None,
        }
    }
}

/// Returns the string form of a scalar YAML mapping key.
#[must_use]
pub fn yaml_key(key: &Value) -> Option<String> {
    match key {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Mapping from names to values used to interpolate templates.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResolutionContext {
    values: BTreeMap<String, ContextValue>,
}

impl ResolutionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a top-level name, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: ContextValue) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Adds every entry of `extensions` at the top level, replacing clashes.
    #[must_use]
    pub fn extended(mut self, extensions: &BTreeMap<String, Value>) -> Self {
        for (key, value) in extensions {
            self.values
                .insert(key.clone(), ContextValue::from_yaml(value));
        }
        self
    }

    /// Returns the sorted top-level names.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    /// Resolves a placeholder path such as `mounts[0].host_path`.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&ContextValue> {
        let segments = parse_path(path)?;
        let mut segments_iter = segments.iter();
        let Some(Segment::Key(root)) = segments_iter.next() else {
            return None;
        };
        let mut current = self.values.get(root)?;
        for segment in segments_iter {
            current = current.child(segment)?;
        }
        Some(current)
    }

    /// Renders `template`, attributing failures to `field`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] when a placeholder is missing, unbalanced,
    /// not a scalar, or carries a format spec that does not apply.
    pub fn render(&self, field: &str, template: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut placeholder = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        placeholder.push(inner);
                    }
                    if !closed {
                        return Err(unbalanced(field, template));
                    }
                    self.render_placeholder(field, &placeholder, &mut out)?;
                }
                '}' => return Err(unbalanced(field, template)),
                other => out.push(other),
            }
        }

        Ok(out)
    }

    /// Renders every string inside `value`, leaving other scalars untouched.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] from the first string that fails to render.
    pub fn render_value(&self, field: &str, value: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::String(text) => self.render(field, text).map(Value::String),
            Value::Sequence(items) => items
                .iter()
                .map(|item| self.render_value(field, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Sequence),
            Value::Mapping(mapping) => {
                let mut rendered = serde_yaml::Mapping::new();
                for (key, item) in mapping {
                    let nested = yaml_key(key).map_or_else(
                        || field.to_owned(),
                        |name| format!("{field}.{name}"),
                    );
                    rendered.insert(key.clone(), self.render_value(&nested, item)?);
                }
                Ok(Value::Mapping(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    fn render_placeholder(
        &self,
        field: &str,
        placeholder: &str,
        out: &mut String,
    ) -> Result<(), TemplateError> {
        let (raw_key, spec) = placeholder
            .split_once(':')
            .map_or((placeholder, None), |(name, format)| (name, Some(format)));
        let key = raw_key.trim();
        let value = self.lookup(key).ok_or_else(|| TemplateError::MissingKey {
            field: field.to_owned(),
            key: key.to_owned(),
            available: self.keys(),
        })?;

        let invalid_format = |spec: &str| TemplateError::InvalidFormat {
            field: field.to_owned(),
            key: key.to_owned(),
            spec: spec.to_owned(),
        };

        match (value, spec) {
            (ContextValue::Text(text), None | Some("")) => out.push_str(text),
            (ContextValue::Bool(flag), None | Some("")) => {
                out.push_str(if *flag { "true" } else { "false" });
            }
            (ContextValue::Integer(number), None) => {
                write!(out, "{number}").map_err(|_| invalid_format(""))?;
            }
            (ContextValue::Integer(number), Some(spec)) => {
                let width = parse_integer_spec(spec).ok_or_else(|| invalid_format(spec))?;
                write!(out, "{number:0width$}").map_err(|_| invalid_format(spec))?;
            }
            (ContextValue::Clock(source), spec) => {
                let format = spec.unwrap_or(DEFAULT_CLOCK_FORMAT);
                if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
                    return Err(invalid_format(format));
                }
                write!(out, "{}", source.sample().format(format))
                    .map_err(|_| invalid_format(format))?;
            }
            (ContextValue::Map(_) | ContextValue::List(_), _) => {
                return Err(TemplateError::NotScalar {
                    field: field.to_owned(),
                    key: key.to_owned(),
                });
            }
            (ContextValue::Text(_) | ContextValue::Bool(_), Some(spec)) => {
                return Err(invalid_format(spec));
            }
        }
        Ok(())
    }
}

fn unbalanced(field: &str, template: &str) -> TemplateError {
    TemplateError::Unterminated {
        field: field.to_owned(),
        template: template.to_owned(),
    }
}

/// Parses `03`, `3d`, or `03d` into a zero-padded width.
fn parse_integer_spec(spec: &str) -> Option<usize> {
    let digits = spec.strip_suffix('d').unwrap_or(spec);
    if digits.is_empty() {
        return Some(0);
    }
    digits.parse().ok()
}
