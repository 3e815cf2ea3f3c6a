//! Input and output processing for state data flow.
//!
//! Every state threads its data through the same four transforms:
//! `InputPath` → `Parameters` → (work) → `ResultPath` → `OutputPath`.
//! All of them are pure functions over `serde_json::Value`.
//!
//! # Path Syntax
//!
//! - `$`: the whole value
//! - `$.field.nested`: object member access via dot notation
//! - `$.items[0].name`: array index access
//! - `$['key with spaces']`: bracketed member access
//!
//! Wildcards, recursive descent, filters and `$$` context paths are rejected.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// The root path, selecting the whole value.
pub const ROOT: &str = "$";

/// Most `null` slots a `ResultPath` write may add to reach an array index.
pub const MAX_ARRAY_PADDING: usize = 1024;

/// Key suffix marking a `Parameters` entry whose value is a path.
const PARAMETER_PATH_SUFFIX: &str = ".$";

/// Errors produced while parsing or applying a path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// The path expression is malformed or uses unsupported syntax.
    #[error("invalid path '{path}': {reason}")]
    Syntax { path: String, reason: String },

    /// The path is well-formed but selects nothing.
    #[error("path '{path}' does not match any value")]
    NoMatch { path: String },

    /// A write would have to descend through a scalar value.
    #[error("cannot write path '{path}': segment '{segment}' is not inside an object or array")]
    NotAContainer { path: String, segment: String },

    /// A `.$` parameter carries something other than a path string.
    #[error("parameter '{key}' must be a path string")]
    InvalidParameter { key: String },

    /// A write would pad an array past [`MAX_ARRAY_PADDING`] `null`s.
    #[error("cannot write path '{path}': index {index} is too far past the end of an array of length {len}")]
    IndexOutOfRange { path: String, index: usize, len: usize },
}

// ---------------------------------------------------------------------------
// Path fields
// ---------------------------------------------------------------------------

/// A path-valued state field.
///
/// The language gives an omitted field and an explicit `null` different
/// meanings, so the two are kept apart here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PathSpec {
    /// Field not present; behaves as `$`.
    #[default]
    Omitted,
    /// Field explicitly set to `null`.
    Null,
    /// Field set to a path expression.
    Path(String),
}

impl PathSpec {
    /// Build a spec from a path string.
    pub fn path(path: impl Into<String>) -> Self {
        PathSpec::Path(path.into())
    }

    /// Returns true when the field was not present in the definition.
    pub fn is_omitted(&self) -> bool {
        matches!(self, PathSpec::Omitted)
    }

    /// The path to evaluate, with omission resolved to `$`.
    ///
    /// Returns `None` for an explicit `null`.
    pub fn effective(&self) -> Option<&str> {
        match self {
            PathSpec::Omitted => Some(ROOT),
            PathSpec::Null => None,
            PathSpec::Path(path) => Some(path.as_str()),
        }
    }
}

impl fmt::Display for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSpec::Omitted => write!(f, "{ROOT}"),
            PathSpec::Null => write!(f, "null"),
            PathSpec::Path(path) => write!(f, "{path}"),
        }
    }
}

impl<'de> Deserialize<'de> for PathSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Only reached when the field is present; omission is `Default`.
        Ok(match Option::<String>::deserialize(deserializer)? {
            Some(path) => PathSpec::Path(path),
            None => PathSpec::Null,
        })
    }
}

impl Serialize for PathSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PathSpec::Omitted => serializer.serialize_str(ROOT),
            PathSpec::Null => serializer.serialize_none(),
            PathSpec::Path(path) => serializer.serialize_str(path),
        }
    }
}

// ---------------------------------------------------------------------------
// Path parsing and navigation
// ---------------------------------------------------------------------------

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object member.
    Key(String),
    /// Array element.
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(key) => write!(f, "{key}"),
            Segment::Index(index) => write!(f, "[{index}]"),
        }
    }
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Parse a path expression.
    ///
    /// `"$.items[0]['display name']"` → `[Key("items"), Index(0), Key("display name")]`
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let syntax = |reason: &str| PathError::Syntax {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let mut rest = path
            .trim()
            .strip_prefix('$')
            .ok_or_else(|| syntax("must start with '$'"))?;
        let mut segments = Vec::new();

        while !rest.is_empty() {
            if let Some(member) = rest.strip_prefix('.') {
                if member.starts_with('.') {
                    return Err(syntax("recursive descent is not supported"));
                }
                let end = member
                    .find(|c: char| c == '.' || c == '[')
                    .unwrap_or(member.len());
                let name = &member[..end];
                if name.is_empty() {
                    return Err(syntax("empty member name"));
                }
                if name == "*" {
                    return Err(syntax("wildcards are not supported"));
                }
                segments.push(Segment::Key(name.to_string()));
                rest = &member[end..];
            } else if let Some(bracketed) = rest.strip_prefix('[') {
                let end = bracketed.find(']').ok_or_else(|| syntax("unclosed '['"))?;
                let segment = parse_bracket(bracketed[..end].trim())
                    .ok_or_else(|| syntax("only indexes and quoted names are allowed in brackets"))?;
                segments.push(segment);
                rest = &bracketed[end + 1..];
            } else {
                return Err(syntax("expected '.' or '[' after a segment"));
            }
        }

        Ok(Self {
            raw: path.to_string(),
            segments,
        })
    }

    /// The original expression.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parsed segments, root excluded.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns true for `$`.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Select the value at this path, if any.
    pub fn select<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(value, |current, segment| match segment {
                Segment::Key(key) => current.get(key.as_str()),
                Segment::Index(index) => current.get(*index),
            })
    }

    /// Write `value` at this path, creating intermediate containers.
    ///
    /// Missing or `null` intermediates become objects, or arrays when the
    /// following segment is an index. Arrays are padded with `null`, at most
    /// [`MAX_ARRAY_PADDING`] slots per write.
    pub fn set(&self, target: &mut Value, value: Value) -> Result<(), PathError> {
        let Some((first, _)) = self.segments.split_first() else {
            *target = value;
            return Ok(());
        };
        if target.is_null() {
            *target = empty_container(first);
        }

        let mut current = target;
        for (position, segment) in self.segments.iter().enumerate() {
            let slot = self.child_mut(current, segment)?;
            match self.segments.get(position + 1) {
                Some(next) => {
                    if slot.is_null() {
                        *slot = empty_container(next);
                    }
                    current = slot;
                }
                None => {
                    *slot = value;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn child_mut<'a>(
        &self,
        current: &'a mut Value,
        segment: &Segment,
    ) -> Result<&'a mut Value, PathError> {
        match (current, segment) {
            (Value::Object(map), Segment::Key(key)) => {
                Ok(map.entry(key.clone()).or_insert(Value::Null))
            }
            (Value::Object(map), Segment::Index(index)) => {
                Ok(map.entry(index.to_string()).or_insert(Value::Null))
            }
            (Value::Array(items), Segment::Index(index)) => {
                let index = *index;
                if index >= items.len() {
                    if index - items.len() > MAX_ARRAY_PADDING {
                        return Err(PathError::IndexOutOfRange {
                            path: self.raw.clone(),
                            index,
                            len: items.len(),
                        });
                    }
                    items.resize(index + 1, Value::Null);
                }
                Ok(&mut items[index])
            }
            (_, segment) => Err(PathError::NotAContainer {
                path: self.raw.clone(),
                segment: segment.to_string(),
            }),
        }
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Parse the inside of `[...]`: a quoted member name or an array index.
fn parse_bracket(inner: &str) -> Option<Segment> {
    let quoted = inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
    match quoted {
        Some(name) => Some(Segment::Key(name.to_string())),
        None => inner.parse::<usize>().ok().map(Segment::Index),
    }
}

fn empty_container(segment: &Segment) -> Value {
    match segment {
        Segment::Key(_) => Value::Object(Map::new()),
        Segment::Index(_) => Value::Array(Vec::new()),
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Parse `path` and select from `value`, failing when nothing matches.
pub fn select_required(value: &Value, path: &str) -> Result<Value, PathError> {
    JsonPath::parse(path)?
        .select(value)
        .cloned()
        .ok_or_else(|| PathError::NoMatch {
            path: path.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// Select the portion of the state input that the state's work receives.
///
/// - `null` → `{}` (the work receives no data)
/// - omitted → the whole input
/// - a path → the matched value; no match is an error
///
/// A `null` input is treated as `{}`.
pub fn apply_input_path(input: &Value, input_path: &PathSpec) -> Result<Value, PathError> {
    let Some(path) = input_path.effective() else {
        return Ok(empty_object());
    };
    if input.is_null() {
        return select_required(&empty_object(), path);
    }
    select_required(input, path)
}

/// Rebuild the effective input from a `Parameters` template.
///
/// Keys ending in `.$` bind the value selected by their path (with the
/// suffix stripped from the key). Nested objects are resolved recursively;
/// every other value is copied as-is.
pub fn apply_parameters(input: Value, parameters: Option<&Value>) -> Result<Value, PathError> {
    match parameters {
        None => Ok(input),
        Some(template) => resolve_parameters(&input, template),
    }
}

fn resolve_parameters(input: &Value, template: &Value) -> Result<Value, PathError> {
    let Value::Object(fields) = template else {
        return Ok(template.clone());
    };

    let mut resolved = Map::new();
    for (key, value) in fields {
        if let Some(name) = key.strip_suffix(PARAMETER_PATH_SUFFIX) {
            let path = value.as_str().ok_or_else(|| PathError::InvalidParameter {
                key: key.clone(),
            })?;
            resolved.insert(name.to_string(), select_required(input, path)?);
        } else if value.is_object() {
            resolved.insert(key.clone(), resolve_parameters(input, value)?);
        } else {
            resolved.insert(key.clone(), value.clone());
        }
    }
    Ok(Value::Object(resolved))
}

/// Weave a state's result into its original input.
///
/// - omitted or `$` → the result replaces the input
/// - `null` → the result is discarded and the input passes through
/// - a path → the result is written at that location in the input
pub fn apply_result_path(
    input: Value,
    result_path: &PathSpec,
    result: Value,
) -> Result<Value, PathError> {
    let path = match result_path {
        PathSpec::Omitted => return Ok(result),
        PathSpec::Null => return Ok(input),
        PathSpec::Path(path) => JsonPath::parse(path)?,
    };
    if path.is_root() {
        return Ok(result);
    }

    let mut merged = input;
    path.set(&mut merged, result)?;
    Ok(merged)
}

/// Select the portion of the processed data that becomes the state output.
///
/// - `null` → `{}`
/// - omitted → the whole value
/// - a path → the matched value
///
/// A selection that is absent or falsy (`null`, `false`, `0`, `""`) is a
/// `NoMatch` error, whether it came from `$` or a longer path.
pub fn apply_output_path(data: Value, output_path: &PathSpec) -> Result<Value, PathError> {
    let Some(path) = output_path.effective() else {
        return Ok(empty_object());
    };
    let parsed = JsonPath::parse(path)?;
    let selected = if parsed.is_root() {
        Some(data)
    } else {
        parsed.select(&data).cloned()
    };
    match selected {
        Some(value) if !is_falsy(&value) => Ok(value),
        _ => Err(PathError::NoMatch {
            path: path.to_string(),
        }),
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}
