//! Data-model paths: `person.addresses[2].zip`.
//!
//! Paths are parsed with `winnow` into segments and used to read, write and
//! delete leaves in the dynamically-shaped form data (`serde_json::Value`).
//! Readers are lenient: a malformed path or a shape mismatch reads as `None`.

use serde_json::{Map, Value};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use winnow::ascii::dec_uint;
use winnow::combinator::{delimited, repeat, separated};
use winnow::prelude::*;
use winnow::token::take_while;

/// Prefix for paths relative to the innermost repeating-group row.
pub const CURRENT_ROW: &str = "currentRow";

/// How far past the end of a list a write may reach. The gap is padded
/// with `null`.
pub const MAX_INDEX_GAP: usize = 1_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Malformed data model path '{path}': {message}")]
    Malformed { path: String, message: String },
    #[error("Index {index} in '{path}' is too far past the end of a list of {len}")]
    IndexOutOfRange { path: String, index: usize, len: usize },
    #[error("Cannot write at data model path '{path}'")]
    Unwritable { path: String },
}

/// A single step into the form data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed data-model path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataPath {
    segments: SmallVec<[PathSegment; 4]>,
}

impl DataPath {
    /// Parse a dot/bracket path. Empty keys and unterminated brackets are rejected.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let parsed = parse_path.parse(path).map_err(|e| PathError::Malformed {
            path: path.to_string(),
            message: e.to_string(),
        })?;

        let mut segments = SmallVec::new();
        for (key, indices) in parsed {
            segments.push(PathSegment::Key(key.to_string()));
            segments.extend(indices.into_iter().map(PathSegment::Index));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Read the value at this path.
    pub fn pick<'a>(&self, data: &'a Value) -> Option<&'a Value> {
        let mut current = data;
        for seg in &self.segments {
            current = match (seg, current) {
                (PathSegment::Key(k), Value::Object(map)) => map.get(k)?,
                (PathSegment::Index(i), Value::Array(items)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Write `value` at this path, creating intermediate objects and arrays.
    /// Arrays are padded with `null` up to the target index.
    ///
    /// An index more than [`MAX_INDEX_GAP`] past the end of its list is
    /// refused before anything is written.
    pub fn set(&self, data: &mut Value, value: Value) -> Result<(), PathError> {
        self.check_indices(data)?;
        let slot = self.slot_mut(data).ok_or_else(|| PathError::Unwritable {
            path: self.to_string(),
        })?;
        *slot = value;
        Ok(())
    }

    fn check_indices(&self, data: &Value) -> Result<(), PathError> {
        let mut current = Some(data);
        for seg in &self.segments {
            current = match (seg, current) {
                (PathSegment::Key(k), Some(Value::Object(map))) => map.get(k),
                (PathSegment::Index(i), node) => {
                    let items = node.and_then(Value::as_array);
                    let len = items.map_or(0, Vec::len);
                    if len.checked_add(MAX_INDEX_GAP).is_none_or(|limit| *i > limit) {
                        return Err(PathError::IndexOutOfRange {
                            path: self.to_string(),
                            index: *i,
                            len,
                        });
                    }
                    items.and_then(|items| items.get(*i))
                }
                _ => None,
            };
        }
        Ok(())
    }

    fn slot_mut<'a>(&self, data: &'a mut Value) -> Option<&'a mut Value> {
        let mut current = data;
        for seg in &self.segments {
            current = match seg {
                PathSegment::Key(k) => {
                    if !current.is_object() {
                        *current = Value::Object(Map::new());
                    }
                    current.as_object_mut()?.entry(k.clone()).or_insert(Value::Null)
                }
                PathSegment::Index(i) => {
                    if !current.is_array() {
                        *current = Value::Array(Vec::new());
                    }
                    let items = current.as_array_mut()?;
                    if items.len() <= *i {
                        items.resize(i.checked_add(1)?, Value::Null);
                    }
                    items.get_mut(*i)?
                }
            };
        }
        Some(current)
    }

    /// Remove the value at this path. Array elements are spliced out.
    pub fn delete(&self, data: &mut Value) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut current = data;
        for seg in parents {
            current = match (seg, current) {
                (PathSegment::Key(k), Value::Object(map)) => map.get_mut(k)?,
                (PathSegment::Index(i), Value::Array(items)) => items.get_mut(*i)?,
                _ => return None,
            };
        }
        match (last, current) {
            (PathSegment::Key(k), Value::Object(map)) => map.remove(k),
            (PathSegment::Index(i), Value::Array(items)) if *i < items.len() => {
                Some(items.remove(*i))
            }
            _ => None,
        }
    }

    /// Mutable access to the array at this path, creating it when absent.
    /// Returns `None` if a non-array value already occupies the path.
    pub fn array_mut<'a>(&self, data: &'a mut Value) -> Option<&'a mut Vec<Value>> {
        if self.pick(data).is_none_or(Value::is_null) {
            self.set(data, Value::Array(Vec::new())).ok()?;
        }
        let mut current = data;
        for seg in &self.segments {
            current = match (seg, current) {
                (PathSegment::Key(k), Value::Object(map)) => map.get_mut(k)?,
                (PathSegment::Index(i), Value::Array(items)) => items.get_mut(*i)?,
                _ => return None,
            };
        }
        current.as_array_mut()
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                PathSegment::Key(k) if i == 0 => f.write_str(k)?,
                PathSegment::Key(k) => write!(f, ".{k}")?,
                PathSegment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

// ─── Lenient helpers ─────────────────────────────────────────────────────

/// Read the value at `path`, treating a malformed path as absent.
pub fn pick<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    DataPath::parse(path).ok()?.pick(data)
}

/// Render a leaf as a string. Objects, arrays, null and missing values
/// become the empty string.
pub fn leaf_to_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Flatten nested form data into a dot map of leaves:
/// `{a: {b: [1]}}` becomes `{"a.b[0]": 1}`.
pub fn flatten(data: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(data, String::new(), &mut out);
    out
}

fn flatten_into(value: &Value, prefix: String, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten_into(v, key, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(v, format!("{prefix}[{i}]"), out);
            }
        }
        leaf => {
            if !prefix.is_empty() {
                out.insert(prefix, leaf.clone());
            }
        }
    }
}

// ─── Row context ─────────────────────────────────────────────────────────

/// One level of repeating-group row context for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFrame {
    /// The group's binding as written in the layout (`items.sub`).
    pub template: String,
    /// The group's binding with outer row indices applied (`items[1].sub`).
    pub resolved: String,
    /// Row index within the group.
    pub index: usize,
}

impl RowFrame {
    /// The path to this row's object: `items[1].sub[0]`.
    pub fn row_path(&self) -> String {
        format!("{}[{}]", self.resolved, self.index)
    }
}

/// Rewrite a layout binding into the concrete path for a node's rows.
///
/// `items.name` inside row 1 of a group bound to `items` becomes
/// `items[1].name`. The innermost matching frame wins, since nested
/// group templates extend their parent's template. A `currentRow.` prefix
/// always targets the innermost row.
pub fn transpose(binding: &str, rows: &[RowFrame]) -> String {
    if let Some(frame) = rows.last()
        && let Some(rest) = binding.strip_prefix(CURRENT_ROW)
        && (rest.is_empty() || rest.starts_with('.'))
    {
        return format!("{}{rest}", frame.row_path());
    }

    for frame in rows.iter().rev() {
        if let Some(rest) = binding.strip_prefix(frame.template.as_str())
            && (rest.is_empty() || rest.starts_with('.'))
        {
            return format!("{}{rest}", frame.row_path());
        }
    }
    binding.to_string()
}

// ─── Low-level parsers ──────────────────────────────────────────────────

fn parse_key<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    take_while(1.., |c: char| c != '.' && c != '[' && c != ']').parse_next(input)
}

fn parse_index(input: &mut &str) -> ModalResult<usize> {
    delimited('[', dec_uint::<_, usize, _>, ']').parse_next(input)
}

fn parse_segment<'a>(input: &mut &'a str) -> ModalResult<(&'a str, Vec<usize>)> {
    (parse_key, repeat(0.., parse_index)).parse_next(input)
}

fn parse_path<'a>(input: &mut &'a str) -> ModalResult<Vec<(&'a str, Vec<usize>)>> {
    separated(1.., parse_segment, '.').parse_next(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parse_dots_and_brackets() {
        let path = DataPath::parse("person.addresses[2].zip").unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("person".into()),
                PathSegment::Key("addresses".into()),
                PathSegment::Index(2),
                PathSegment::Key("zip".into()),
            ]
        );
        assert_eq!(path.to_string(), "person.addresses[2].zip");
    }

    #[test]
    fn parse_rejects_malformed_paths() {
        assert!(DataPath::parse("").is_err());
        assert!(DataPath::parse("a..b").is_err());
        assert!(DataPath::parse("a[x]").is_err());
        assert!(DataPath::parse("a[1").is_err());
    }

    #[test]
    fn set_creates_intermediates() {
        let mut data = json!({});
        DataPath::parse("a.list[2].x").unwrap().set(&mut data, json!("v")).unwrap();
        assert_eq!(data, json!({"a": {"list": [null, null, {"x": "v"}]}}));
    }

    #[test]
    fn set_refuses_indices_far_past_the_end() {
        let mut data = json!({"a": [1]});
        for raw in ["a[18446744073709551615]", "a[4000000000]", "b.c[1002].d"] {
            let err = DataPath::parse(raw).unwrap().set(&mut data, json!("v")).unwrap_err();
            assert!(matches!(err, PathError::IndexOutOfRange { .. }), "{raw}: {err}");
        }
        assert_eq!(data, json!({"a": [1]}));

        DataPath::parse("a[1001]").unwrap().set(&mut data, json!("v")).unwrap();
        assert_eq!(data["a"].as_array().map(Vec::len), Some(1002));
        assert_eq!(data["a"][1001], json!("v"));
    }

    #[test]
    fn array_mut_refuses_far_index() {
        let mut data = json!({});
        let path = DataPath::parse("list[5000]").unwrap();
        assert_eq!(path.array_mut(&mut data), None);
        assert_eq!(data, json!({}));
    }

    #[test]
    fn pick_shape_mismatch_is_none() {
        let data = json!({"a": "str"});
        assert_eq!(pick(&data, "a.b"), None);
        assert_eq!(pick(&data, "a[0]"), None);
        assert_eq!(pick(&data, "not a [path"), None);
        assert_eq!(pick(&data, "a"), Some(&json!("str")));
    }

    #[test]
    fn delete_splices_array_elements() {
        let mut data = json!({"l": [1, 2, 3]});
        let removed = DataPath::parse("l[1]").unwrap().delete(&mut data);
        assert_eq!(removed, Some(json!(2)));
        assert_eq!(data, json!({"l": [1, 3]}));
    }

    #[test]
    fn leaf_strings() {
        assert_eq!(leaf_to_string(Some(&json!("x"))), "x");
        assert_eq!(leaf_to_string(Some(&json!(4.5))), "4.5");
        assert_eq!(leaf_to_string(Some(&json!(true))), "true");
        assert_eq!(leaf_to_string(Some(&json!({"a": 1}))), "");
        assert_eq!(leaf_to_string(None), "");
    }

    #[test]
    fn flatten_nested() {
        let data = json!({"a": {"b": 1, "c": [true, {"d": null}]}});
        let flat = flatten(&data);
        assert_eq!(flat.len(), 3);
        assert_eq!(flat["a.b"], json!(1));
        assert_eq!(flat["a.c[0]"], json!(true));
        assert_eq!(flat["a.c[1].d"], Value::Null);
    }

    #[test]
    fn transpose_nested_rows() {
        let outer = RowFrame {
            template: "items".into(),
            resolved: "items".into(),
            index: 1,
        };
        let inner = RowFrame {
            template: "items.sub".into(),
            resolved: "items[1].sub".into(),
            index: 0,
        };
        let rows = [outer, inner];
        assert_eq!(transpose("items.name", &rows), "items[1].name");
        assert_eq!(transpose("items.sub.x", &rows), "items[1].sub[0].x");
        assert_eq!(transpose("itemsOther.x", &rows), "itemsOther.x");
        assert_eq!(transpose("currentRow.x", &rows), "items[1].sub[0].x");
        assert_eq!(transpose("other", &[]), "other");
    }
}
