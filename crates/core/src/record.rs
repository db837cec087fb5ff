//! Record, schema and field-path primitives shared by every crate.
//!
//! Records are flat-or-nested JSON objects. Every stored record carries a
//! monotonic surrogate key under [`SYSTEM_ID`], assigned by the backend on
//! insert.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// A single dataset row.
pub type Record = Map<String, Value>;

/// Name of the monotonic surrogate key assigned by backends.
pub const SYSTEM_ID: &str = "_id";

/// Semantic type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Numeric,
    Boolean,
    Datetime,
    Object,
    Array,
}

impl FieldType {
    /// Best-effort type of a JSON value. `Null` carries no type.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(FieldType::Boolean),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(FieldType::Integer),
            Value::Number(_) => Some(FieldType::Numeric),
            Value::String(_) => Some(FieldType::String),
            Value::Array(_) => Some(FieldType::Array),
            Value::Object(_) => Some(FieldType::Object),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Numeric => "numeric",
            FieldType::Boolean => "boolean",
            FieldType::Datetime => "datetime",
            FieldType::Object => "object",
            FieldType::Array => "array",
        };
        f.write_str(s)
    }
}

/// Declared dataset schema, field name to semantic type, in declaration order.
pub type Schema = IndexMap<String, FieldType>;

/// Merge `required` into `schema` without removing or retyping existing fields.
///
/// Returns the names of the fields that were added.
pub fn widen_schema(schema: &mut Schema, required: &Schema) -> Vec<String> {
    let mut added = Vec::new();
    for (field, ty) in required {
        if !schema.contains_key(field) {
            schema.insert(field.clone(), *ty);
            added.push(field.clone());
        }
    }
    added
}

/// Split a dotted field path (`"address.city"`) into tokens.
pub fn tokenize_path(path: &str) -> Result<Vec<String>, CoreError> {
    if path.is_empty() {
        return Err(CoreError::EmptyPath);
    }
    if path.split('.').any(str::is_empty) {
        return Err(CoreError::EmptySegment {
            path: path.to_string(),
        });
    }
    Ok(path.split('.').map(str::to_string).collect())
}

/// Look up a value through nested objects. Missing segments yield `None`.
pub fn value_at<'a, S: AsRef<str>>(record: &'a Record, tokens: &[S]) -> Option<&'a Value> {
    let (first, rest) = tokens.split_first()?;
    let mut current = record.get(first.as_ref())?;
    for token in rest {
        current = current.as_object()?.get(token.as_ref())?;
    }
    Some(current)
}

/// Convenience wrapper around [`value_at`] for a dotted path.
pub fn value_at_path<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let tokens: Vec<&str> = path.split('.').collect();
    value_at(record, &tokens)
}

/// Hashable identity of a JSON value, used to key join lookups and unique
/// indexes.
///
/// Two values get the same key exactly when predicates treat them as equal:
/// integral floats collapse onto the integer they represent, so `1` and
/// `1.0` share a key.
pub fn lookup_key(value: &Value) -> String {
    match value {
        Value::Number(n) if n.as_i64().is_none() && n.as_u64().is_none() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => (f as i64).to_string(),
            _ => value.to_string(),
        },
        _ => value.to_string(),
    }
}

/// Keep `fields` of `record` (every top-level field but the surrogate key
/// when `fields` is empty), renaming each to `prefix + field`.
///
/// Missing paths are skipped rather than written as `null`.
pub fn project_record(record: &Record, fields: &[String], prefix: &str) -> Record {
    let mut out = Record::new();
    if fields.is_empty() {
        for (key, value) in record {
            if key != SYSTEM_ID {
                out.insert(format!("{prefix}{key}"), value.clone());
            }
        }
        return out;
    }
    for field in fields.iter().filter(|f| f.as_str() != SYSTEM_ID) {
        if let Some(value) = value_at_path(record, field) {
            out.insert(format!("{prefix}{field}"), value.clone());
        }
    }
    out
}

/// Schema counterpart of [`project_record`]. Selected fields absent from
/// `schema` are left out.
pub fn project_schema(schema: &Schema, fields: &[String], prefix: &str) -> Schema {
    if fields.is_empty() {
        return schema
            .iter()
            .filter(|(key, _)| key.as_str() != SYSTEM_ID)
            .map(|(key, ty)| (format!("{prefix}{key}"), *ty))
            .collect();
    }
    fields
        .iter()
        .filter(|f| f.as_str() != SYSTEM_ID)
        .filter_map(|f| schema.get(f).map(|ty| (format!("{prefix}{f}"), *ty)))
        .collect()
}

/// Output names [`project_record`] can produce for records of `schema`.
pub fn projected_names(schema: &Schema, fields: &[String], prefix: &str) -> Vec<String> {
    let source: Vec<&String> = if fields.is_empty() {
        schema.keys().collect()
    } else {
        fields.iter().collect()
    };
    source
        .into_iter()
        .filter(|f| f.as_str() != SYSTEM_ID)
        .map(|f| format!("{prefix}{f}"))
        .collect()
}
