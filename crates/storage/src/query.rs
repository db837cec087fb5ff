//! Predicates over records and surrogate-key range partitioning.
//!
//! A [`Where`] is a conjunction of [`Condition`]s. Its JSON rendering
//! follows the `{field: {op: value}}` shape used in logs and CLI output,
//! e.g. `{"_id": {">=": 1, "<": 3}}`.

use std::cmp::Ordering;

use dataflow_core::{value_at, Record, SYSTEM_ID};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Comparison operator of a single condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "in")]
    In,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Lte => "<=",
            Op::Gt => ">",
            Op::Gte => ">=",
            Op::In => "in",
        }
    }
}

/// `field op value`. `field` may be a dotted path into nested objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        let tokens: Vec<&str> = self.field.split('.').collect();
        let actual = value_at(record, &tokens);
        match (self.op, actual) {
            (Op::Ne, None) => true,
            (_, None) => false,
            (Op::Eq, Some(v)) => values_equal(v, &self.value),
            (Op::Ne, Some(v)) => !values_equal(v, &self.value),
            (Op::In, Some(v)) => self
                .value
                .as_array()
                .map(|candidates| candidates.iter().any(|c| values_equal(v, c)))
                .unwrap_or(false),
            (op, Some(v)) => match compare_values(v, &self.value) {
                Some(ord) => match op {
                    Op::Lt => ord == Ordering::Less,
                    Op::Lte => ord != Ordering::Greater,
                    Op::Gt => ord == Ordering::Greater,
                    Op::Gte => ord != Ordering::Less,
                    _ => false,
                },
                None => false,
            },
        }
    }
}

/// Conjunction of conditions. An empty `Where` matches every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Where {
    conditions: Vec<Condition>,
}

impl Where {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition (builder style).
    pub fn and(mut self, field: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::new(field, op, value));
        self
    }

    /// Conjunction of `self` and `other`.
    pub fn merged(&self, other: &Where) -> Where {
        let mut conditions = self.conditions.clone();
        conditions.extend(other.conditions.iter().cloned());
        Where { conditions }
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }

    /// Render as `{field: {op: value, ...}, ...}`.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for c in &self.conditions {
            let entry = out
                .entry(c.field.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(ops) = entry {
                ops.insert(c.op.as_str().to_string(), c.value.clone());
            }
        }
        Value::Object(out)
    }
}

impl std::fmt::Display for Where {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Equality used by predicates: numbers compare numerically, everything
/// else structurally.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Ordering between two scalars of the same kind; `None` when incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Partition an ascending list of surrogate ids into range predicates of
/// `batch_size` ids each.
///
/// Boundaries are taken from the ids themselves, so gaps in the id space
/// never produce skipped or duplicated records. Every range is half-open
/// except the last, which closes on the maximum id. Each range is combined
/// with `filter` so it selects only records of the filtered set.
pub fn partition_system_ids(ids: &[i64], batch_size: usize, filter: &Where) -> Vec<Where> {
    if ids.is_empty() || batch_size == 0 {
        return Vec::new();
    }
    let count = ids.len().div_ceil(batch_size);
    let last_id = ids[ids.len() - 1];
    (0..count)
        .map(|i| {
            let from = ids[i * batch_size];
            let range = if i == count - 1 {
                Where::new()
                    .and(SYSTEM_ID, Op::Gte, from)
                    .and(SYSTEM_ID, Op::Lte, last_id)
            } else {
                Where::new()
                    .and(SYSTEM_ID, Op::Gte, from)
                    .and(SYSTEM_ID, Op::Lt, ids[(i + 1) * batch_size])
            };
            filter.merged(&range)
        })
        .collect()
}
