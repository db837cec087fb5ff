use std::collections::{HashMap, HashSet};

use dataflow_core::{
    lookup_key, project_record, project_schema, projected_names, tokenize_path, value_at,
    Record, Schema,
};
use dataflow_storage::{values_equal, JoinSide, NativeJoin, NativeJoinType, Op, Where};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{BatchContext, Computation, NodeContext};
use crate::error::ComputeError;
use crate::validation::{evaluate_rules, fuzzy_match, Arity, FieldRule, ValidationResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    #[default]
    Inner,
    Left,
}

/// Join dependency 0 (left) with dependency 1 (right).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinConfig {
    #[serde(default)]
    pub join_type: JoinType,
    pub key1: String,
    pub key2: String,
    #[serde(default)]
    pub other_keys1: Vec<String>,
    #[serde(default)]
    pub other_keys2: Vec<String>,
    /// Left fields to keep. Empty keeps all.
    #[serde(default)]
    pub select_keys1: Vec<String>,
    #[serde(default)]
    pub select_keys2: Vec<String>,
    #[serde(default)]
    pub prefix1: String,
    #[serde(default)]
    pub prefix2: String,
}

fn has_key1(c: &JoinConfig) -> bool {
    !c.key1.trim().is_empty()
}

fn has_key2(c: &JoinConfig) -> bool {
    !c.key2.trim().is_empty()
}

const JOIN_RULES: &[FieldRule<JoinConfig>] = &[
    FieldRule {
        path: "key1",
        message: "key1 is required",
        check: has_key1,
    },
    FieldRule {
        path: "key2",
        message: "key2 is required",
        check: has_key2,
    },
];

impl JoinConfig {
    /// `(left, right)` key pairs; the first one is the primary pair.
    fn key_pairs(&self) -> Vec<(String, String)> {
        std::iter::once((self.key1.clone(), self.key2.clone()))
            .chain(
                self.other_keys1
                    .iter()
                    .cloned()
                    .zip(self.other_keys2.iter().cloned()),
            )
            .collect()
    }

    fn tokenized_pairs(&self) -> Result<Vec<(Vec<String>, Vec<String>)>, ComputeError> {
        self.key_pairs()
            .into_iter()
            .map(|(l, r)| -> Result<_, ComputeError> {
                Ok((tokenize_path(&l)?, tokenize_path(&r)?))
            })
            .collect()
    }
}

impl Computation for JoinConfig {
    fn arity(&self) -> Arity {
        Arity::exactly(2)
    }

    fn validate(&self, result: &mut ValidationResult) {
        evaluate_rules(self, JOIN_RULES, result);

        if self.other_keys1.len() != self.other_keys2.len() {
            result.error(
                "other_keys2",
                format!(
                    "other_keys1 has {} keys but other_keys2 has {}",
                    self.other_keys1.len(),
                    self.other_keys2.len()
                ),
            );
        }

        let paths = [("key1", &self.key1), ("key2", &self.key2)]
            .into_iter()
            .filter(|(_, p)| !p.trim().is_empty())
            .map(|(f, p)| (f, p.as_str()))
            .chain(self.other_keys1.iter().map(|p| ("other_keys1", p.as_str())))
            .chain(self.other_keys2.iter().map(|p| ("other_keys2", p.as_str())));
        for (field, path) in paths {
            if let Err(e) = tokenize_path(path) {
                result.error(field, e.to_string());
            }
        }
    }

    fn validate_against(
        &self,
        ctx: &NodeContext<'_>,
        result: &mut ValidationResult,
    ) -> Result<(), ComputeError> {
        let sides = [
            ("key1", &self.key1, ctx.dependency(0)?.schema()?),
            ("key2", &self.key2, ctx.dependency(1)?.schema()?),
        ];
        for (field, key, schema) in sides {
            if schema.is_empty() || key.trim().is_empty() {
                continue;
            }
            let root = key.split('.').next().unwrap_or(key);
            if schema.contains_key(key.as_str()) || schema.contains_key(root) {
                continue;
            }
            let candidates: Vec<&str> = schema.keys().map(String::as_str).collect();
            result.warn_with_suggestion(
                field,
                format!("'{key}' is not declared in the dependency schema"),
                fuzzy_match(key, &candidates),
            );
        }
        Ok(())
    }

    fn required_schema(&self, ctx: &NodeContext<'_>) -> Result<Schema, ComputeError> {
        let left = project_schema(&ctx.dependency(0)?.schema()?, &self.select_keys1, &self.prefix1);
        let mut schema =
            project_schema(&ctx.dependency(1)?.schema()?, &self.select_keys2, &self.prefix2);
        schema.extend(left);
        Ok(schema)
    }

    fn push_down(&self, ctx: &NodeContext<'_>) -> Result<Option<u64>, ComputeError> {
        let [left, right] = ctx.dependencies else {
            return Ok(None);
        };
        let shared = left.locator.same_store(&right.locator)
            && left.locator.same_store(&ctx.output.locator);
        if !shared {
            return Ok(None);
        }
        let backend_id = &left.locator.backend;
        if !ctx.scope.registry().get(backend_id)?.supports_push_down() {
            return Ok(None);
        }

        let join = NativeJoin {
            left: JoinSide {
                dataset: left.locator.clone(),
                fields: self.select_keys1.clone(),
                prefix: self.prefix1.clone(),
            },
            right: JoinSide {
                dataset: right.locator.clone(),
                fields: self.select_keys2.clone(),
                prefix: self.prefix2.clone(),
            },
            output: ctx.output.locator.clone(),
            join_type: match self.join_type {
                JoinType::Inner => NativeJoinType::Inner,
                JoinType::Left => NativeJoinType::Left,
            },
            keys: self.key_pairs(),
        };
        debug!(node = %ctx.node.name, backend = %backend_id, "pushing join down to backend");
        let written = ctx.scope.connection(backend_id)?.push_down_join(&join)?;
        Ok(Some(written))
    }

    fn compute_batch(
        &self,
        ctx: &BatchContext<'_>,
        query: &Where,
    ) -> Result<Vec<Record>, ComputeError> {
        let left_ds = ctx.dependency(0)?;
        let right_ds = ctx.dependency(1)?;
        let pairs = self.tokenized_pairs()?;
        let Some(((left_key, right_key), secondary)) = pairs.split_first() else {
            return Ok(Vec::new());
        };

        let left_rows = left_ds.all(query, None, 0)?;

        let mut seen = HashSet::new();
        let key_values: Vec<Value> = left_rows
            .iter()
            .filter_map(|r| value_at(r, left_key))
            .filter(|v| !v.is_null() && seen.insert(lookup_key(v)))
            .cloned()
            .collect();
        let right_rows = if key_values.is_empty() {
            Vec::new()
        } else {
            let fetch = Where::new().and(self.key2.clone(), Op::In, Value::Array(key_values));
            right_ds.all(&fetch, None, 0)?
        };

        let mut lookup: HashMap<String, Vec<&Record>> = HashMap::new();
        for row in &right_rows {
            if let Some(v) = value_at(row, right_key) {
                lookup.entry(lookup_key(v)).or_default().push(row);
            }
        }
        let null_fields =
            projected_names(&right_ds.schema()?, &self.select_keys2, &self.prefix2);

        let mut output = Vec::with_capacity(left_rows.len());
        for left in &left_rows {
            let matched = value_at(left, left_key)
                .and_then(|v| lookup.get(&lookup_key(v)))
                .and_then(|candidates| {
                    candidates.iter().copied().find(|right| {
                        secondary.iter().all(|(lk, rk)| {
                            match (value_at(left, lk), value_at(right, rk)) {
                                (Some(a), Some(b)) => values_equal(a, b),
                                _ => false,
                            }
                        })
                    })
                });

            let mut row = match (matched, self.join_type) {
                (Some(right), _) => project_record(right, &self.select_keys2, &self.prefix2),
                (None, JoinType::Inner) => continue,
                (None, JoinType::Left) => null_fields
                    .iter()
                    .map(|name| (name.clone(), Value::Null))
                    .collect(),
            };
            row.extend(project_record(left, &self.select_keys1, &self.prefix1));
            output.push(row);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_secondary_keys_are_an_error() {
        let config = JoinConfig {
            key1: "id".into(),
            key2: "user_id".into(),
            other_keys1: vec!["region".into()],
            ..JoinConfig::default()
        };
        let mut result = ValidationResult::new();
        config.validate(&mut result);
        assert_eq!(result.errors_at("other_keys2").count(), 1);
    }

    #[test]
    fn missing_keys_and_bad_paths_accumulate() {
        let config = JoinConfig {
            key1: "".into(),
            key2: "a..b".into(),
            ..JoinConfig::default()
        };
        let mut result = ValidationResult::new();
        config.validate(&mut result);
        assert_eq!(result.errors_at("key1").count(), 1);
        assert_eq!(result.errors_at("key2").count(), 1);
    }

    #[test]
    fn deserialises_with_defaults() {
        let config: JoinConfig =
            serde_yaml::from_str("key1: id\nkey2: user_id\njoin_type: left\n").unwrap();
        assert_eq!(config.join_type, JoinType::Left);
        assert!(config.select_keys1.is_empty());
        assert_eq!(config.key_pairs(), vec![("id".to_string(), "user_id".to_string())]);
    }
}
