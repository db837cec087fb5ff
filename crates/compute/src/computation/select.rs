use dataflow_core::{project_record, project_schema, tokenize_path, Record, Schema};
use dataflow_storage::Where;
use serde::{Deserialize, Serialize};

use super::{BatchContext, Computation, NodeContext};
use crate::error::ComputeError;
use crate::validation::{evaluate_rules, Arity, FieldRule, ValidationResult};

/// Copy a projection of the single dependency. Nested paths are written
/// under their dotted name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectConfig {
    pub keys: Vec<String>,
}

fn has_keys(c: &SelectConfig) -> bool {
    !c.keys.is_empty()
}

const SELECT_RULES: &[FieldRule<SelectConfig>] = &[FieldRule {
    path: "keys",
    message: "at least one key must be selected",
    check: has_keys,
}];

impl Computation for SelectConfig {
    fn arity(&self) -> Arity {
        Arity::exactly(1)
    }

    fn validate(&self, result: &mut ValidationResult) {
        evaluate_rules(self, SELECT_RULES, result);
        for key in &self.keys {
            if let Err(e) = tokenize_path(key) {
                result.error("keys", e.to_string());
            }
        }
    }

    fn required_schema(&self, ctx: &NodeContext<'_>) -> Result<Schema, ComputeError> {
        Ok(project_schema(&ctx.dependency(0)?.schema()?, &self.keys, ""))
    }

    fn compute_batch(
        &self,
        ctx: &BatchContext<'_>,
        query: &Where,
    ) -> Result<Vec<Record>, ComputeError> {
        Ok(ctx
            .dependency(0)?
            .all(query, None, 0)?
            .iter()
            .map(|r| project_record(r, &self.keys, ""))
            .collect())
    }
}
