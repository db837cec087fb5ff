use dataflow_core::{project_record, project_schema, Record, Schema};
use dataflow_storage::Where;
use serde::{Deserialize, Serialize};

use super::{BatchContext, Computation, NodeContext};
use crate::error::ComputeError;
use crate::validation::{Arity, ValidationResult};

/// Copy the records of the single dependency that match `where`.
///
/// The predicate is handed to the batch planner, so batches only ever span
/// matching records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(rename = "where", default)]
    pub filter: Where,
}

impl Computation for FilterConfig {
    fn arity(&self) -> Arity {
        Arity::exactly(1)
    }

    fn validate(&self, result: &mut ValidationResult) {
        if self.filter.is_empty() {
            result.warn("where", "empty predicate copies every record");
        }
        for condition in self.filter.conditions() {
            if let Err(e) = dataflow_core::tokenize_path(&condition.field) {
                result.error("where", e.to_string());
            }
        }
    }

    fn required_schema(&self, ctx: &NodeContext<'_>) -> Result<Schema, ComputeError> {
        Ok(project_schema(&ctx.dependency(0)?.schema()?, &[], ""))
    }

    fn source_filter(&self) -> Where {
        self.filter.clone()
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
            .map(|r| project_record(r, &[], ""))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn where_clause_deserialises_from_yaml() {
        let config: FilterConfig = serde_yaml::from_str(
            "where:\n  - field: status\n    op: \"=\"\n    value: active\n",
        )
        .unwrap();
        assert_eq!(config.source_filter().conditions().len(), 1);

        let mut result = ValidationResult::new();
        config.validate(&mut result);
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }
}
