use std::collections::HashMap;

use dataflow_core::{lookup_key, project_record, projected_names, value_at_path, Record};
use serde_json::Value;

use crate::dataset::{DatasetKind, JoinSide, NativeJoin, NativeJoinType};
use crate::error::StorageError;
use crate::query::values_equal;

use super::table::Inner;

/// Native join: hash the right side on its primary key, probe with every
/// left record in surrogate-id order, write into the output's write dataset.
pub(super) fn execute(inner: &mut Inner, join: &NativeJoin) -> Result<u64, StorageError> {
    let ((left_key, right_key), secondary) = join
        .keys
        .split_first()
        .map(|(first, rest)| (first.clone(), rest))
        .ok_or_else(|| StorageError::Other("native join requires at least one key pair".into()))?;

    let left_rows = read_side(inner, &join.left)?;
    let right_rows = read_side(inner, &join.right)?;
    let right_schema = &inner
        .meta(&join.right.dataset.database, &join.right.dataset.name)?
        .schema;
    let null_fields = projected_names(right_schema, &join.right.fields, &join.right.prefix);

    let mut by_key: HashMap<String, Vec<&Record>> = HashMap::new();
    for row in &right_rows {
        if let Some(v) = value_at_path(row, &right_key) {
            by_key.entry(lookup_key(v)).or_default().push(row);
        }
    }

    let mut output = Vec::new();
    for left in &left_rows {
        let matched = value_at_path(left, &left_key)
            .and_then(|v| by_key.get(&lookup_key(v)))
            .and_then(|candidates| {
                candidates.iter().copied().find(|right| {
                    secondary.iter().all(|(lk, rk)| {
                        match (value_at_path(left, lk), value_at_path(right, rk)) {
                            (Some(a), Some(b)) => values_equal(a, b),
                            _ => false,
                        }
                    })
                })
            });

        let mut row = match matched {
            Some(right) => project_record(right, &join.right.fields, &join.right.prefix),
            None if join.join_type == NativeJoinType::Inner => continue,
            None => null_fields
                .iter()
                .map(|name| (name.clone(), Value::Null))
                .collect(),
        };
        row.extend(project_record(left, &join.left.fields, &join.left.prefix));
        output.push(row);
    }

    inner.append(&join.output.database, &join.output.name, output)
}

fn read_side(inner: &Inner, side: &JoinSide) -> Result<Vec<Record>, StorageError> {
    let (database, name) = (&side.dataset.database, &side.dataset.name);
    let physical = inner.physical(database, name, DatasetKind::Read)?;
    Ok(inner
        .table(database, &physical)
        .map(|t| t.records.values().cloned().collect())
        .unwrap_or_default())
}
