use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use dataflow_core::{lookup_key, value_at_path, widen_schema, Record, Schema, SYSTEM_ID};
use serde_json::Value;

use crate::dataset::{DatasetKind, IndexSpec};
use crate::error::StorageError;
use crate::query::Where;

/// Catalog entry of a logical dataset.
#[derive(Debug, Clone)]
pub(super) struct DatasetMeta {
    pub indexes: Vec<IndexSpec>,
    pub schema: Schema,
    pub double_buffering: bool,
    /// 1 or 2: which buffer readers see.
    pub read_idx: u8,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DatasetMeta {
    pub fn physical_name(&self, name: &str, kind: DatasetKind) -> String {
        if !self.double_buffering {
            return name.to_string();
        }
        let idx = match kind {
            DatasetKind::Read => self.read_idx,
            DatasetKind::Write => 3 - self.read_idx,
        };
        format!("{name}_buffer{idx}")
    }
}

/// One physical dataset.
#[derive(Debug, Clone, Default)]
pub(super) struct Table {
    pub records: BTreeMap<i64, Record>,
    pub next_id: i64,
    pub unique_indexes: Vec<Vec<String>>,
    pub non_unique_indexes: Vec<Vec<String>>,
}

impl Table {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    pub fn with_unique_indexes(indexes: &[IndexSpec]) -> Self {
        let mut table = Self::new();
        table.unique_indexes = unique_keys(indexes);
        table
    }

    pub fn select(&self, filter: &Where) -> impl Iterator<Item = (&i64, &Record)> {
        let filter = filter.clone();
        self.records.iter().filter(move |(_, r)| filter.matches(r))
    }

    /// Insert records, assigning fresh surrogate ids. All-or-nothing with
    /// respect to unique index violations.
    pub fn insert(&mut self, physical: &str, records: Vec<Record>) -> Result<u64, StorageError> {
        let mut seen: Vec<HashSet<String>> = self
            .unique_indexes
            .iter()
            .map(|keys| self.records.values().map(|r| index_key(r, keys)).collect())
            .collect();

        for record in &records {
            for (keys, existing) in self.unique_indexes.iter().zip(seen.iter_mut()) {
                let key = index_key(record, keys);
                if !existing.insert(key.clone()) {
                    return Err(StorageError::UniqueViolation {
                        dataset: physical.to_string(),
                        fields: keys.clone(),
                        value: key,
                    });
                }
            }
        }

        let count = records.len() as u64;
        for mut record in records {
            let id = self.next_id;
            self.next_id += 1;
            record.insert(SYSTEM_ID.to_string(), Value::from(id));
            self.records.insert(id, record);
        }
        Ok(count)
    }

    /// Install unique indexes, failing if current data already violates them.
    pub fn build_unique_indexes(
        &mut self,
        physical: &str,
        indexes: &[IndexSpec],
    ) -> Result<(), StorageError> {
        let keys = unique_keys(indexes);
        for fields in &keys {
            let mut seen = HashSet::new();
            for record in self.records.values() {
                let key = index_key(record, fields);
                if !seen.insert(key.clone()) {
                    return Err(StorageError::UniqueViolation {
                        dataset: physical.to_string(),
                        fields: fields.clone(),
                        value: key,
                    });
                }
            }
        }
        self.unique_indexes = keys;
        Ok(())
    }
}

fn unique_keys(indexes: &[IndexSpec]) -> Vec<Vec<String>> {
    indexes
        .iter()
        .filter(|i| i.unique)
        .map(|i| i.keys.clone())
        .collect()
}

fn index_key(record: &Record, keys: &[String]) -> String {
    let parts: Vec<String> = keys
        .iter()
        .map(|k| lookup_key(value_at_path(record, k).unwrap_or(&Value::Null)))
        .collect();
    parts.join("|")
}

/// Whole in-memory store: catalog of logical datasets plus physical tables.
#[derive(Debug, Default)]
pub(super) struct Inner {
    pub catalog: HashMap<(String, String), DatasetMeta>,
    /// Keyed by `(database, physical name)`.
    pub tables: HashMap<(String, String), Table>,
    /// Remaining successful `add` calls before an injected failure.
    pub add_faults: HashMap<(String, String), usize>,
}

impl Inner {
    pub fn meta(&self, database: &str, name: &str) -> Result<&DatasetMeta, StorageError> {
        self.catalog
            .get(&(database.to_string(), name.to_string()))
            .ok_or_else(|| StorageError::DatasetNotFound(format!("{database}.{name}")))
    }

    pub fn meta_mut(&mut self, database: &str, name: &str) -> Result<&mut DatasetMeta, StorageError> {
        self.catalog
            .get_mut(&(database.to_string(), name.to_string()))
            .ok_or_else(|| StorageError::DatasetNotFound(format!("{database}.{name}")))
    }

    pub fn physical(&self, database: &str, name: &str, kind: DatasetKind) -> Result<String, StorageError> {
        Ok(self.meta(database, name)?.physical_name(name, kind))
    }

    pub fn table(&self, database: &str, physical: &str) -> Option<&Table> {
        self.tables.get(&(database.to_string(), physical.to_string()))
    }

    pub fn table_mut(&mut self, database: &str, physical: &str) -> &mut Table {
        self.tables
            .entry((database.to_string(), physical.to_string()))
            .or_insert_with(Table::new)
    }

    /// Append to the write dataset of a logical dataset.
    pub fn append(&mut self, database: &str, name: &str, records: Vec<Record>) -> Result<u64, StorageError> {
        let fault_key = (database.to_string(), name.to_string());
        if let Some(remaining) = self.add_faults.get_mut(&fault_key) {
            if *remaining == 0 {
                return Err(StorageError::Other(format!(
                    "injected add failure on {database}.{name}"
                )));
            }
            *remaining -= 1;
        }

        let meta = self.meta(database, name)?;
        let physical = meta.physical_name(name, DatasetKind::Write);
        let single_buffer = !meta.double_buffering;
        let written = self.table_mut(database, &physical).insert(&physical, records)?;
        if single_buffer {
            self.meta_mut(database, name)?.updated_at = Some(Utc::now());
        }
        Ok(written)
    }

    pub fn widen(&mut self, database: &str, name: &str, required: &Schema) -> Result<Vec<String>, StorageError> {
        let meta = self.meta_mut(database, name)?;
        Ok(widen_schema(&mut meta.schema, required))
    }
}
