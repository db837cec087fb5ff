//! Adapter contract consumed by the compute core.
//!
//! A [`Backend`] hands out [`Connection`]s; a connection opens
//! [`DatasetRef`] handles. Handles are only valid while the connection
//! that opened them is open, so they must never cross a worker boundary.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dataflow_core::{Record, Schema};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::query::{partition_system_ids, Where};

/// Which physical identity of a double-buffered dataset to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Read,
    Write,
}

/// Declared index over one or more (dotted) fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub keys: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

/// Where a logical dataset lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetLocator {
    pub backend: String,
    pub database: String,
    pub name: String,
}

impl DatasetLocator {
    /// Push-down requires every participant to share backend and database.
    pub fn same_store(&self, other: &DatasetLocator) -> bool {
        self.backend == other.backend && self.database == other.database
    }
}

impl std::fmt::Display for DatasetLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}.{}", self.backend, self.database, self.name)
    }
}

/// Declaration used to open (and on first use, create) a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub locator: DatasetLocator,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    #[serde(default)]
    pub schema: Schema,
    #[serde(default)]
    pub use_double_buffering: bool,
}

/// Handle to a named, queryable, appendable collection of records.
///
/// Reads address the "read" physical dataset, writes the "write" one. With
/// double buffering disabled both are the same physical dataset.
pub trait DatasetRef: Send + Sync {
    fn locator(&self) -> &DatasetLocator;

    fn read_dataset_name(&self) -> Result<String, StorageError>;
    fn write_dataset_name(&self) -> Result<String, StorageError>;

    fn find(&self, id: i64) -> Result<Option<Record>, StorageError>;
    /// Records matching `filter`, ascending by surrogate id.
    fn all(&self, filter: &Where, limit: Option<usize>, offset: usize)
        -> Result<Vec<Record>, StorageError>;
    fn count(&self, filter: &Where) -> Result<u64, StorageError>;
    /// Ascending surrogate ids of the records matching `filter`.
    fn system_ids(&self, filter: &Where) -> Result<Vec<i64>, StorageError>;

    /// Disjoint, ordered range predicates covering the filtered record set.
    fn ordered_system_id_queries(
        &self,
        batch_size: usize,
        filter: &Where,
    ) -> Result<Vec<Where>, StorageError> {
        let ids = self.system_ids(filter)?;
        Ok(partition_system_ids(&ids, batch_size, filter))
    }

    /// Append to the write dataset. Every record receives a fresh surrogate id.
    fn add(&self, records: Vec<Record>) -> Result<u64, StorageError>;

    fn recreate_dataset(&self, kind: DatasetKind) -> Result<(), StorageError>;
    fn create_unique_indexes(&self, kind: DatasetKind) -> Result<(), StorageError>;
    fn create_non_unique_indexes(&self, kind: DatasetKind) -> Result<(), StorageError>;
    /// Atomically exchange the read and write physical datasets.
    fn swap_read_write_datasets(&self) -> Result<(), StorageError>;

    fn schema(&self) -> Result<Schema, StorageError>;
    /// Additive merge of `required` into the declared schema.
    fn update_schema(&self, required: &Schema) -> Result<(), StorageError>;

    fn use_double_buffering(&self) -> Result<bool, StorageError>;
    fn set_use_double_buffering(&self, enabled: bool) -> Result<(), StorageError>;

    /// Last time readers could observe a change.
    fn updated_at(&self) -> Result<Option<DateTime<Utc>>, StorageError>;
}

/// Join flavour understood by backends that support push-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeJoinType {
    Inner,
    Left,
}

/// One side of a native join: which fields to keep (all but the surrogate
/// key when empty) and the prefix applied to their output names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSide {
    pub dataset: DatasetLocator,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub prefix: String,
}

/// Backend-native join of two datasets into the write dataset of `output`.
///
/// Unmatched left records (left joins only) carry `null` for every field of
/// the right side's projected schema. Left values win on name collisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeJoin {
    pub left: JoinSide,
    pub right: JoinSide,
    pub output: DatasetLocator,
    pub join_type: NativeJoinType,
    /// `(left path, right path)` pairs that must all be equal. The first is
    /// the primary key pair.
    pub keys: Vec<(String, String)>,
}

/// An open session with a backend.
pub trait Connection: Send + Sync {
    fn backend_id(&self) -> &str;
    fn is_open(&self) -> bool;
    /// Close this connection. Idempotent.
    fn close(&self);
    fn open_dataset(&self, spec: &DatasetSpec) -> Result<Arc<dyn DatasetRef>, StorageError>;

    /// Run a join inside the backend. Returns the number of written records.
    fn push_down_join(&self, join: &NativeJoin) -> Result<u64, StorageError> {
        let _ = join;
        Err(StorageError::Unsupported {
            backend: self.backend_id().to_string(),
            operation: "push_down_join".to_string(),
        })
    }
}

/// A storage backend (one per configured store).
pub trait Backend: Send + Sync {
    fn id(&self) -> &str;
    fn connect(&self) -> Result<Arc<dyn Connection>, StorageError>;
    /// Close every connection this process opened against the backend.
    fn disconnect_clients(&self);
    fn supports_push_down(&self) -> bool {
        false
    }
}
