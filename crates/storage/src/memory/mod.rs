//! In-process reference backend.
//!
//! Keeps every logical dataset in a shared catalog guarded by a single
//! `RwLock`, so each adapter call is atomic. Connections are tracked so
//! callers can verify that no connection outlives its scope.

mod join;
mod table;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use dataflow_core::{Record, Schema};
use tracing::{debug, info};

use crate::dataset::{
    Backend, Connection, DatasetKind, DatasetLocator, DatasetRef, DatasetSpec, NativeJoin,
};
use crate::error::StorageError;
use crate::query::Where;

use self::table::{DatasetMeta, Inner, Table};

struct Shared {
    inner: RwLock<Inner>,
    connections: Mutex<Vec<Arc<ConnHandle>>>,
    next_connection: AtomicU64,
}

impl Shared {
    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StorageError> {
        self.inner
            .read()
            .map_err(|e| StorageError::LockPoisoned(format!("memory store read lock: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StorageError> {
        self.inner
            .write()
            .map_err(|e| StorageError::LockPoisoned(format!("memory store write lock: {e}")))
    }
}

#[derive(Debug)]
struct ConnHandle {
    id: u64,
    open: AtomicBool,
}

impl ConnHandle {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::ConnectionClosed)
        }
    }
}

/// In-memory backend. Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct MemoryBackend {
    id: String,
    push_down: bool,
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            push_down: true,
            shared: Arc::new(Shared {
                inner: RwLock::new(Inner::default()),
                connections: Mutex::new(Vec::new()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Disable the native join engine (forces generic execution paths).
    pub fn without_push_down(mut self) -> Self {
        self.push_down = false;
        self
    }

    /// Number of connections currently open against this backend.
    pub fn open_connections(&self) -> usize {
        self.shared
            .connections
            .lock()
            .map(|c| c.iter().filter(|h| h.open.load(Ordering::Acquire)).count())
            .unwrap_or(0)
    }

    /// Let the next `successful_adds` appends to a dataset succeed, then fail.
    pub fn inject_add_failure(&self, database: &str, name: &str, successful_adds: usize) {
        if let Ok(mut inner) = self.shared.inner.write() {
            inner
                .add_faults
                .insert((database.to_string(), name.to_string()), successful_adds);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut inner) = self.shared.inner.write() {
            inner.add_faults.clear();
        }
    }

    /// Records of a physical dataset, ascending by surrogate id.
    pub fn physical_records(&self, database: &str, physical: &str) -> Vec<Record> {
        self.shared
            .inner
            .read()
            .ok()
            .and_then(|inner| {
                inner
                    .table(database, physical)
                    .map(|t| t.records.values().cloned().collect())
            })
            .unwrap_or_default()
    }

    /// Non-unique indexes currently built on a physical dataset.
    pub fn non_unique_indexes(&self, database: &str, physical: &str) -> Vec<Vec<String>> {
        self.shared
            .inner
            .read()
            .ok()
            .and_then(|inner| inner.table(database, physical).map(|t| t.non_unique_indexes.clone()))
            .unwrap_or_default()
    }
}

impl Backend for MemoryBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn connect(&self) -> Result<Arc<dyn Connection>, StorageError> {
        let handle = Arc::new(ConnHandle {
            id: self.shared.next_connection.fetch_add(1, Ordering::Relaxed),
            open: AtomicBool::new(true),
        });
        let mut connections = self
            .shared
            .connections
            .lock()
            .map_err(|e| StorageError::LockPoisoned(format!("connection list: {e}")))?;
        connections.retain(|h| h.open.load(Ordering::Acquire));
        connections.push(Arc::clone(&handle));
        debug!(backend = %self.id, connection = handle.id, "memory connection opened");
        Ok(Arc::new(MemoryConnection {
            backend_id: self.id.clone(),
            shared: Arc::clone(&self.shared),
            handle,
        }))
    }

    fn disconnect_clients(&self) {
        if let Ok(mut connections) = self.shared.connections.lock() {
            for handle in connections.drain(..) {
                handle.open.store(false, Ordering::Release);
            }
        }
        debug!(backend = %self.id, "memory connections closed");
    }

    fn supports_push_down(&self) -> bool {
        self.push_down
    }
}

struct MemoryConnection {
    backend_id: String,
    shared: Arc<Shared>,
    handle: Arc<ConnHandle>,
}

impl Connection for MemoryConnection {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    fn is_open(&self) -> bool {
        self.handle.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.handle.open.store(false, Ordering::Release);
    }

    fn open_dataset(&self, spec: &DatasetSpec) -> Result<Arc<dyn DatasetRef>, StorageError> {
        self.handle.ensure_open()?;
        let locator = &spec.locator;
        let mut inner = self.shared.write()?;
        let key = (locator.database.clone(), locator.name.clone());
        if !inner.catalog.contains_key(&key) {
            let meta = DatasetMeta {
                indexes: spec.indexes.clone(),
                schema: spec.schema.clone(),
                double_buffering: spec.use_double_buffering,
                read_idx: 1,
                updated_at: None,
            };
            for kind in [DatasetKind::Read, DatasetKind::Write] {
                let physical = meta.physical_name(&locator.name, kind);
                inner
                    .tables
                    .entry((locator.database.clone(), physical))
                    .or_insert_with(|| Table::with_unique_indexes(&spec.indexes));
            }
            inner.catalog.insert(key, meta);
            info!(dataset = %locator, "memory dataset created");
        }
        Ok(Arc::new(MemoryDataset {
            locator: locator.clone(),
            shared: Arc::clone(&self.shared),
            handle: Arc::clone(&self.handle),
        }))
    }

    fn push_down_join(&self, join: &NativeJoin) -> Result<u64, StorageError> {
        self.handle.ensure_open()?;
        let mut inner = self.shared.write()?;
        join::execute(&mut inner, join)
    }
}

struct MemoryDataset {
    locator: DatasetLocator,
    shared: Arc<Shared>,
    handle: Arc<ConnHandle>,
}

impl MemoryDataset {
    fn db(&self) -> &str {
        &self.locator.database
    }

    fn name(&self) -> &str {
        &self.locator.name
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StorageError> {
        self.handle.ensure_open()?;
        self.shared.read()
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StorageError> {
        self.handle.ensure_open()?;
        self.shared.write()
    }

    fn with_read_table<T>(
        &self,
        default: T,
        f: impl FnOnce(&Table) -> T,
    ) -> Result<T, StorageError> {
        let inner = self.read()?;
        let physical = inner.physical(self.db(), self.name(), DatasetKind::Read)?;
        Ok(inner.table(self.db(), &physical).map(f).unwrap_or(default))
    }
}

impl DatasetRef for MemoryDataset {
    fn locator(&self) -> &DatasetLocator {
        &self.locator
    }

    fn read_dataset_name(&self) -> Result<String, StorageError> {
        self.read()?.physical(self.db(), self.name(), DatasetKind::Read)
    }

    fn write_dataset_name(&self) -> Result<String, StorageError> {
        self.read()?.physical(self.db(), self.name(), DatasetKind::Write)
    }

    fn find(&self, id: i64) -> Result<Option<Record>, StorageError> {
        self.with_read_table(None, |t| t.records.get(&id).cloned())
    }

    fn all(&self, filter: &Where, limit: Option<usize>, offset: usize) -> Result<Vec<Record>, StorageError> {
        self.with_read_table(Vec::new(), |t| {
            t.select(filter)
                .skip(offset)
                .take(limit.unwrap_or(usize::MAX))
                .map(|(_, r)| r.clone())
                .collect()
        })
    }

    fn count(&self, filter: &Where) -> Result<u64, StorageError> {
        self.with_read_table(0, |t| t.select(filter).count() as u64)
    }

    fn system_ids(&self, filter: &Where) -> Result<Vec<i64>, StorageError> {
        self.with_read_table(Vec::new(), |t| t.select(filter).map(|(id, _)| *id).collect())
    }

    fn add(&self, records: Vec<Record>) -> Result<u64, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        let (db, name) = (self.db().to_string(), self.name().to_string());
        self.write()?.append(&db, &name, records)
    }

    fn recreate_dataset(&self, kind: DatasetKind) -> Result<(), StorageError> {
        let mut inner = self.write()?;
        let physical = inner.physical(self.db(), self.name(), kind)?;
        inner
            .tables
            .insert((self.db().to_string(), physical.clone()), Table::new());
        debug!(dataset = %self.locator, physical = %physical, "memory dataset recreated");
        Ok(())
    }

    fn create_unique_indexes(&self, kind: DatasetKind) -> Result<(), StorageError> {
        let mut inner = self.write()?;
        let indexes = inner.meta(self.db(), self.name())?.indexes.clone();
        let physical = inner.physical(self.db(), self.name(), kind)?;
        inner
            .table_mut(self.db(), &physical)
            .build_unique_indexes(&physical, &indexes)
    }

    fn create_non_unique_indexes(&self, kind: DatasetKind) -> Result<(), StorageError> {
        let mut inner = self.write()?;
        let keys: Vec<Vec<String>> = inner
            .meta(self.db(), self.name())?
            .indexes
            .iter()
            .filter(|i| !i.unique)
            .map(|i| i.keys.clone())
            .collect();
        let physical = inner.physical(self.db(), self.name(), kind)?;
        inner.table_mut(self.db(), &physical).non_unique_indexes = keys;
        Ok(())
    }

    fn swap_read_write_datasets(&self) -> Result<(), StorageError> {
        let mut inner = self.write()?;
        let meta = inner.meta_mut(self.db(), self.name())?;
        if !meta.double_buffering {
            return Ok(());
        }
        meta.read_idx = 3 - meta.read_idx;
        meta.updated_at = Some(Utc::now());
        debug!(dataset = %self.locator, read_idx = meta.read_idx, "swapped read/write datasets");
        Ok(())
    }

    fn schema(&self) -> Result<Schema, StorageError> {
        Ok(self.read()?.meta(self.db(), self.name())?.schema.clone())
    }

    fn update_schema(&self, required: &Schema) -> Result<(), StorageError> {
        let added = self.write()?.widen(self.db(), self.name(), required)?;
        if !added.is_empty() {
            debug!(dataset = %self.locator, fields = ?added, "schema widened");
        }
        Ok(())
    }

    fn use_double_buffering(&self) -> Result<bool, StorageError> {
        Ok(self.read()?.meta(self.db(), self.name())?.double_buffering)
    }

    fn set_use_double_buffering(&self, enabled: bool) -> Result<(), StorageError> {
        let mut inner = self.write()?;
        let (db, name) = (self.db().to_string(), self.name().to_string());
        let meta = inner.meta_mut(&db, &name)?;
        if meta.double_buffering == enabled {
            return Ok(());
        }
        meta.double_buffering = enabled;
        let indexes = meta.indexes.clone();
        for kind in [DatasetKind::Read, DatasetKind::Write] {
            let physical = inner.physical(&db, &name, kind)?;
            inner
                .tables
                .entry((db.clone(), physical))
                .or_insert_with(|| Table::with_unique_indexes(&indexes));
        }
        Ok(())
    }

    fn updated_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.read()?.meta(self.db(), self.name())?.updated_at)
    }
}
