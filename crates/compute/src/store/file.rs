use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::{MemoryNodeStore, NodeStore};
use crate::error::ComputeError;
use crate::node::{Node, NodeId};

/// Node store persisted as a JSON snapshot after every mutation.
///
/// Mutations are atomic within one process only; concurrent processes
/// sharing the file need a store with a real conditional update.
#[derive(Debug)]
pub struct FileNodeStore {
    path: PathBuf,
    inner: MemoryNodeStore,
    /// Serialises mutate-then-snapshot so writers never share the temp file
    /// and an older snapshot never lands after a newer one.
    writer: Mutex<()>,
}

impl FileNodeStore {
    /// Open the snapshot at `path`, starting empty if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ComputeError> {
        let path = path.as_ref().to_path_buf();
        let nodes: Vec<Node> = if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| ComputeError::Store(format!("read {}: {e}", path.display())))?;
            serde_json::from_str(&raw)
                .map_err(|e| ComputeError::Store(format!("parse {}: {e}", path.display())))?
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), nodes = nodes.len(), "opened node store");
        Ok(Self {
            path,
            inner: MemoryNodeStore::with_nodes(nodes),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&self) -> Result<MutexGuard<'_, ()>, ComputeError> {
        self.writer
            .lock()
            .map_err(|e| ComputeError::LockPoisoned(format!("node store file lock: {e}")))
    }

    /// Apply `mutate` to the in-memory records and write the snapshot while
    /// holding the writer lock.
    fn mutate<R>(
        &self,
        mutate: impl FnOnce(&MemoryNodeStore) -> Result<R, ComputeError>,
    ) -> Result<R, ComputeError> {
        let _writer = self.writer()?;
        let out = mutate(&self.inner)?;
        self.persist()?;
        Ok(out)
    }

    fn persist(&self) -> Result<(), ComputeError> {
        let nodes = self.inner.list()?;
        let raw = serde_json::to_string_pretty(&nodes)
            .map_err(|e| ComputeError::Store(format!("serialize node store: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, raw)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| ComputeError::Store(format!("write {}: {e}", self.path.display())))
    }
}

impl NodeStore for FileNodeStore {
    fn get(&self, id: NodeId) -> Result<Option<Node>, ComputeError> {
        self.inner.get(id)
    }

    fn find_by_name(&self, name: &str) -> Result<Option<Node>, ComputeError> {
        self.inner.find_by_name(name)
    }

    fn list(&self) -> Result<Vec<Node>, ComputeError> {
        self.inner.list()
    }

    fn save(&self, node: Node) -> Result<(), ComputeError> {
        self.mutate(|inner| inner.save(node))
    }

    fn try_acquire_lock(
        &self,
        id: NodeId,
        execution: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, ComputeError> {
        let _writer = self.writer()?;
        let acquired = self.inner.try_acquire_lock(id, execution, now)?;
        if acquired {
            self.persist()?;
        }
        Ok(acquired)
    }

    fn heartbeat(&self, id: NodeId, now: DateTime<Utc>) -> Result<(), ComputeError> {
        self.mutate(|inner| inner.heartbeat(id, now))
    }

    fn release_lock(&self, id: NodeId) -> Result<(), ComputeError> {
        self.mutate(|inner| inner.release_lock(id))
    }

    fn set_last_compute_starting_time(
        &self,
        id: NodeId,
        at: DateTime<Utc>,
    ) -> Result<(), ComputeError> {
        self.mutate(|inner| inner.set_last_compute_starting_time(id, at))
    }
}
