//! Backend registry and per-worker connection scopes.
//!
//! A [`ConnectionScope`] lazily opens at most one connection per backend
//! and closes all of them on [`release`](ConnectionScope::release) or drop.
//! Parallel dispatch releases the parent's scope before fanning out and
//! gives every worker its own [`child`](ConnectionScope::child) scope.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::dataset::{Backend, Connection, DatasetRef, DatasetSpec};
use crate::error::StorageError;

/// Backends addressable by id.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        debug!(backend = backend.id(), "registered storage backend");
        self.backends.insert(backend.id().to_string(), backend);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Backend>, StorageError> {
        self.backends
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::UnknownBackend(id.to_string()))
    }

    /// Process-wide disconnect of every backend.
    pub fn disconnect_all(&self) {
        for backend in self.backends.values() {
            backend.disconnect_clients();
        }
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Connections owned by one worker (or by the orchestrating thread).
pub struct ConnectionScope {
    registry: Arc<BackendRegistry>,
    open: Mutex<HashMap<String, Arc<dyn Connection>>>,
}

impl ConnectionScope {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh scope over the same backends. Shares no connections.
    pub fn child(&self) -> Self {
        Self::new(Arc::clone(&self.registry))
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// This scope's connection to `backend`, opened on first use.
    pub fn connection(&self, backend: &str) -> Result<Arc<dyn Connection>, StorageError> {
        let mut open = self
            .open
            .lock()
            .map_err(|e| StorageError::LockPoisoned(format!("connection scope: {e}")))?;
        if let Some(conn) = open.get(backend) {
            if conn.is_open() {
                return Ok(Arc::clone(conn));
            }
        }
        let conn = self.registry.get(backend)?.connect()?;
        open.insert(backend.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    pub fn dataset(&self, spec: &DatasetSpec) -> Result<Arc<dyn DatasetRef>, StorageError> {
        self.connection(&spec.locator.backend)?.open_dataset(spec)
    }

    /// Close every connection opened through this scope. Idempotent.
    pub fn release(&self) {
        if let Ok(mut open) = self.open.lock() {
            for (_, conn) in open.drain() {
                conn.close();
            }
        }
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        self.release();
    }
}
