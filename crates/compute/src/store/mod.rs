//! Persistence of node records and the computing lock.
//!
//! The lock is only as strong as [`NodeStore::try_acquire_lock`]: it must be
//! a single atomic conditional update.

mod file;
mod resolver;

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use uuid::Uuid;

use crate::error::ComputeError;
use crate::node::{ComputeNode, ComputingState, LockState, Node, NodeId};

pub use file::FileNodeStore;
pub use resolver::NodeResolver;

pub trait NodeStore: Send + Sync {
    fn get(&self, id: NodeId) -> Result<Option<Node>, ComputeError>;
    fn find_by_name(&self, name: &str) -> Result<Option<Node>, ComputeError>;
    fn list(&self) -> Result<Vec<Node>, ComputeError>;
    /// Insert or replace a record by id.
    fn save(&self, node: Node) -> Result<(), ComputeError>;

    /// Set the lock fields only if the node is not already computing.
    /// Returns whether this call took the lock.
    fn try_acquire_lock(
        &self,
        id: NodeId,
        execution: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, ComputeError>;
    fn heartbeat(&self, id: NodeId, now: DateTime<Utc>) -> Result<(), ComputeError>;
    /// Clear every lock field. Idempotent.
    fn release_lock(&self, id: NodeId) -> Result<(), ComputeError>;
    fn set_last_compute_starting_time(
        &self,
        id: NodeId,
        at: DateTime<Utc>,
    ) -> Result<(), ComputeError>;
}

/// In-process node store.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<IndexMap<NodeId, Node>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        Self {
            nodes: RwLock::new(nodes.into_iter().map(|n| (n.id(), n)).collect()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, IndexMap<NodeId, Node>>, ComputeError> {
        self.nodes
            .read()
            .map_err(|e| ComputeError::LockPoisoned(format!("node store read lock: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, IndexMap<NodeId, Node>>, ComputeError> {
        self.nodes
            .write()
            .map_err(|e| ComputeError::LockPoisoned(format!("node store write lock: {e}")))
    }

    fn update_compute<R>(
        &self,
        id: NodeId,
        f: impl FnOnce(&mut ComputeNode) -> R,
    ) -> Result<R, ComputeError> {
        let mut nodes = self.write()?;
        match nodes.get_mut(&id) {
            Some(Node::Compute(node)) => Ok(f(node)),
            Some(Node::Data(node)) => Err(ComputeError::NotComputeNode(node.name.clone())),
            None => Err(ComputeError::NodeNotFound(id.to_string())),
        }
    }
}

impl NodeStore for MemoryNodeStore {
    fn get(&self, id: NodeId) -> Result<Option<Node>, ComputeError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn find_by_name(&self, name: &str) -> Result<Option<Node>, ComputeError> {
        Ok(self.read()?.values().find(|n| n.name() == name).cloned())
    }

    fn list(&self) -> Result<Vec<Node>, ComputeError> {
        Ok(self.read()?.values().cloned().collect())
    }

    fn save(&self, node: Node) -> Result<(), ComputeError> {
        self.write()?.insert(node.id(), node);
        Ok(())
    }

    fn try_acquire_lock(
        &self,
        id: NodeId,
        execution: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, ComputeError> {
        self.update_compute(id, |node| {
            if node.lock.is_computing() {
                return false;
            }
            node.lock = LockState {
                computing_state: Some(ComputingState::Computing),
                computing_started_at: Some(now),
                execution_uuid: Some(execution),
                last_heartbeat_time: Some(now),
            };
            true
        })
    }

    fn heartbeat(&self, id: NodeId, now: DateTime<Utc>) -> Result<(), ComputeError> {
        self.update_compute(id, |node| node.lock.last_heartbeat_time = Some(now))
    }

    fn release_lock(&self, id: NodeId) -> Result<(), ComputeError> {
        self.update_compute(id, |node| {
            node.lock.computing_state = None;
            node.lock.computing_started_at = None;
            node.lock.execution_uuid = None;
        })
    }

    fn set_last_compute_starting_time(
        &self,
        id: NodeId,
        at: DateTime<Utc>,
    ) -> Result<(), ComputeError> {
        self.update_compute(id, |node| node.last_compute_starting_time = Some(at))
    }
}
