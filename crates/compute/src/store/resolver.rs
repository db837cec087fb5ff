use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dataflow_storage::DatasetSpec;
use uuid::Uuid;

use super::NodeStore;
use crate::error::ComputeError;
use crate::node::{ComputeNode, DataNode, Node, NodeId};

/// Per-run read-through cache of node records.
///
/// Lock decisions never consult the cache; they always go to the store.
/// Entries are replaced by [`reload`](Self::reload) once a dependency has
/// been recomputed.
pub struct NodeResolver {
    store: Arc<dyn NodeStore>,
    cache: RwLock<HashMap<NodeId, Node>>,
}

impl NodeResolver {
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    pub fn get(&self, id: NodeId) -> Result<Node, ComputeError> {
        if let Some(node) = self
            .cache
            .read()
            .map_err(|e| ComputeError::LockPoisoned(format!("resolver cache: {e}")))?
            .get(&id)
        {
            return Ok(node.clone());
        }
        self.reload(id)
    }

    /// Re-read `id` from the store and replace its cache entry.
    pub fn reload(&self, id: NodeId) -> Result<Node, ComputeError> {
        let node = self
            .store
            .get(id)?
            .ok_or_else(|| ComputeError::NodeNotFound(id.to_string()))?;
        self.cache
            .write()
            .map_err(|e| ComputeError::LockPoisoned(format!("resolver cache: {e}")))?
            .insert(id, node.clone());
        Ok(node)
    }

    /// Resolve a node by id, falling back to its name.
    pub fn lookup(&self, key: &str) -> Result<Node, ComputeError> {
        if let Ok(id) = Uuid::parse_str(key) {
            if let Some(node) = self.store.get(id)? {
                return Ok(node);
            }
        }
        self.store
            .find_by_name(key)?
            .ok_or_else(|| ComputeError::NodeNotFound(key.to_string()))
    }

    /// Output data node of a compute node.
    pub fn output_of(&self, node: &ComputeNode) -> Result<DataNode, ComputeError> {
        let id = node
            .data_node_id
            .ok_or_else(|| ComputeError::MissingOutput(node.name.clone()))?;
        match self.get(id) {
            Ok(Node::Data(data)) => Ok(data),
            Ok(Node::Compute(_)) | Err(ComputeError::NodeNotFound(_)) => {
                Err(ComputeError::MissingOutput(node.name.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// The dataset a dependent reads from: the data node itself, or a
    /// compute node's output.
    pub fn dataset_spec_of(&self, node: &Node) -> Result<DatasetSpec, ComputeError> {
        match node {
            Node::Data(data) => Ok(data.dataset_spec()),
            Node::Compute(compute) => Ok(self.output_of(compute)?.dataset_spec()),
        }
    }
}
