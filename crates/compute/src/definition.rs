//! YAML graph definitions.
//!
//! A definition names data nodes and compute nodes and wires them together
//! by name. Installing it into a [`NodeStore`] keeps the ids and lock state
//! of nodes that already exist under the same name, so a definition can be
//! re-applied to a persisted graph.

use std::path::Path;

use dataflow_core::{Record, Schema, StorageConfig};
use dataflow_storage::{ConnectionScope, IndexSpec, Where};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ComputeError;
use crate::node::{ComputeKind, ComputeNode, DataNode, Node, NodeId};
use crate::store::NodeStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub data_nodes: Vec<DataNodeDef>,
    #[serde(default)]
    pub compute_nodes: Vec<ComputeNodeDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataNodeDef {
    pub name: String,
    /// Falls back to the configured default backend.
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    #[serde(default)]
    pub schema: Schema,
    #[serde(default)]
    pub use_double_buffering: bool,
    /// Seed rows, written only while the dataset is empty.
    #[serde(default)]
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeNodeDef {
    pub name: String,
    /// Dependency node names, in order.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Name of the output data node.
    pub output: String,
    #[serde(default)]
    pub clear_data_on_compute: bool,
    #[serde(default)]
    pub limit_per_process: usize,
    #[serde(default)]
    pub max_parallel_processes: Option<usize>,
    #[serde(default)]
    pub recompute_interval: u64,
    pub kind: ComputeKind,
}

/// Node ids by name, in definition order.
#[derive(Debug, Clone, Default)]
pub struct InstalledGraph {
    pub ids: IndexMap<String, NodeId>,
}

impl InstalledGraph {
    pub fn id(&self, name: &str) -> Result<NodeId, ComputeError> {
        self.ids
            .get(name)
            .copied()
            .ok_or_else(|| ComputeError::NodeNotFound(name.to_string()))
    }
}

impl GraphDefinition {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ComputeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ComputeError::Definition(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ComputeError> {
        serde_yaml::from_str(text).map_err(|e| ComputeError::Definition(e.to_string()))
    }

    /// Save every node into `store` and seed data node records.
    pub fn install(
        &self,
        store: &dyn NodeStore,
        scope: &ConnectionScope,
        storage: &StorageConfig,
    ) -> Result<InstalledGraph, ComputeError> {
        let mut installed = InstalledGraph::default();

        for def in &self.data_nodes {
            let id = match store.find_by_name(&def.name)? {
                Some(Node::Data(existing)) => existing.id,
                Some(Node::Compute(_)) => {
                    return Err(ComputeError::Definition(format!(
                        "'{}' already exists as a compute node",
                        def.name
                    )))
                }
                None => Uuid::new_v4(),
            };
            let node = DataNode {
                id,
                name: def.name.clone(),
                backend: def.backend.clone().unwrap_or_else(|| storage.default_backend.clone()),
                database: def
                    .database
                    .clone()
                    .unwrap_or_else(|| storage.default_database.clone()),
                dataset: def.dataset.clone(),
                indexes: def.indexes.clone(),
                schema: def.schema.clone(),
                use_double_buffering: def.use_double_buffering,
            };
            if !def.records.is_empty() {
                seed(scope, &node, &def.records)?;
            }
            store.save(Node::Data(node))?;
            installed.ids.insert(def.name.clone(), id);
        }

        for def in &self.compute_nodes {
            let dependency_ids = def
                .dependencies
                .iter()
                .map(|name| resolve_name(store, &installed, name))
                .collect::<Result<Vec<_>, _>>()?;
            let output = resolve_name(store, &installed, &def.output)?;
            if !matches!(store.get(output)?, Some(Node::Data(_))) {
                return Err(ComputeError::Definition(format!(
                    "output '{}' of '{}' is not a data node",
                    def.output, def.name
                )));
            }

            let mut node = match store.find_by_name(&def.name)? {
                Some(Node::Compute(existing)) => existing,
                Some(Node::Data(_)) => {
                    return Err(ComputeError::Definition(format!(
                        "'{}' already exists as a data node",
                        def.name
                    )))
                }
                None => ComputeNode::new(def.name.clone(), def.kind.clone()),
            };
            node.kind = def.kind.clone();
            node.dependency_ids = dependency_ids;
            node.data_node_id = Some(output);
            node.clear_data_on_compute = def.clear_data_on_compute;
            node.limit_per_process = def.limit_per_process;
            node.max_parallel_processes = def.max_parallel_processes;
            node.recompute_interval = def.recompute_interval;

            installed.ids.insert(def.name.clone(), node.id);
            store.save(Node::Compute(node))?;
        }

        info!(
            data_nodes = self.data_nodes.len(),
            compute_nodes = self.compute_nodes.len(),
            "graph definition installed"
        );
        Ok(installed)
    }
}

fn resolve_name(
    store: &dyn NodeStore,
    installed: &InstalledGraph,
    name: &str,
) -> Result<NodeId, ComputeError> {
    if let Some(id) = installed.ids.get(name) {
        return Ok(*id);
    }
    store
        .find_by_name(name)?
        .map(|n| n.id())
        .ok_or_else(|| ComputeError::Definition(format!("unknown node '{name}'")))
}

fn seed(scope: &ConnectionScope, node: &DataNode, records: &[Record]) -> Result<(), ComputeError> {
    let dataset = scope.dataset(&node.dataset_spec())?;
    if dataset.count(&Where::new())? > 0 {
        debug!(node = %node.name, "dataset already populated, skipping seed");
        return Ok(());
    }
    let written = dataset.add(records.to_vec())?;
    if dataset.use_double_buffering()? {
        dataset.swap_read_write_datasets()?;
    }
    debug!(node = %node.name, records = written, "seeded data node");
    Ok(())
}
