//! Persisted node records.
//!
//! A graph is made of data nodes (plain datasets) and compute nodes (which
//! derive an output dataset from their ordered dependencies). Records are
//! plain serde structs; behaviour lives in the orchestrator.

use chrono::{DateTime, Duration, Utc};
use dataflow_core::Schema;
use dataflow_storage::{DatasetLocator, DatasetSpec, IndexSpec};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::computation::{Computation, FilterConfig, JoinConfig, SelectConfig};

pub type NodeId = Uuid;

/// A dataset-backed leaf of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataNode {
    pub id: NodeId,
    pub name: String,
    pub backend: String,
    pub database: String,
    /// Dataset name inside `database`; defaults to the node name.
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    #[serde(default)]
    pub schema: Schema,
    #[serde(default)]
    pub use_double_buffering: bool,
}

impl DataNode {
    pub fn locator(&self) -> DatasetLocator {
        DatasetLocator {
            backend: self.backend.clone(),
            database: self.database.clone(),
            name: self.dataset.clone().unwrap_or_else(|| self.name.clone()),
        }
    }

    pub fn dataset_spec(&self) -> DatasetSpec {
        DatasetSpec {
            locator: self.locator(),
            indexes: self.indexes.clone(),
            schema: self.schema.clone(),
            use_double_buffering: self.use_double_buffering,
        }
    }
}

/// Lock flag persisted on a compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputingState {
    Computing,
}

/// Computing lock fields. All `None` while idle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockState {
    #[serde(default)]
    pub computing_state: Option<ComputingState>,
    #[serde(default)]
    pub computing_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_uuid: Option<Uuid>,
    #[serde(default)]
    pub last_heartbeat_time: Option<DateTime<Utc>>,
}

impl LockState {
    pub fn is_computing(&self) -> bool {
        self.computing_state == Some(ComputingState::Computing)
    }
}

/// Node-type specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComputeKind {
    Join(JoinConfig),
    Select(SelectConfig),
    Filter(FilterConfig),
}

impl ComputeKind {
    pub fn computation(&self) -> &dyn Computation {
        match self {
            ComputeKind::Join(c) => c,
            ComputeKind::Select(c) => c,
            ComputeKind::Filter(c) => c,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ComputeKind::Join(_) => "join",
            ComputeKind::Select(_) => "select",
            ComputeKind::Filter(_) => "filter",
        }
    }
}

/// A node that derives its output dataset from its dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeNode {
    pub id: NodeId,
    pub name: String,
    /// Order is significant: computations treat positions differently.
    #[serde(default)]
    pub dependency_ids: Vec<NodeId>,
    #[serde(default)]
    pub data_node_id: Option<NodeId>,
    #[serde(flatten)]
    pub lock: LockState,
    /// Start time of the last successful compute.
    #[serde(default)]
    pub last_compute_starting_time: Option<DateTime<Utc>>,
    /// Rebuild the output from scratch each compute, behind a double buffer.
    #[serde(default)]
    pub clear_data_on_compute: bool,
    /// Upper bound on records per batch. 0 means unbounded.
    #[serde(default)]
    pub limit_per_process: usize,
    #[serde(default)]
    pub max_parallel_processes: Option<usize>,
    /// Seconds between automatic recomputes. 0 disables them.
    #[serde(default)]
    pub recompute_interval: u64,
    pub kind: ComputeKind,
}

impl ComputeNode {
    pub fn new(name: impl Into<String>, kind: ComputeKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            dependency_ids: Vec::new(),
            data_node_id: None,
            lock: LockState::default(),
            last_compute_starting_time: None,
            clear_data_on_compute: false,
            limit_per_process: 0,
            max_parallel_processes: None,
            recompute_interval: 0,
            kind,
        }
    }

    /// Whether the recompute interval has elapsed since the last compute.
    ///
    /// A node that never computed is due as soon as it has an interval.
    pub fn needs_automatic_recomputing(&self, now: DateTime<Utc>) -> bool {
        if self.recompute_interval == 0 {
            return false;
        }
        let Some(interval) = i64::try_from(self.recompute_interval)
            .ok()
            .and_then(Duration::try_seconds)
        else {
            return false;
        };
        match self.last_compute_starting_time {
            None => true,
            Some(last) => last
                .checked_add_signed(interval)
                .map_or(false, |due| due <= now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Data(DataNode),
    Compute(ComputeNode),
}

impl Node {
    pub fn id(&self) -> NodeId {
        match self {
            Node::Data(n) => n.id,
            Node::Compute(n) => n.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::Data(n) => &n.name,
            Node::Compute(n) => &n.name,
        }
    }

    pub fn dependency_ids(&self) -> &[NodeId] {
        match self {
            Node::Data(_) => &[],
            Node::Compute(n) => &n.dependency_ids,
        }
    }

    pub fn as_compute(&self) -> Option<&ComputeNode> {
        match self {
            Node::Compute(n) => Some(n),
            Node::Data(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select_node() -> ComputeNode {
        ComputeNode::new(
            "projection",
            ComputeKind::Select(SelectConfig {
                keys: vec!["a".into()],
            }),
        )
    }

    #[test]
    fn interval_zero_never_due() {
        let node = select_node();
        assert!(!node.needs_automatic_recomputing(Utc::now()));
    }

    #[test]
    fn interval_elapsed_is_due() {
        let now = Utc::now();
        let mut node = select_node();
        node.recompute_interval = 60;
        assert!(node.needs_automatic_recomputing(now));

        node.last_compute_starting_time = Some(now - Duration::seconds(30));
        assert!(!node.needs_automatic_recomputing(now));
        node.last_compute_starting_time = Some(now - Duration::seconds(61));
        assert!(node.needs_automatic_recomputing(now));
    }

    #[test]
    fn lock_fields_flatten_into_node() {
        let mut node = select_node();
        node.lock.computing_state = Some(ComputingState::Computing);
        let json = serde_json::to_value(Node::Compute(node)).unwrap();
        assert_eq!(json["node"], "compute");
        assert_eq!(json["computing_state"], "computing");
        assert_eq!(json["kind"]["type"], "select");
    }
}
