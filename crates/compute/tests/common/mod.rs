//! Shared harness: an orchestrator over one in-memory backend and store.

#![allow(dead_code)]

use std::sync::Arc;

use dataflow_compute::{
    CollectingSink, ComputeKind, ComputeNode, DataNode, MemoryNodeStore, Node, NodeId, NodeStore,
    Orchestrator,
};
use dataflow_core::{ComputeConfig, FieldType, Record, Schema, SYSTEM_ID};
use dataflow_storage::{BackendRegistry, ConnectionScope, MemoryBackend, Where};
use serde_json::Value;
use uuid::Uuid;

pub const BACKEND: &str = "mem";
pub const DATABASE: &str = "db";

pub fn rec(v: Value) -> Record {
    v.as_object().cloned().expect("record literal must be an object")
}

/// Rows sorted by their JSON text so parallel batch order does not matter.
pub fn sorted(rows: Vec<Value>) -> Vec<Value> {
    let mut rows = rows;
    rows.sort_by_key(|r| r.to_string());
    rows
}

pub fn config() -> ComputeConfig {
    ComputeConfig {
        lock_poll_interval_ms: 5,
        lock_max_wait_secs: 5,
        max_parallel_processes: 3,
        sequential: false,
    }
}

pub struct Harness {
    pub backend: MemoryBackend,
    pub store: Arc<MemoryNodeStore>,
    pub registry: Arc<BackendRegistry>,
    pub sink: Arc<CollectingSink>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(MemoryBackend::new(BACKEND), config())
    }

    /// Backend without a native join engine.
    pub fn generic() -> Self {
        Self::build(MemoryBackend::new(BACKEND).without_push_down(), config())
    }

    pub fn both() -> [(&'static str, Harness); 2] {
        [("push-down", Self::new()), ("generic", Self::generic())]
    }

    pub fn build(backend: MemoryBackend, config: ComputeConfig) -> Self {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(backend.clone()));
        let registry = Arc::new(registry);
        let store = Arc::new(MemoryNodeStore::new());
        let sink = Arc::new(CollectingSink::new());
        let orchestrator = Orchestrator::new(config, store.clone(), Arc::clone(&registry))
            .with_event_sink(sink.clone());
        Self {
            backend,
            store,
            registry,
            sink,
            orchestrator,
        }
    }

    pub fn scope(&self) -> ConnectionScope {
        ConnectionScope::new(Arc::clone(&self.registry))
    }

    /// Save a data node and seed it with `rows`.
    pub fn data(&self, name: &str, schema: &[(&str, FieldType)], rows: Vec<Value>) -> NodeId {
        self.data_in(DATABASE, name, schema, rows)
    }

    pub fn data_in(
        &self,
        database: &str,
        name: &str,
        schema: &[(&str, FieldType)],
        rows: Vec<Value>,
    ) -> NodeId {
        let node = DataNode {
            id: Uuid::new_v4(),
            name: name.into(),
            backend: BACKEND.into(),
            database: database.into(),
            dataset: None,
            indexes: vec![],
            schema: schema
                .iter()
                .map(|(field, ty)| (field.to_string(), *ty))
                .collect::<Schema>(),
            use_double_buffering: false,
        };
        self.write(&node, rows);
        let id = node.id;
        self.store.save(Node::Data(node)).unwrap();
        id
    }

    pub fn empty(&self, name: &str) -> NodeId {
        self.data(name, &[], vec![])
    }

    /// Save a compute node that rebuilds its output on every compute.
    pub fn compute(&self, name: &str, kind: ComputeKind, deps: &[NodeId], output: NodeId) -> NodeId {
        let mut node = ComputeNode::new(name, kind);
        node.dependency_ids = deps.to_vec();
        node.data_node_id = Some(output);
        node.clear_data_on_compute = true;
        let id = node.id;
        self.store.save(Node::Compute(node)).unwrap();
        id
    }

    pub fn update(&self, id: NodeId, edit: impl FnOnce(&mut ComputeNode)) {
        let mut node = self.node(id);
        edit(&mut node);
        self.store.save(Node::Compute(node)).unwrap();
    }

    pub fn node(&self, id: NodeId) -> ComputeNode {
        match self.store.get(id).unwrap() {
            Some(Node::Compute(node)) => node,
            other => panic!("expected compute node, got {other:?}"),
        }
    }

    pub fn data_node(&self, id: NodeId) -> DataNode {
        match self.store.get(id).unwrap() {
            Some(Node::Data(node)) => node,
            other => panic!("expected data node, got {other:?}"),
        }
    }

    fn write(&self, node: &DataNode, rows: Vec<Value>) {
        let scope = self.scope();
        let dataset = scope.dataset(&node.dataset_spec()).unwrap();
        dataset.add(rows.into_iter().map(rec).collect()).unwrap();
    }

    pub fn append(&self, data: NodeId, rows: Vec<Value>) {
        self.write(&self.data_node(data), rows);
    }

    /// Visible rows of a data node without surrogate ids, sorted.
    pub fn rows(&self, data: NodeId) -> Vec<Value> {
        let node = self.data_node(data);
        let scope = self.scope();
        let records = scope
            .dataset(&node.dataset_spec())
            .unwrap()
            .all(&Where::new(), None, 0)
            .unwrap();
        sorted(
            records
                .into_iter()
                .map(|mut r| {
                    r.remove(SYSTEM_ID);
                    Value::Object(r)
                })
                .collect(),
        )
    }
}
