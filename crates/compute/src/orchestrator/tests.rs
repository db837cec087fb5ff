use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dataflow_core::{ComputeConfig, FieldType, Record, Schema};
use dataflow_storage::{BackendRegistry, ConnectionScope, MemoryBackend, Where};
use serde_json::{json, Value};
use uuid::Uuid;

use super::*;
use crate::computation::{JoinConfig, SelectConfig};
use crate::events::{CollectingSink, ComputeEvent, FinishState};
use crate::lock::LockGuard;
use crate::node::{ComputeKind, DataNode};
use crate::store::{MemoryNodeStore, NodeStore};

struct Fixture {
    backend: MemoryBackend,
    store: Arc<MemoryNodeStore>,
    registry: Arc<BackendRegistry>,
    sink: Arc<CollectingSink>,
    orchestrator: Orchestrator,
}

fn fixture() -> Fixture {
    let backend = MemoryBackend::new("mem");
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(backend.clone()));
    let registry = Arc::new(registry);
    let store = Arc::new(MemoryNodeStore::new());
    let sink = Arc::new(CollectingSink::new());
    let config = ComputeConfig {
        lock_poll_interval_ms: 5,
        lock_max_wait_secs: 5,
        max_parallel_processes: 2,
        sequential: false,
    };
    let orchestrator = Orchestrator::new(config, store.clone(), Arc::clone(&registry))
        .with_event_sink(sink.clone());
    Fixture {
        backend,
        store,
        registry,
        sink,
        orchestrator,
    }
}

impl Fixture {
    fn data(&self, name: &str, rows: Vec<Value>) -> NodeId {
        let mut schema = Schema::new();
        schema.insert("id".into(), FieldType::Integer);
        let node = DataNode {
            id: Uuid::new_v4(),
            name: name.into(),
            backend: "mem".into(),
            database: "db".into(),
            dataset: None,
            indexes: vec![],
            schema,
            use_double_buffering: false,
        };
        let scope = ConnectionScope::new(Arc::clone(&self.registry));
        let dataset = scope.dataset(&node.dataset_spec()).unwrap();
        let records: Vec<Record> = rows.into_iter().filter_map(|v| v.as_object().cloned()).collect();
        dataset.add(records).unwrap();
        let id = node.id;
        self.store.save(Node::Data(node)).unwrap();
        id
    }

    fn select(&self, name: &str, deps: &[NodeId], output: Option<NodeId>) -> NodeId {
        let mut node = ComputeNode::new(
            name,
            ComputeKind::Select(SelectConfig {
                keys: vec!["id".into()],
            }),
        );
        node.dependency_ids = deps.to_vec();
        node.data_node_id = output;
        node.clear_data_on_compute = true;
        let id = node.id;
        self.store.save(Node::Compute(node)).unwrap();
        id
    }

    fn compute_node(&self, id: NodeId) -> ComputeNode {
        match self.store.get(id).unwrap() {
            Some(Node::Compute(node)) => node,
            other => panic!("expected compute node, got {other:?}"),
        }
    }

    fn count(&self, data: NodeId) -> u64 {
        let Some(Node::Data(node)) = self.store.get(data).unwrap() else {
            panic!("expected data node");
        };
        let scope = ConnectionScope::new(Arc::clone(&self.registry));
        scope.dataset(&node.dataset_spec()).unwrap().count(&Where::new()).unwrap()
    }
}

#[test]
fn validation_collects_every_problem() {
    let fx = fixture();
    let mut node = ComputeNode::new("", ComputeKind::Join(JoinConfig::default()));
    node.dependency_ids = vec![Uuid::new_v4()];

    let result = fx.orchestrator.validate(&node).unwrap();
    assert!(!result.is_valid());
    assert_eq!(result.errors_at("name").count(), 1);
    assert_eq!(result.errors_at("key1").count(), 1);
    assert_eq!(result.errors_at("data_node_id").count(), 1);
    // arity and the missing dependency
    assert_eq!(result.errors_at("dependency_ids").count(), 2);
}

#[test]
fn invalid_node_is_not_computed() {
    let fx = fixture();
    let source = fx.data("source", vec![json!({"id": 1})]);
    let id = fx.select("orphan", &[source], None);

    let outcome = fx.orchestrator.recompute(id, false).unwrap();
    assert!(matches!(outcome, ComputeOutcome::Invalid(ref r) if r.errors_at("data_node_id").count() == 1));
    assert!(fx.sink.events().is_empty());
    assert!(!fx.compute_node(id).lock.is_computing());
}

#[test]
fn compute_then_up_to_date() {
    let fx = fixture();
    let source = fx.data("source", vec![json!({"id": 1}), json!({"id": 2})]);
    let out = fx.data("out", vec![]);
    let id = fx.select("ids", &[source], Some(out));

    let first = fx.orchestrator.recompute(id, false).unwrap();
    assert!(matches!(first, ComputeOutcome::Computed { records_written: 2, .. }));
    assert_eq!(fx.count(out), 2);
    assert!(fx.compute_node(id).last_compute_starting_time.is_some());

    assert_eq!(fx.orchestrator.recompute(id, false).unwrap(), ComputeOutcome::UpToDate);
    assert!(matches!(
        fx.orchestrator.recompute(id, true).unwrap(),
        ComputeOutcome::Computed { .. }
    ));
    assert_eq!(fx.count(out), 2);
    assert_eq!(fx.orchestrator.metrics().computes["ids"], 2);
}

#[test]
fn cyclic_graph_is_refused() {
    let fx = fixture();
    let out = fx.data("out", vec![]);
    let a = fx.select("a", &[], Some(out));
    let b = fx.select("b", &[a], Some(out));
    let mut node_a = fx.compute_node(a);
    node_a.dependency_ids = vec![b];
    fx.store.save(Node::Compute(node_a)).unwrap();

    let outcome = fx.orchestrator.recompute(a, false).unwrap();
    assert!(matches!(outcome, ComputeOutcome::Invalid(ref r) if r.errors_at("dependency_ids").count() >= 1));
    assert!(fx.orchestrator.levels().unwrap().is_empty());
}

#[test]
fn failure_releases_lock_and_reports_error() {
    let fx = fixture();
    let source = fx.data("source", vec![json!({"id": 1})]);
    let out = fx.data("out", vec![]);
    let id = fx.select("ids", &[source], Some(out));
    fx.backend.inject_add_failure("db", "out", 0);

    let err = fx.orchestrator.recompute(id, false).unwrap_err();
    assert!(matches!(err, ComputeError::Batch { index: 0, .. }));

    let node = fx.compute_node(id);
    assert!(!node.lock.is_computing());
    assert!(node.lock.last_heartbeat_time.is_some());
    assert!(node.last_compute_starting_time.is_none());
    assert_eq!(fx.orchestrator.metrics().failures["ids"], 1);

    let finished: Vec<_> = fx
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ComputeEvent::ComputingFinished { state, error, .. } => Some((state, error)),
            _ => None,
        })
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].0, FinishState::Error);
    assert!(finished[0].1.as_deref().unwrap_or_default().contains("injected"));
}

/// Store whose lock release always fails.
struct RefusesRelease(Arc<MemoryNodeStore>);

impl NodeStore for RefusesRelease {
    fn get(&self, id: NodeId) -> Result<Option<Node>, ComputeError> {
        self.0.get(id)
    }
    fn find_by_name(&self, name: &str) -> Result<Option<Node>, ComputeError> {
        self.0.find_by_name(name)
    }
    fn list(&self) -> Result<Vec<Node>, ComputeError> {
        self.0.list()
    }
    fn save(&self, node: Node) -> Result<(), ComputeError> {
        self.0.save(node)
    }
    fn try_acquire_lock(
        &self,
        id: NodeId,
        execution: Uuid,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, ComputeError> {
        self.0.try_acquire_lock(id, execution, now)
    }
    fn heartbeat(&self, id: NodeId, now: chrono::DateTime<Utc>) -> Result<(), ComputeError> {
        self.0.heartbeat(id, now)
    }
    fn release_lock(&self, _id: NodeId) -> Result<(), ComputeError> {
        Err(ComputeError::Store("release refused".into()))
    }
    fn set_last_compute_starting_time(
        &self,
        id: NodeId,
        at: chrono::DateTime<Utc>,
    ) -> Result<(), ComputeError> {
        self.0.set_last_compute_starting_time(id, at)
    }
}

#[test]
fn failed_release_is_reported_as_error() {
    let fx = fixture();
    let source = fx.data("source", vec![json!({"id": 1})]);
    let out = fx.data("out", vec![]);
    let id = fx.select("ids", &[source], Some(out));

    let sink = Arc::new(CollectingSink::new());
    let orchestrator = Orchestrator::new(
        fx.orchestrator.config().clone(),
        Arc::new(RefusesRelease(fx.store.clone())),
        Arc::clone(&fx.registry),
    )
    .with_event_sink(sink.clone());

    let err = orchestrator.recompute(id, false).unwrap_err();
    assert!(err.to_string().contains("release refused"), "{err}");
    assert_eq!(orchestrator.metrics().failures["ids"], 1);

    let states: Vec<FinishState> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ComputeEvent::ComputingFinished { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![FinishState::Error]);
}

#[test]
fn waiter_returns_when_holder_finishes() {
    let fx = fixture();
    let source = fx.data("source", vec![json!({"id": 1})]);
    let out = fx.data("out", vec![]);
    let id = fx.select("ids", &[source], Some(out));
    let node = fx.compute_node(id);

    let guard = LockGuard::try_acquire(fx.store.clone(), &node).unwrap().unwrap();
    let outcome = std::thread::scope(|s| {
        let waiter = s.spawn(|| fx.orchestrator.compute(id, false));
        std::thread::sleep(Duration::from_millis(50));
        guard.release().unwrap();
        waiter.join().unwrap()
    })
    .unwrap();

    assert_eq!(outcome, ComputeOutcome::ComputedElsewhere);
    assert_eq!(fx.count(out), 0);
}

#[test]
fn due_nodes_follow_their_interval() {
    let fx = fixture();
    let source = fx.data("source", vec![]);
    let out = fx.data("out", vec![]);
    let id = fx.select("ids", &[source], Some(out));
    assert!(fx.orchestrator.due_for_recompute(Utc::now()).unwrap().is_empty());

    let mut node = fx.compute_node(id);
    node.recompute_interval = 60;
    fx.store.save(Node::Compute(node)).unwrap();
    assert_eq!(fx.orchestrator.due_for_recompute(Utc::now()).unwrap(), vec![id]);
}

#[test]
fn force_release_clears_a_stuck_lock() {
    let fx = fixture();
    let source = fx.data("source", vec![]);
    let out = fx.data("out", vec![]);
    let id = fx.select("ids", &[source], Some(out));
    let node = fx.compute_node(id);

    let guard = LockGuard::try_acquire(fx.store.clone(), &node).unwrap().unwrap();
    std::mem::forget(guard);
    assert!(fx.compute_node(id).lock.is_computing());

    fx.orchestrator.force_computing_lock_release(id).unwrap();
    assert!(!fx.compute_node(id).lock.is_computing());
}
