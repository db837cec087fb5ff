//! Multi-node graphs: staleness propagation, double-buffered isolation,
//! concurrent recomputes and YAML-defined graphs.

mod common;

use std::sync::Arc;

use dataflow_compute::{
    ComputeError, ComputeEvent, ComputeKind, ComputeNode, ComputeOutcome, DataNode,
    FileNodeStore, FilterConfig, GraphDefinition, Node, NodeStore, Orchestrator, SelectConfig,
};
use dataflow_core::{ComputeConfig, FieldType, StorageConfig};
use dataflow_storage::{BackendRegistry, ConnectionScope, MemoryBackend, Op, Where};
use serde_json::json;

use common::{sorted, Harness};

const INT: FieldType = FieldType::Integer;

fn big_spenders() -> ComputeKind {
    ComputeKind::Filter(FilterConfig {
        filter: Where::new().and("amount", Op::Gt, 10),
    })
}

fn started(h: &Harness) -> Vec<String> {
    h.sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ComputeEvent::ComputingStarted { node, .. } => Some(node),
            _ => None,
        })
        .collect()
}

#[test]
fn recompute_walks_the_chain_and_then_stays_fresh() {
    let h = Harness::new();
    let source = h.data(
        "payments",
        &[("user", INT), ("amount", INT)],
        vec![
            json!({"user": 1, "amount": 5}),
            json!({"user": 2, "amount": 50}),
            json!({"user": 3, "amount": 20}),
        ],
    );
    let filtered = h.empty("big_payments");
    let users = h.empty("big_users");
    let filter = h.compute("filter", big_spenders(), &[source], filtered);
    let select = h.compute(
        "select",
        ComputeKind::Select(SelectConfig {
            keys: vec!["user".into()],
        }),
        &[filter],
        users,
    );

    assert!(!h.orchestrator.is_updated(select).unwrap());
    assert_eq!(h.orchestrator.dependency_level(select).unwrap(), 1);

    let outcome = h.orchestrator.recompute(select, false).unwrap();
    assert!(matches!(outcome, ComputeOutcome::Computed { records_written: 2, .. }));
    assert_eq!(started(&h), vec!["filter", "select"]);
    assert_eq!(h.rows(users), sorted(vec![json!({"user": 2}), json!({"user": 3})]));
    assert!(h.orchestrator.is_updated(select).unwrap());

    assert_eq!(h.orchestrator.recompute(select, false).unwrap(), ComputeOutcome::UpToDate);
    assert_eq!(started(&h).len(), 2);

    h.append(source, vec![json!({"user": 4, "amount": 11})]);
    assert!(!h.orchestrator.is_updated(select).unwrap());
    h.orchestrator.recompute(select, false).unwrap();
    assert_eq!(started(&h), vec!["filter", "select", "filter", "select"]);
    assert_eq!(h.rows(users).len(), 3);

    let levels = h.orchestrator.levels().unwrap();
    assert_eq!(levels[&0], vec!["filter".to_string()]);
    assert_eq!(levels[&1], vec!["select".to_string()]);
}

#[test]
fn failed_compute_leaves_previous_output_visible() {
    let h = Harness::generic();
    let source = h.data(
        "events",
        &[("n", INT)],
        (0..10).map(|n| json!({"n": n})).collect(),
    );
    let out = h.empty("copy");
    let id = h.compute(
        "copy_rows",
        ComputeKind::Select(SelectConfig {
            keys: vec!["n".into()],
        }),
        &[source],
        out,
    );
    h.update(id, |n| {
        n.limit_per_process = 2;
        n.max_parallel_processes = Some(1);
    });

    h.orchestrator.recompute(id, false).unwrap();
    assert_eq!(h.rows(out).len(), 10);

    h.append(source, (10..14).map(|n| json!({"n": n})).collect());
    h.backend.inject_add_failure(common::DATABASE, "copy", 2);
    let err = h.orchestrator.recompute(id, false).unwrap_err();
    assert!(err.to_string().contains("injected add failure"), "{err}");

    assert_eq!(h.rows(out).len(), 10);
    assert!(!h.node(id).lock.is_computing());
    assert_eq!(h.backend.open_connections(), 0);

    h.backend.clear_faults();
    h.orchestrator.recompute(id, false).unwrap();
    assert_eq!(h.rows(out).len(), 14);
}

#[test]
fn concurrent_recomputes_do_not_duplicate_output() {
    let h = Harness::generic();
    let source = h.data(
        "numbers",
        &[("n", INT)],
        (0..200).map(|n| json!({"n": n})).collect(),
    );
    let out = h.empty("copy");
    let id = h.compute(
        "copy_rows",
        ComputeKind::Select(SelectConfig {
            keys: vec!["n".into()],
        }),
        &[source],
        out,
    );
    h.update(id, |n| n.limit_per_process = 5);

    let orchestrator = &h.orchestrator;
    let outcomes: Vec<ComputeOutcome> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|_| s.spawn(move || orchestrator.recompute(id, false)))
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().unwrap().unwrap())
            .collect()
    });

    assert!(outcomes
        .iter()
        .any(|o| matches!(o, ComputeOutcome::Computed { .. })));
    assert!(outcomes.iter().all(|o| !matches!(o, ComputeOutcome::Invalid(_))));
    assert_eq!(h.rows(out).len(), 200);
    assert!(!h.node(id).lock.is_computing());
}

#[test]
fn dependency_failure_aborts_the_parent() {
    let h = Harness::new();
    let source = h.data("payments", &[("amount", INT)], vec![json!({"amount": 50})]);
    let filtered = h.empty("big_payments");
    let out = h.empty("out");
    let filter = h.compute("filter", big_spenders(), &[source], filtered);
    let select = h.compute(
        "select",
        ComputeKind::Select(SelectConfig {
            keys: vec!["amount".into()],
        }),
        &[filter],
        out,
    );
    // Leave the dependency without an output data node.
    h.update(filter, |n| n.data_node_id = None);

    let err = h.orchestrator.recompute(select, false).unwrap_err();
    assert!(
        matches!(err, ComputeError::DependencyNotReady { ref name, .. } if name == "filter"),
        "{err}"
    );
    assert!(started(&h).is_empty());
}

#[test]
fn yaml_graph_round_trips_through_a_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let graph_path = dir.path().join("graph.yml");
    std::fs::write(
        &graph_path,
        r#"
data_nodes:
  - name: users
    backend: mem
    schema: { id: integer, name: string }
    records:
      - { id: 1, name: ada }
      - { id: 2, name: bob }
  - name: orders
    backend: mem
    schema: { user_id: integer, total: integer }
    records:
      - { user_id: 2, total: 30 }
  - name: user_orders
    backend: mem
compute_nodes:
  - name: join_orders
    dependencies: [users, orders]
    output: user_orders
    clear_data_on_compute: true
    kind: { type: join, key1: id, key2: user_id, join_type: left }
"#,
    )
    .unwrap();

    let backend = MemoryBackend::new("mem");
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(backend.clone()));
    let registry = Arc::new(registry);
    let state = dir.path().join("state.json");

    let definition = GraphDefinition::load(&graph_path).unwrap();
    let join_id = {
        let store: Arc<dyn NodeStore> = Arc::new(FileNodeStore::open(&state).unwrap());
        let scope = ConnectionScope::new(Arc::clone(&registry));
        let graph = definition
            .install(store.as_ref(), &scope, &StorageConfig::default())
            .unwrap();
        drop(scope);

        let orchestrator = Orchestrator::new(common::config(), store, Arc::clone(&registry));
        let id = graph.id("join_orders").unwrap();
        assert!(matches!(
            orchestrator.recompute(id, false).unwrap(),
            ComputeOutcome::Computed { records_written: 2, .. }
        ));
        id
    };

    let reopened: Arc<dyn NodeStore> = Arc::new(FileNodeStore::open(&state).unwrap());
    let orchestrator = Orchestrator::new(common::config(), reopened, Arc::clone(&registry));
    assert_eq!(orchestrator.lookup("join_orders").unwrap().id(), join_id);
    assert!(orchestrator.is_updated(join_id).unwrap());
    assert_eq!(orchestrator.recompute(join_id, false).unwrap(), ComputeOutcome::UpToDate);
    assert!(orchestrator
        .explain(join_id)
        .unwrap()
        .to_string()
        .starts_with("join_orders [join] level=0 fresh"));
}

#[test]
fn file_store_survives_parallel_heartbeats() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new("mem");
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(backend.clone()));
    let registry = Arc::new(registry);
    let store: Arc<dyn NodeStore> =
        Arc::new(FileNodeStore::open(dir.path().join("state.json")).unwrap());

    let data_node = |name: &str| DataNode {
        id: uuid::Uuid::new_v4(),
        name: name.into(),
        backend: "mem".into(),
        database: "db".into(),
        dataset: None,
        indexes: vec![],
        schema: Default::default(),
        use_double_buffering: false,
    };
    let (source, out) = (data_node("numbers"), data_node("copy"));
    {
        let scope = ConnectionScope::new(Arc::clone(&registry));
        let rows = (0..400)
            .map(|n| common::rec(json!({ "n": n })))
            .collect();
        scope.dataset(&source.dataset_spec()).unwrap().add(rows).unwrap();
    }
    let mut node = ComputeNode::new(
        "copy_rows",
        ComputeKind::Select(SelectConfig {
            keys: vec!["n".into()],
        }),
    );
    node.dependency_ids = vec![source.id];
    node.data_node_id = Some(out.id);
    node.clear_data_on_compute = true;
    node.limit_per_process = 1;
    let (id, out_spec) = (node.id, out.dataset_spec());
    store.save(Node::Data(source)).unwrap();
    store.save(Node::Data(out)).unwrap();
    store.save(Node::Compute(node)).unwrap();

    let config = ComputeConfig {
        max_parallel_processes: 8,
        ..common::config()
    };
    let orchestrator = Orchestrator::new(config, Arc::clone(&store), Arc::clone(&registry));
    for _ in 0..3 {
        let outcome = orchestrator.recompute(id, true).unwrap();
        assert!(matches!(outcome, ComputeOutcome::Computed { records_written: 400, .. }));
    }

    let scope = ConnectionScope::new(Arc::clone(&registry));
    assert_eq!(scope.dataset(&out_spec).unwrap().count(&Where::new()).unwrap(), 400);
    assert!(!store.get(id).unwrap().unwrap().as_compute().unwrap().lock.is_computing());
}
