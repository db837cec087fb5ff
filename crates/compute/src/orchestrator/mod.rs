//! Entry point for recomputing nodes.
//!
//! [`Orchestrator::recompute`] brings a node's dependencies up to date (in
//! parallel) and then computes the node itself under its computing lock.
//! Every public call starts a fresh run: a new [`NodeResolver`] cache and a
//! new connection scope, both dropped when the call returns.

mod compute;
mod recompute;
#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dataflow_core::ComputeConfig;
use dataflow_storage::{BackendRegistry, ConnectionScope};
use serde::Serialize;
use tracing::info;

use crate::error::ComputeError;
use crate::events::{EventSink, TracingSink};
use crate::executor::WorkerPool;
use crate::graph::{DependencyGraph, Explain};
use crate::lock;
use crate::metrics::ComputeMetrics;
use crate::node::{ComputeNode, Node, NodeId};
use crate::store::{NodeResolver, NodeStore};
use crate::validation::ValidationResult;

/// What a `compute` or `recompute` call ended up doing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ComputeOutcome {
    Computed {
        records_written: u64,
        batches: usize,
        pushed_down: bool,
    },
    /// Already fresh; no lock taken.
    UpToDate,
    /// Another holder computed the node while this call waited.
    ComputedElsewhere,
    /// Configuration errors blocked the compute.
    Invalid(ValidationResult),
}

pub struct Orchestrator {
    pub(super) config: ComputeConfig,
    pub(super) store: Arc<dyn NodeStore>,
    pub(super) registry: Arc<BackendRegistry>,
    pub(super) sink: Arc<dyn EventSink>,
    pub(super) metrics: Arc<RwLock<ComputeMetrics>>,
}

impl Orchestrator {
    pub fn new(
        config: ComputeConfig,
        store: Arc<dyn NodeStore>,
        registry: Arc<BackendRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            sink: Arc::new(TracingSink),
            metrics: Arc::new(RwLock::new(ComputeMetrics::default())),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &ComputeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    pub fn metrics(&self) -> ComputeMetrics {
        self.metrics.read().map(|m| m.clone()).unwrap_or_default()
    }

    fn new_run(&self) -> (NodeResolver, ConnectionScope) {
        (
            NodeResolver::new(Arc::clone(&self.store)),
            ConnectionScope::new(Arc::clone(&self.registry)),
        )
    }

    pub(super) fn pool_for(&self, node: &ComputeNode) -> WorkerPool {
        WorkerPool::new(self.config.resolved_workers(node.max_parallel_processes))
    }

    /// Resolve a node by id or name.
    pub fn lookup(&self, key: &str) -> Result<Node, ComputeError> {
        NodeResolver::new(Arc::clone(&self.store)).lookup(key)
    }

    /// Bring `node_id` and everything it depends on up to date.
    pub fn recompute(&self, node_id: NodeId, force: bool) -> Result<ComputeOutcome, ComputeError> {
        let (resolver, scope) = self.new_run();
        self.recompute_node(&resolver, &scope, node_id, 0, force)
    }

    /// Compute `node_id` alone, assuming its dependencies are current.
    pub fn compute(&self, node_id: NodeId, force: bool) -> Result<ComputeOutcome, ComputeError> {
        let (resolver, scope) = self.new_run();
        self.compute_node(&resolver, &scope, node_id, 0, force)
    }

    /// Validate a (possibly unsaved) compute node against the stored graph.
    pub fn validate(&self, node: &ComputeNode) -> Result<ValidationResult, ComputeError> {
        let (resolver, scope) = self.new_run();
        self.validate_node(&resolver, &scope, node)
    }

    pub fn is_updated(&self, node_id: NodeId) -> Result<bool, ComputeError> {
        let (resolver, scope) = self.new_run();
        DependencyGraph::new(&resolver, &scope).is_updated(node_id)
    }

    pub fn dependency_level(&self, node_id: NodeId) -> Result<usize, ComputeError> {
        let (resolver, scope) = self.new_run();
        DependencyGraph::new(&resolver, &scope).dependency_level(node_id)
    }

    pub fn all_dependencies(&self, node_id: NodeId) -> Result<Vec<NodeId>, ComputeError> {
        let (resolver, scope) = self.new_run();
        DependencyGraph::new(&resolver, &scope).all_dependencies(node_id)
    }

    pub fn explain(&self, node_id: NodeId) -> Result<Explain, ComputeError> {
        let (resolver, scope) = self.new_run();
        DependencyGraph::new(&resolver, &scope).explain(node_id)
    }

    /// Compute node names grouped by dependency level. Nodes on a cycle are
    /// left out.
    pub fn levels(&self) -> Result<BTreeMap<usize, Vec<String>>, ComputeError> {
        let (resolver, scope) = self.new_run();
        let graph = DependencyGraph::new(&resolver, &scope);
        let mut levels: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for node in self.store.list()? {
            let Node::Compute(node) = node else { continue };
            match graph.dependency_level(node.id) {
                Ok(level) => levels.entry(level).or_default().push(node.name),
                Err(ComputeError::CyclicDependency(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(levels)
    }

    /// Clear a computing lock left behind by a crashed holder.
    pub fn force_computing_lock_release(&self, node_id: NodeId) -> Result<(), ComputeError> {
        lock::force_release(self.store.as_ref(), node_id)
    }

    /// Compute nodes whose recompute interval has elapsed at `now`.
    pub fn due_for_recompute(&self, now: DateTime<Utc>) -> Result<Vec<NodeId>, ComputeError> {
        let due: Vec<NodeId> = self
            .store
            .list()?
            .iter()
            .filter_map(Node::as_compute)
            .filter(|n| n.needs_automatic_recomputing(now))
            .map(|n| n.id)
            .collect();
        if !due.is_empty() {
            info!(count = due.len(), "nodes due for automatic recompute");
        }
        Ok(due)
    }
}
