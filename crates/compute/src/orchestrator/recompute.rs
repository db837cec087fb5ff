use chrono::Utc;
use dataflow_storage::ConnectionScope;
use tracing::{debug, warn};

use super::{ComputeOutcome, Orchestrator};
use crate::error::ComputeError;
use crate::graph::DependencyGraph;
use crate::node::{Node, NodeId};
use crate::store::NodeResolver;
use crate::validation::ValidationResult;

impl Orchestrator {
    pub(super) fn recompute_node(
        &self,
        resolver: &NodeResolver,
        scope: &ConnectionScope,
        node_id: NodeId,
        depth: usize,
        force: bool,
    ) -> Result<ComputeOutcome, ComputeError> {
        let node = match resolver.get(node_id)? {
            Node::Data(_) => return Ok(ComputeOutcome::UpToDate),
            Node::Compute(node) => node,
        };
        debug!(node = %node.name, depth, force, "recompute requested");

        // Walking a cyclic graph would never terminate.
        let mut cycles = ValidationResult::new();
        DependencyGraph::new(resolver, scope).ensure_no_cyclic_dependencies(&node, &mut cycles);
        if !cycles.is_valid() {
            warn!(node = %node.name, errors = %cycles.summary(), "refusing to recompute cyclic graph");
            return Ok(ComputeOutcome::Invalid(cycles));
        }

        self.store.heartbeat(node.id, Utc::now())?;

        self.pool_for(&node).run(
            scope,
            node.dependency_ids.clone(),
            |worker_scope, _, dep_id| {
                self.recompute_dependency(resolver, worker_scope, dep_id, depth + 1, force)
            },
        )?;

        for dep_id in &node.dependency_ids {
            resolver.reload(*dep_id)?;
        }
        self.store.heartbeat(node.id, Utc::now())?;

        self.compute_node(resolver, scope, node_id, depth, force)
    }

    fn recompute_dependency(
        &self,
        resolver: &NodeResolver,
        scope: &ConnectionScope,
        dep_id: NodeId,
        depth: usize,
        force: bool,
    ) -> Result<(), ComputeError> {
        let dep = match resolver.get(dep_id)? {
            Node::Data(_) => return Ok(()),
            Node::Compute(dep) => dep,
        };
        if !force && DependencyGraph::new(resolver, scope).is_updated(dep_id)? {
            debug!(node = %dep.name, "dependency already up to date");
            return Ok(());
        }
        match self.recompute_node(resolver, scope, dep_id, depth, force)? {
            ComputeOutcome::Invalid(result) => Err(ComputeError::DependencyNotReady {
                name: dep.name,
                reason: result.summary(),
            }),
            _ => Ok(()),
        }
    }
}
