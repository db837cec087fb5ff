//! Lazy view over the nodes reachable through `dependency_ids`.
//!
//! Nothing is materialised up front: every query walks the resolver, so the
//! view always reflects the records cached for the current run.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use dataflow_storage::ConnectionScope;
use serde::Serialize;

use crate::error::ComputeError;
use crate::node::{ComputeNode, Node, NodeId};
use crate::store::NodeResolver;
use crate::validation::ValidationResult;

pub struct DependencyGraph<'a> {
    resolver: &'a NodeResolver,
    scope: &'a ConnectionScope,
}

impl<'a> DependencyGraph<'a> {
    pub fn new(resolver: &'a NodeResolver, scope: &'a ConnectionScope) -> Self {
        Self { resolver, scope }
    }

    /// 0 without compute dependencies, otherwise one more than the deepest
    /// compute dependency.
    pub fn dependency_level(&self, id: NodeId) -> Result<usize, ComputeError> {
        self.level_of(id, &mut HashSet::new(), &mut HashMap::new())
    }

    fn level_of(
        &self,
        id: NodeId,
        visiting: &mut HashSet<NodeId>,
        memo: &mut HashMap<NodeId, usize>,
    ) -> Result<usize, ComputeError> {
        if let Some(level) = memo.get(&id) {
            return Ok(*level);
        }
        let node = self.resolver.get(id)?;
        if !visiting.insert(id) {
            return Err(ComputeError::CyclicDependency(node.name().to_string()));
        }
        let mut level = 0;
        for dep_id in node.dependency_ids() {
            if let Node::Compute(_) = self.resolver.get(*dep_id)? {
                level = level.max(self.level_of(*dep_id, visiting, memo)? + 1);
            }
        }
        visiting.remove(&id);
        memo.insert(id, level);
        Ok(level)
    }

    /// Deduplicated transitive closure, in breadth-first discovery order.
    pub fn all_dependencies(&self, id: NodeId) -> Result<Vec<NodeId>, ComputeError> {
        let root = self.resolver.get(id)?;
        let mut seen = HashSet::from([id]);
        let mut order = Vec::new();
        let mut queue: VecDeque<NodeId> = root.dependency_ids().iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            order.push(next);
            queue.extend(self.resolver.get(next)?.dependency_ids().iter().copied());
        }
        Ok(order)
    }

    /// Add an error on `dependency_ids` for every declared dependency that
    /// sits on a cycle. `node` may carry unsaved dependency edits.
    pub fn ensure_no_cyclic_dependencies(&self, node: &ComputeNode, result: &mut ValidationResult) {
        for dep_id in &node.dependency_ids {
            let reachable = self.reachable_from(*dep_id, node);
            if reachable.contains(dep_id) {
                let name = self
                    .resolver
                    .get(*dep_id)
                    .map(|n| n.name().to_string())
                    .unwrap_or_else(|_| node.name.clone());
                result.error(
                    "dependency_ids",
                    format!("dependency on node {dep_id} ('{name}') is cyclic"),
                );
            }
        }
    }

    /// Ids reachable from `start` through at least one edge. Unknown ids are
    /// skipped; they are reported by validation separately.
    fn reachable_from(&self, start: NodeId, current: &ComputeNode) -> HashSet<NodeId> {
        let edges_of = |id: NodeId| -> Vec<NodeId> {
            if id == current.id {
                return current.dependency_ids.clone();
            }
            self.resolver
                .get(id)
                .map(|n| n.dependency_ids().to_vec())
                .unwrap_or_default()
        };

        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeId> = edges_of(start).into();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(edges_of(next));
            }
        }
        seen
    }

    /// When readers of `node` could last observe a change.
    pub fn freshness(&self, node: &Node) -> Result<Option<DateTime<Utc>>, ComputeError> {
        match node {
            Node::Compute(c) => Ok(c.last_compute_starting_time),
            Node::Data(d) => Ok(self.scope.dataset(&d.dataset_spec())?.updated_at()?),
        }
    }

    /// Whether `id` and everything it depends on is up to date.
    pub fn is_updated(&self, id: NodeId) -> Result<bool, ComputeError> {
        self.updated(id, &mut HashSet::new(), &mut HashMap::new())
    }

    fn updated(
        &self,
        id: NodeId,
        visiting: &mut HashSet<NodeId>,
        memo: &mut HashMap<NodeId, bool>,
    ) -> Result<bool, ComputeError> {
        if let Some(known) = memo.get(&id) {
            return Ok(*known);
        }
        let node = match self.resolver.get(id)? {
            Node::Data(_) => return Ok(true),
            Node::Compute(node) => node,
        };
        let Some(own) = node.last_compute_starting_time else {
            memo.insert(id, false);
            return Ok(false);
        };
        if !visiting.insert(id) {
            return Ok(false);
        }

        let mut fresh = true;
        for dep_id in &node.dependency_ids {
            let dep = self.resolver.get(*dep_id)?;
            if !self.updated(*dep_id, visiting, memo)? {
                fresh = false;
                break;
            }
            // A data node that was never written has nothing newer to offer.
            let newer = match (self.freshness(&dep)?, &dep) {
                (Some(ts), _) => ts > own,
                (None, Node::Data(_)) => false,
                (None, Node::Compute(_)) => true,
            };
            if newer {
                fresh = false;
                break;
            }
        }

        visiting.remove(&id);
        memo.insert(id, fresh);
        Ok(fresh)
    }

    /// Tree of `id` and its dependencies with levels and freshness.
    pub fn explain(&self, id: NodeId) -> Result<Explain, ComputeError> {
        self.explain_node(id, &mut Vec::new())
    }

    fn explain_node(&self, id: NodeId, path: &mut Vec<NodeId>) -> Result<Explain, ComputeError> {
        let node = self.resolver.get(id)?;
        let (kind, computing) = match &node {
            Node::Data(_) => ("data", false),
            Node::Compute(c) => (c.kind.label(), c.lock.is_computing()),
        };
        let mut explain = Explain {
            id,
            name: node.name().to_string(),
            kind,
            level: self.dependency_level(id).ok(),
            updated: self.is_updated(id)?,
            freshness: self.freshness(&node)?,
            computing,
            cycle: path.contains(&id),
            dependencies: Vec::new(),
        };
        if explain.cycle {
            return Ok(explain);
        }
        path.push(id);
        for dep_id in node.dependency_ids() {
            explain.dependencies.push(self.explain_node(*dep_id, path)?);
        }
        path.pop();
        Ok(explain)
    }
}

/// Serialisable dependency tree produced by [`DependencyGraph::explain`].
#[derive(Debug, Clone, Serialize)]
pub struct Explain {
    pub id: NodeId,
    pub name: String,
    pub kind: &'static str,
    /// `None` when the node sits on a cycle.
    pub level: Option<usize>,
    pub updated: bool,
    pub freshness: Option<DateTime<Utc>>,
    pub computing: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cycle: bool,
    pub dependencies: Vec<Explain>,
}

impl Explain {
    fn write_tree(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let level = self
            .level
            .map_or_else(|| "-".to_string(), |l| l.to_string());
        let state = match (self.cycle, self.computing, self.updated) {
            (true, _, _) => "cycle",
            (_, true, _) => "computing",
            (_, _, true) => "fresh",
            _ => "stale",
        };
        writeln!(
            f,
            "{:indent$}{} [{}] level={} {}",
            "",
            self.name,
            self.kind,
            level,
            state,
            indent = depth * 2
        )?;
        for dep in &self.dependencies {
            dep.write_tree(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for Explain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_tree(f, 0)
    }
}
