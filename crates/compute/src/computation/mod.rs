//! Node types: what a compute node does with its dependencies.
//!
//! Every node type is a plain config struct implementing [`Computation`].
//! The orchestrator owns locking, buffering and scheduling; a computation
//! only declares its shape and turns one batch of input into output records.

mod filter;
mod join;
mod select;

use std::sync::Arc;

use dataflow_core::{Record, Schema};
use dataflow_storage::{ConnectionScope, DatasetRef, DatasetSpec, Where};

use crate::error::ComputeError;
use crate::node::ComputeNode;
use crate::validation::{Arity, ValidationResult};

pub use filter::FilterConfig;
pub use join::{JoinConfig, JoinType};
pub use select::SelectConfig;

/// Everything a computation may touch outside of batch execution.
pub struct NodeContext<'a> {
    pub node: &'a ComputeNode,
    /// Dataset of each dependency, in `dependency_ids` order.
    pub dependencies: &'a [DatasetSpec],
    pub output: &'a DatasetSpec,
    pub scope: &'a ConnectionScope,
}

impl NodeContext<'_> {
    pub fn dependency(&self, index: usize) -> Result<Arc<dyn DatasetRef>, ComputeError> {
        open_dependency(self.scope, self.dependencies, index)
    }
}

/// Per-worker view used while computing one batch.
pub struct BatchContext<'a> {
    scope: &'a ConnectionScope,
    dependencies: &'a [DatasetSpec],
}

impl<'a> BatchContext<'a> {
    pub fn new(scope: &'a ConnectionScope, dependencies: &'a [DatasetSpec]) -> Self {
        Self {
            scope,
            dependencies,
        }
    }

    pub fn dependency(&self, index: usize) -> Result<Arc<dyn DatasetRef>, ComputeError> {
        open_dependency(self.scope, self.dependencies, index)
    }
}

fn open_dependency(
    scope: &ConnectionScope,
    dependencies: &[DatasetSpec],
    index: usize,
) -> Result<Arc<dyn DatasetRef>, ComputeError> {
    let spec = dependencies.get(index).ok_or_else(|| {
        ComputeError::Unexpected(format!(
            "dependency {index} requested but only {} declared",
            dependencies.len()
        ))
    })?;
    Ok(scope.dataset(spec)?)
}

pub trait Computation: Send + Sync {
    /// Number of dependencies this node type accepts.
    fn arity(&self) -> Arity;

    /// Configuration checks that need no storage access.
    fn validate(&self, result: &mut ValidationResult);

    /// Checks against the dependency datasets, e.g. field names against
    /// declared schemas.
    fn validate_against(
        &self,
        _ctx: &NodeContext<'_>,
        _result: &mut ValidationResult,
    ) -> Result<(), ComputeError> {
        Ok(())
    }

    /// Fields the output dataset must declare.
    fn required_schema(&self, ctx: &NodeContext<'_>) -> Result<Schema, ComputeError>;

    /// Restricts which records of dependency 0 are partitioned into batches.
    fn source_filter(&self) -> Where {
        Where::new()
    }

    fn pre_compute(&self, _ctx: &NodeContext<'_>) -> Result<(), ComputeError> {
        Ok(())
    }

    /// Compute entirely inside the backend. `None` falls back to batches.
    fn push_down(&self, _ctx: &NodeContext<'_>) -> Result<Option<u64>, ComputeError> {
        Ok(None)
    }

    /// Output records for the dependency-0 records matching `query`.
    fn compute_batch(
        &self,
        ctx: &BatchContext<'_>,
        query: &Where,
    ) -> Result<Vec<Record>, ComputeError>;
}
