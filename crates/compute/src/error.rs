use std::time::Duration;

use dataflow_core::CoreError;
use dataflow_storage::StorageError;

/// Error type for node orchestration and computation.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Node '{0}' is not a compute node")]
    NotComputeNode(String),
    #[error("Node '{0}' has no output data node")]
    MissingOutput(String),
    #[error("Timed out after {waited:?} waiting for the computing lock of '{node}'")]
    LockTimeout { node: String, waited: Duration },
    #[error("Dependency '{name}' is not ready: {reason}")]
    DependencyNotReady { name: String, reason: String },
    #[error("Cyclic dependency through node '{0}'")]
    CyclicDependency(String),
    #[error("Batch {index} failed: {source}")]
    Batch {
        index: usize,
        #[source]
        source: Box<ComputeError>,
    },
    #[error("Worker failed: {0}")]
    RemoteExecution(String),
    #[error("Worker pool error: {0}")]
    Pool(String),
    #[error("Graph definition error: {0}")]
    Definition(String),
    #[error("Node store error: {0}")]
    Store(String),
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}
