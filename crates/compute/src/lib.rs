//! Dependency-graph recomputation over pluggable storage backends.
//!
//! Data nodes name datasets; compute nodes derive an output dataset from
//! their dependencies. The [`Orchestrator`] keeps outputs fresh: it walks
//! the graph, takes a per-node computing lock, splits work into batches over
//! a bounded worker pool, and swaps double-buffered outputs into place once
//! a compute succeeds.

pub mod computation;
pub mod definition;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod lock;
pub mod metrics;
pub mod node;
pub mod orchestrator;
pub mod planner;
pub mod store;
pub mod validation;

pub use computation::{Computation, FilterConfig, JoinConfig, JoinType, SelectConfig};
pub use definition::{GraphDefinition, InstalledGraph};
pub use error::ComputeError;
pub use events::{CollectingSink, ComputeEvent, EventSink, FanoutSink, FinishState, TracingSink};
pub use graph::{DependencyGraph, Explain};
pub use metrics::ComputeMetrics;
pub use node::{ComputeKind, ComputeNode, DataNode, Node, NodeId};
pub use orchestrator::{ComputeOutcome, Orchestrator};
pub use store::{FileNodeStore, MemoryNodeStore, NodeResolver, NodeStore};
pub use validation::ValidationResult;
