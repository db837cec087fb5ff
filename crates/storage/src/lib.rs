//! Storage adapter contract for the dataflow compute core, plus an
//! in-memory reference backend.

pub mod dataset;
pub mod error;
pub mod memory;
pub mod query;
pub mod scope;

pub use dataset::{
    Backend, Connection, DatasetKind, DatasetLocator, DatasetRef, DatasetSpec, IndexSpec,
    JoinSide, NativeJoin, NativeJoinType,
};
pub use error::StorageError;
pub use memory::MemoryBackend;
pub use query::{compare_values, partition_system_ids, values_equal, Condition, Op, Where};
pub use scope::{BackendRegistry, ConnectionScope};
