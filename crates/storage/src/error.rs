use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("core error: {0}")]
    Core(#[from] dataflow_core::CoreError),

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("backend not registered: {0}")]
    UnknownBackend(String),

    #[error("unique index violation on {dataset}: {fields:?} = {value}")]
    UniqueViolation {
        dataset: String,
        fields: Vec<String>,
        value: String,
    },

    #[error("operation not supported by backend {backend}: {operation}")]
    Unsupported { backend: String, operation: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("{0}")]
    Other(String),
}
