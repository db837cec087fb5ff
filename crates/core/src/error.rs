use thiserror::Error;

/// Errors raised by the shared record model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("empty field path")]
    EmptyPath,

    #[error("field path {path:?} has an empty segment")]
    EmptySegment { path: String },
}
