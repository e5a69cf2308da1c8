use std::fmt::Display;

use stitch_store::StorageError;

/// Per-request failure reported by a batched backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("codec: {0}")]
    Codec(String),
    #[error("backend returned no response for request {0}")]
    MissingResponse(usize),
    #[error("{0}")]
    Other(String),
}

impl From<stitch_core::CodecError> for BackendError {
    fn from(e: stitch_core::CodecError) -> Self { Self::Codec(e.to_string()) }
}

/// Outcome of a failed ingest batch, classified for the task runner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtosessionError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("droppable: {0}")]
    Droppable(String),
}

impl ProtosessionError {
    pub fn retry(e: impl Display) -> Self { Self::Retryable(e.to_string()) }
    pub fn drop(e: impl Display) -> Self { Self::Droppable(e.to_string()) }
    pub fn is_retryable(&self) -> bool { matches!(self, Self::Retryable(_)) }
}
