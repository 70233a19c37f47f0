//! Upload error types.

use chunkferry_transfer::{HashError, PlanningError, StoreError};

use crate::transport::TransportError;

/// Terminal outcome of a failed upload.
///
/// `Clone` so one outcome can be handed to every caller waiting on the same
/// session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UploadError {
    #[error("planning failed: {0}")]
    Planning(#[from] PlanningError),

    #[error("hashing failed: {0}")]
    Hash(#[from] HashError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("chunk {index} failed after {attempts} attempts: {source}")]
    ChunkExhausted {
        index: u64,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("merge failed: {0}")]
    Merge(TransportError),

    #[error("upload canceled")]
    Canceled,

    #[error("background task failed: {0}")]
    Task(String),
}

impl UploadError {
    /// The transport error behind a chunk or merge failure, if any.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::ChunkExhausted { source, .. } | Self::Merge(source) => Some(source),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}
