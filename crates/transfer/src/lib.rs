//! Chunk planning, hashing and durable upload state.
//!
//! This crate holds everything the upload engine needs that does not
//! involve a network: splitting a file into ranges, digesting chunks on a
//! worker thread, and persisting session/chunk records so an upload can be
//! resumed after the process dies.

mod chunked;
pub mod hash_worker;
mod plan;
mod progress;
pub mod store;
mod types;
mod validation;

pub use chunked::{ChunkReader, ChunkWriter, checksum_bytes};
pub use hash_worker::{ChunkDigest, HashError, HashWorker, Sha256Digest};
pub use plan::{ChunkPlan, PlanningError};
pub use progress::{ProgressCallback, ProgressTracker};
pub use store::{FileStore, MemoryStore, StateStore, StoreError};
pub use types::{ChunkPatch, ChunkRecord, SessionPatch, UploadSession, chunk_id};
pub use validation::validate_path_component;

/// Default chunk size: 2 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Errors produced by the chunk reader/writer helpers.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing part {index} of session {session_id}")]
    MissingPart { session_id: String, index: u64 },

    #[error("assembled size {actual} does not match expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
