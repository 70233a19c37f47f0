//! Wire and status types for chunked uploads.
//!
//! Everything in here is plain data: the engine, the stores and the
//! transports all speak these types, so none of them depend on each other.

pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use messages::{ChunkAck, ChunkMeta, MergeReceipt, MergeRequest, TransferProgress};
pub use types::{ChunkStatus, SessionStatus, UploadProgress};
