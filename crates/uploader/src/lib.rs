//! Resumable chunked upload engine.
//!
//! An [`Uploader`] splits one file into fixed-size chunks, hashes and
//! persists each chunk through a [`StateStore`](chunkferry_transfer::StateStore),
//! then sends them through a [`Transport`] with bounded concurrency and
//! per-chunk retries. Once every chunk is acknowledged the transport is
//! asked to merge them. Progress lives in the store, so an upload
//! interrupted by a crash resumes where it stopped.
//!
//! # Lifecycle
//!
//! 1. **Prepare**: plan chunks, hash them on a worker thread, persist records
//! 2. **Upload**: keep up to `concurrency` chunks in flight, retry failures
//! 3. **Merge**: ask the transport to assemble the file
//!
//! `pause`/`resume` gate new transfers; `cancel` deletes the stored records
//! and rejects the outcome.

pub mod config;
pub mod error;
mod scheduler;
mod session;
pub mod source;
pub mod transport;

pub use config::{ConfigError, UploaderConfig};
pub use error::UploadError;
pub use session::Uploader;
pub use source::FileSource;
pub use transport::{ChunkProgressFn, DirectoryTransport, Transport, TransportError, TransportFuture};
