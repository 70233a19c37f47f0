//! Transport trait and the local directory transport.
//!
//! `Transport` is the engine's only view of the receiving side: send one
//! chunk, or ask for the received chunks to be merged. Keeping it a trait
//! lets the engine run against a real server, a local directory, or a
//! scripted mock in tests.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use chunkferry_protocol::messages::{
    ChunkAck, ChunkMeta, MergeReceipt, MergeRequest, TransferProgress,
};
use chunkferry_transfer::{ChunkDigest, ChunkWriter, Sha256Digest, TransferError};
use tracing::{debug, info};

/// Boxed future returned by [`Transport`] methods.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Receives `{loaded, total}` byte counts while a chunk is being sent.
pub type ChunkProgressFn = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Errors reported by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("chunk {index} failed integrity check: expected {expected}, got {actual}")]
    Integrity {
        index: u64,
        expected: String,
        actual: String,
    },
}

impl From<TransferError> for TransportError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Io(e) => Self::Request(e.to_string()),
            TransferError::InvalidPath(msg) => Self::Rejected {
                status: 400,
                message: msg,
            },
            other @ (TransferError::MissingPart { .. } | TransferError::SizeMismatch { .. }) => {
                Self::Rejected {
                    status: 409,
                    message: other.to_string(),
                }
            }
        }
    }
}

/// The receiving side of an upload.
pub trait Transport: Send + Sync {
    /// Sends one chunk body with its metadata.
    fn upload_chunk(
        &self,
        meta: ChunkMeta,
        data: Vec<u8>,
        progress: ChunkProgressFn,
    ) -> TransportFuture<'_, ChunkAck>;

    /// Asks the receiver to assemble every chunk of a session.
    fn merge(&self, request: MergeRequest) -> TransportFuture<'_, MergeReceipt>;
}

/// A local directory acting as the upload server.
///
/// Chunks land in `<root>/.parts/<sessionId>/<index>.part` after their hash
/// is verified; merging assembles them into `<root>/<filename>`.
pub struct DirectoryTransport {
    writer: Arc<ChunkWriter>,
    digest: Arc<dyn ChunkDigest>,
}

impl DirectoryTransport {
    /// Creates a transport rooted at `root`, verifying chunks with SHA-256.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_digest(root, Arc::new(Sha256Digest))
    }

    /// Creates a transport verifying chunks with `digest`.
    ///
    /// Must match the digest the uploader hashes with.
    pub fn with_digest(root: impl Into<PathBuf>, digest: Arc<dyn ChunkDigest>) -> Self {
        let root = root.into();
        Self {
            writer: Arc::new(ChunkWriter::new(&root)),
            digest,
        }
    }

    pub fn root(&self) -> &Path {
        self.writer.base_path()
    }

    /// Removes any parts received for `session_id`.
    pub async fn discard(&self, session_id: &str) -> Result<(), TransportError> {
        let writer = Arc::clone(&self.writer);
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || writer.discard(&session_id))
            .await
            .map_err(|e| TransportError::Request(format!("task join error: {e}")))??;
        Ok(())
    }
}

impl Transport for DirectoryTransport {
    fn upload_chunk(
        &self,
        meta: ChunkMeta,
        data: Vec<u8>,
        progress: ChunkProgressFn,
    ) -> TransportFuture<'_, ChunkAck> {
        Box::pin(async move {
            let writer = Arc::clone(&self.writer);
            let digest = Arc::clone(&self.digest);
            let index = meta.index;

            tokio::task::spawn_blocking(move || {
                let actual = digest
                    .digest(&data)
                    .map_err(TransportError::Request)?;
                if actual != meta.hash {
                    return Err(TransportError::Integrity {
                        index,
                        expected: meta.hash.clone(),
                        actual,
                    });
                }
                let total = data.len() as u64;
                writer.write_part(&meta.session_id, index, &data, &|loaded| {
                    progress(TransferProgress { loaded, total })
                })?;
                Ok(())
            })
            .await
            .map_err(|e| TransportError::Request(format!("task join error: {e}")))??;

            debug!(index, "chunk stored");
            Ok(ChunkAck {
                index,
                message: String::new(),
            })
        })
    }

    fn merge(&self, request: MergeRequest) -> TransportFuture<'_, MergeReceipt> {
        Box::pin(async move {
            let writer = Arc::clone(&self.writer);
            let MergeRequest {
                filename,
                session_id,
                total_chunks,
                total_size,
            } = request;

            let dest = tokio::task::spawn_blocking(move || {
                writer.assemble(&session_id, &filename, total_chunks, total_size)
            })
            .await
            .map_err(|e| TransportError::Request(format!("task join error: {e}")))??;

            info!(path = %dest.display(), size = total_size, "merged upload");
            Ok(MergeReceipt {
                reference: dest.display().to_string(),
                size: total_size,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkferry_transfer::checksum_bytes;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn meta(index: u64, data: &[u8]) -> ChunkMeta {
        ChunkMeta {
            index,
            filename: "out.bin".into(),
            session_id: "s1".into(),
            total_chunks: 2,
            hash: checksum_bytes(data),
        }
    }

    fn no_progress() -> ChunkProgressFn {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn upload_and_merge() {
        let dir = TempDir::new().unwrap();
        let transport = DirectoryTransport::new(dir.path());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let ack = transport
            .upload_chunk(
                meta(1, b"world"),
                b"world".to_vec(),
                Arc::new(move |p| s.lock().unwrap().push(p)),
            )
            .await
            .unwrap();
        assert_eq!(ack.index, 1);
        assert_eq!(
            seen.lock().unwrap().last().copied(),
            Some(TransferProgress { loaded: 5, total: 5 })
        );

        transport
            .upload_chunk(meta(0, b"hello "), b"hello ".to_vec(), no_progress())
            .await
            .unwrap();

        let receipt = transport
            .merge(MergeRequest {
                filename: "out.bin".into(),
                session_id: "s1".into(),
                total_chunks: 2,
                total_size: 11,
            })
            .await
            .unwrap();
        assert_eq!(receipt.size, 11);
        assert_eq!(
            std::fs::read(dir.path().join("out.bin")).unwrap(),
            b"hello world"
        );
        assert!(receipt.reference.ends_with("out.bin"));
    }

    #[tokio::test]
    async fn hash_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let transport = DirectoryTransport::new(dir.path());

        let err = transport
            .upload_chunk(meta(0, b"expected"), b"tampered".to_vec(), no_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Integrity { index: 0, .. }));
    }

    #[tokio::test]
    async fn merge_with_missing_part_is_rejected() {
        let dir = TempDir::new().unwrap();
        let transport = DirectoryTransport::new(dir.path());
        transport
            .upload_chunk(meta(0, b"abc"), b"abc".to_vec(), no_progress())
            .await
            .unwrap();

        let err = transport
            .merge(MergeRequest {
                filename: "out.bin".into(),
                session_id: "s1".into(),
                total_chunks: 2,
                total_size: 6,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 409, .. }));
    }

    #[tokio::test]
    async fn traversal_filename_is_rejected() {
        let dir = TempDir::new().unwrap();
        let transport = DirectoryTransport::new(dir.path().join("server"));
        transport
            .upload_chunk(meta(0, b"x"), b"x".to_vec(), no_progress())
            .await
            .unwrap();

        let err = transport
            .merge(MergeRequest {
                filename: "../escape".into(),
                session_id: "s1".into(),
                total_chunks: 1,
                total_size: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 400, .. }));
        assert!(!dir.path().join("escape").exists());
    }

    #[tokio::test]
    async fn discard_removes_parts() {
        let dir = TempDir::new().unwrap();
        let transport = DirectoryTransport::new(dir.path());
        transport
            .upload_chunk(meta(0, b"abc"), b"abc".to_vec(), no_progress())
            .await
            .unwrap();
        transport.discard("s1").await.unwrap();
        assert!(!dir.path().join(".parts").join("s1").exists());
    }
}
