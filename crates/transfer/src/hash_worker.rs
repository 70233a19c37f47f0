//! Chunk digesting on a dedicated worker thread.
//!
//! The worker owns nothing but the digest function. Requests tagged with a
//! chunk index go in over a channel, responses tagged with the same index
//! come back over another, and a dispatcher task hands each response to
//! whoever is waiting on that index. Responses may arrive in any order.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::chunked::checksum_bytes;

/// A pluggable digest over chunk bytes.
pub trait ChunkDigest: Send + Sync + 'static {
    /// Short algorithm name, persisted with the session.
    fn name(&self) -> &'static str;

    /// Returns the digest of `data` as a string, or a failure message.
    fn digest(&self, data: &[u8]) -> Result<String, String>;
}

/// Hex-encoded SHA-256.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Digest;

impl ChunkDigest for Sha256Digest {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn digest(&self, data: &[u8]) -> Result<String, String> {
        Ok(checksum_bytes(data))
    }
}

/// Errors returned by [`HashWorker::hash`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    #[error("digest of chunk {index} failed: {message}")]
    Digest { index: u64, message: String },

    #[error("hash worker is not running")]
    WorkerGone,

    #[error("hash request for chunk {index} was abandoned")]
    Abandoned { index: u64 },

    #[error("failed to spawn hash worker: {0}")]
    Spawn(String),
}

struct HashRequest {
    index: u64,
    data: Vec<u8>,
}

struct HashResponse {
    index: u64,
    data: Vec<u8>,
    result: Result<String, String>,
}

type Waiter = oneshot::Sender<(Vec<u8>, Result<String, String>)>;
type Pending = Arc<Mutex<HashMap<u64, Waiter>>>;

/// Handle to a running hash worker.
///
/// Dropping the handle (or calling [`terminate`](Self::terminate)) stops the
/// worker thread; requests still waiting resolve to [`HashError::Abandoned`].
pub struct HashWorker {
    requests: Mutex<Option<std_mpsc::Sender<HashRequest>>>,
    pending: Pending,
}

impl HashWorker {
    /// Spawns the worker thread and its response dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(digest: Arc<dyn ChunkDigest>) -> Result<Self, HashError> {
        let (req_tx, req_rx) = std_mpsc::channel::<HashRequest>();
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<HashResponse>();

        std::thread::Builder::new()
            .name("chunk-hash-worker".into())
            .spawn(move || {
                while let Ok(HashRequest { index, data }) = req_rx.recv() {
                    let result = catch_unwind(AssertUnwindSafe(|| digest.digest(&data)))
                        .unwrap_or_else(|_| Err("digest panicked".into()));
                    if resp_tx.send(HashResponse { index, data, result }).is_err() {
                        break;
                    }
                }
                trace!("hash worker thread exiting");
            })
            .map_err(|e| HashError::Spawn(e.to_string()))?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let dispatch = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(resp) = resp_rx.recv().await {
                let waiter = dispatch
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&resp.index);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send((resp.data, resp.result));
                    }
                    None => debug!(index = resp.index, "dropping hash response with no waiter"),
                }
            }
            // Worker is gone: release anyone still waiting.
            dispatch
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        });

        Ok(Self {
            requests: Mutex::new(Some(req_tx)),
            pending,
        })
    }

    /// Digests chunk `index`, handing the bytes back alongside the hash.
    ///
    /// Only one request per index may be outstanding at a time; a second
    /// request for the same index replaces the first waiter, which then
    /// observes [`HashError::Abandoned`].
    pub async fn hash(&self, index: u64, data: Vec<u8>) -> Result<(String, Vec<u8>), HashError> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, tx);

        let sent = {
            let guard = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(sender) => sender.send(HashRequest { index, data }).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&index);
            return Err(HashError::WorkerGone);
        }

        match rx.await {
            Ok((data, Ok(hash))) => Ok((hash, data)),
            Ok((_, Err(message))) => Err(HashError::Digest { index, message }),
            Err(_) => Err(HashError::Abandoned { index }),
        }
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops the worker and abandons every outstanding request.
    pub fn terminate(&self) {
        let sender = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            let abandoned = {
                let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
                let n = pending.len();
                pending.clear();
                n
            };
            if abandoned > 0 {
                warn!(abandoned, "hash worker terminated with requests in flight");
            } else {
                debug!("hash worker terminated");
            }
        }
    }
}

impl Drop for HashWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}
