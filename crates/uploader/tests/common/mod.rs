#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chunkferry_protocol::messages::{
    ChunkAck, ChunkMeta, MergeReceipt, MergeRequest, TransferProgress,
};
use chunkferry_uploader::{ChunkProgressFn, Transport, TransportError, TransportFuture};
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// One recorded call to `upload_chunk`.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub index: u64,
    pub at: Instant,
    pub len: usize,
    pub hash: String,
}

/// Mock transport with scripted per-chunk failures.
#[derive(Default)]
pub struct ScriptedTransport {
    /// Remaining scripted failures per chunk index. `u32::MAX` fails forever.
    failures: Mutex<HashMap<u64, u32>>,
    /// Chunks at or above this index never complete.
    hang_from: Mutex<Option<u64>>,
    merge_failures: Mutex<u32>,
    gate: Option<Arc<Semaphore>>,
    attempts: Mutex<Vec<Attempt>>,
    merges: Mutex<Vec<MergeRequest>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transfer waits for a permit from `gate` before completing.
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn fail_times(self, index: u64, times: u32) -> Self {
        self.failures.lock().unwrap().insert(index, times);
        self
    }

    pub fn fail_always(self, index: u64) -> Self {
        self.fail_times(index, u32::MAX)
    }

    pub fn hang_from(self, index: u64) -> Self {
        *self.hang_from.lock().unwrap() = Some(index);
        self
    }

    pub fn fail_merges(self, times: u32) -> Self {
        *self.merge_failures.lock().unwrap() = times;
        self
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempted_indices(&self) -> Vec<u64> {
        let mut indices: Vec<u64> = self.attempts().iter().map(|a| a.index).collect();
        indices.sort_unstable();
        indices
    }

    pub fn attempts_for(&self, index: u64) -> Vec<Attempt> {
        self.attempts()
            .into_iter()
            .filter(|a| a.index == index)
            .collect()
    }

    pub fn merges(&self) -> Vec<MergeRequest> {
        self.merges.lock().unwrap().clone()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn upload_chunk(
        &self,
        meta: ChunkMeta,
        data: Vec<u8>,
        progress: ChunkProgressFn,
    ) -> TransportFuture<'_, ChunkAck> {
        Box::pin(async move {
            self.attempts.lock().unwrap().push(Attempt {
                index: meta.index,
                at: Instant::now(),
                len: data.len(),
                hash: meta.hash.clone(),
            });
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            let hang = self
                .hang_from
                .lock()
                .unwrap()
                .is_some_and(|from| meta.index >= from);
            if hang {
                std::future::pending::<()>().await;
            }

            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate closed").forget();
            }

            let total = data.len() as u64;
            progress(TransferProgress {
                loaded: total / 2,
                total,
            });

            let fail = {
                let mut failures = self.failures.lock().unwrap();
                match failures.get_mut(&meta.index) {
                    Some(left) if *left > 0 => {
                        if *left != u32::MAX {
                            *left -= 1;
                        }
                        true
                    }
                    _ => false,
                }
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            if fail {
                return Err(TransportError::Rejected {
                    status: 503,
                    message: format!("chunk {} refused", meta.index),
                });
            }
            progress(TransferProgress {
                loaded: total,
                total,
            });
            Ok(ChunkAck {
                index: meta.index,
                message: String::new(),
            })
        })
    }

    fn merge(&self, request: MergeRequest) -> TransportFuture<'_, MergeReceipt> {
        Box::pin(async move {
            self.merges.lock().unwrap().push(request.clone());
            {
                let mut left = self.merge_failures.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(TransportError::Request("merge endpoint down".into()));
                }
            }
            Ok(MergeReceipt {
                reference: format!("remote/{}", request.filename),
                size: request.total_size,
            })
        })
    }
}

/// Writes `len` bytes of a repeating pattern to `dir/name`.
pub fn write_source(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

/// Polls `check` every 10 ms until it returns `true` or `limit` elapses.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
