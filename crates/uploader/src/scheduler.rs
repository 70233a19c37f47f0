//! Bounded-concurrency chunk scheduling.
//!
//! Up to `concurrency` chunks are in flight at once. The store is the source
//! of truth for what still needs sending; the in-memory [`Slots`] only keep
//! two tasks from picking the same chunk. A chunk waiting out a backoff stays
//! claimed but does not occupy a transfer slot.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{Notify, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chunkferry_protocol::messages::{ChunkMeta, MergeReceipt, MergeRequest};
use chunkferry_protocol::types::{ChunkStatus, SessionStatus};
use chunkferry_transfer::{
    ChunkDigest, ChunkPatch, HashWorker, ProgressTracker, SessionPatch, StateStore, StoreError,
    UploadSession, chunk_id,
};

use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::source::FileSource;
use crate::transport::{ChunkProgressFn, Transport, TransportError};

pub(crate) type Outcome = Result<MergeReceipt, UploadError>;

/// How often the store is re-read while another uploader holds the work.
const PEER_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

/// Chunks currently claimed by a task.
#[derive(Debug, Default)]
pub(crate) struct Slots {
    in_flight: BTreeSet<u64>,
    backoff: BTreeSet<u64>,
}

impl Slots {
    pub(crate) fn is_full(&self, limit: usize) -> bool {
        self.in_flight.len() >= limit
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Nothing in flight and no retry waiting.
    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.backoff.is_empty()
    }

    /// Claims `index` for transfer unless it is already claimed.
    pub(crate) fn try_claim(&mut self, index: u64) -> bool {
        if self.in_flight.contains(&index) || self.backoff.contains(&index) {
            return false;
        }
        self.in_flight.insert(index)
    }

    /// Drops a transfer claim. Returns `true` if nothing is left in flight.
    pub(crate) fn release(&mut self, index: u64) -> bool {
        self.in_flight.remove(&index);
        self.in_flight.is_empty()
    }

    /// Moves a transfer claim to the backoff set, freeing its slot.
    pub(crate) fn to_backoff(&mut self, index: u64) -> bool {
        self.backoff.insert(index);
        self.release(index)
    }

    /// Ends a backoff. Re-claims a transfer slot if one is free.
    pub(crate) fn from_backoff(&mut self, index: u64, limit: usize) -> bool {
        if !self.backoff.remove(&index) {
            return false;
        }
        if self.is_full(limit) {
            return false;
        }
        self.in_flight.insert(index)
    }

    pub(crate) fn leave_backoff(&mut self, index: u64) {
        self.backoff.remove(&index);
    }

    pub(crate) fn clear_backoff(&mut self) {
        self.backoff.clear();
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Per-run bookkeeping owned by the session controller.
pub(crate) struct RunState {
    pub(crate) generation: u64,
    pub(crate) active: bool,
    pub(crate) token: CancellationToken,
    pub(crate) outcome: watch::Sender<Option<Outcome>>,
    pub(crate) hasher: Option<Arc<HashWorker>>,
}

/// Shared state behind an [`Uploader`](crate::Uploader) and every task it
/// spawns.
pub(crate) struct Engine {
    pub(crate) source: FileSource,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) digest: Arc<dyn ChunkDigest>,
    pub(crate) config: UploaderConfig,
    pub(crate) progress: ProgressTracker,
    pub(crate) slots: Mutex<Slots>,
    pub(crate) run: Mutex<RunState>,
    pub(crate) generation: AtomicU64,
    pub(crate) paused: AtomicBool,
    pub(crate) canceled: AtomicBool,
    /// Set once a run has claimed its terminal outcome.
    pub(crate) halted: AtomicBool,
    pub(crate) merge_started: AtomicBool,
    /// Generation of the run currently polling for a peer's progress, or 0.
    pub(crate) peer_watch: AtomicU64,
    /// Set once preparation and reconciliation are done for the current run.
    pub(crate) dispatching: AtomicBool,
    /// Signalled whenever the last in-flight transfer is released.
    pub(crate) idle: Notify,
    /// Record creation holds it shared; cancel holds it exclusively while
    /// deleting, so no record is recreated after deletion.
    pub(crate) write_gate: RwLock<()>,
}

enum Attempt {
    Completed { uploaded: u64, total: u64 },
    Skipped,
    Failed { retries: u32, error: TransportError },
}

impl Engine {
    pub(crate) fn session_id(&self) -> &str {
        self.source.session_id()
    }

    pub(crate) fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn run(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn limit(&self) -> usize {
        self.config.effective_concurrency()
    }

    /// Whether run `generation` may still write new records.
    pub(crate) fn accepting_writes(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
            && !self.canceled.load(Ordering::SeqCst)
            && !self.halted.load(Ordering::SeqCst)
    }

    /// Whether run `generation` may start new transfers.
    pub(crate) fn accepting(&self, generation: u64) -> bool {
        self.accepting_writes(generation)
            && self.dispatching.load(Ordering::SeqCst)
            && !self.paused.load(Ordering::SeqCst)
    }

    fn release(&self, index: u64) {
        if self.slots().release(index) {
            self.idle.notify_waiters();
        }
    }

    async fn stored_session(&self) -> Result<UploadSession, UploadError> {
        let session_id = self.session_id();
        self.store.get_session(session_id).await?.ok_or_else(|| {
            StoreError::NotFound {
                collection: "uploadStatus",
                id: session_id.to_string(),
            }
            .into()
        })
    }

    /// Waits until no transfer from an earlier run is still in flight.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.slots().in_flight() == 0 {
                return;
            }
            debug!(session = %self.session_id(), "waiting for earlier transfers to drain");
            notified.await;
        }
    }

    /// Fills free transfer slots from the store's pending/failed chunks.
    pub(crate) async fn pump(self: &Arc<Self>, generation: u64) -> Result<(), UploadError> {
        if !self.accepting(generation) || self.slots().is_full(self.limit()) {
            return Ok(());
        }

        let ready = self
            .store
            .query_chunks_by_status(self.session_id(), &ChunkStatus::READY)
            .await?;

        for chunk in &ready {
            if !self.accepting(generation) {
                break;
            }
            let claimed = {
                let mut slots = self.slots();
                if slots.is_full(self.limit()) {
                    break;
                }
                slots.try_claim(chunk.index)
            };
            if claimed {
                tokio::spawn(Arc::clone(self).run_chunk(chunk.index, generation));
            }
        }
        if ready.is_empty() && self.slots().is_idle() {
            self.watch_peers(generation);
        }
        Ok(())
    }

    /// Starts polling the store when nothing is left to send here but the
    /// session is unfinished, which happens while another uploader sharing
    /// the store holds the remaining chunks.
    fn watch_peers(self: &Arc<Self>, generation: u64) {
        if self.peer_watch.swap(generation, Ordering::SeqCst) == generation {
            return;
        }
        debug!(session = %self.session_id(), "remaining chunks are in flight elsewhere, polling");
        let token = self.run().token.clone();
        tokio::spawn(Arc::clone(self).recheck_after(token, generation));
    }

    fn recheck_after(
        self: Arc<Self>,
        token: CancellationToken,
        generation: u64,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let cancelled = tokio::select! {
                _ = token.cancelled() => true,
                _ = tokio::time::sleep(PEER_POLL_INTERVAL) => false,
            };
            let _ = self.peer_watch.compare_exchange(
                generation,
                0,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            if cancelled || !self.accepting(generation) {
                return;
            }
            match self.stored_session().await {
                Ok(session) if session.uploaded_chunks >= session.total_chunks => {
                    self.merge(generation).await;
                }
                Ok(_) => Arc::clone(&self).refill(generation).await,
                Err(e) => self.fail(generation, e).await,
            }
        })
    }

    /// Runs [`pump`](Self::pump), failing the session on a store error.
    pub(crate) fn refill(self: Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if let Err(e) = self.pump(generation).await {
                self.fail(generation, e).await;
            }
        })
    }

    /// Transfers one claimed chunk and handles the result.
    fn run_chunk(self: Arc<Self>, index: u64, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            match self.attempt_chunk(index, generation).await {
                Ok(Attempt::Completed { uploaded, total }) => {
                    self.release(index);
                    if uploaded >= total {
                        self.merge(generation).await;
                    } else {
                        Arc::clone(&self).refill(generation).await;
                    }
                }
                Ok(Attempt::Skipped) => {
                    self.release(index);
                    Arc::clone(&self).refill(generation).await;
                }
                Ok(Attempt::Failed { retries, error }) => {
                    self.handle_failure(index, retries, error, generation)
                        .await;
                }
                Err(e) => {
                    self.release(index);
                    self.fail(generation, e).await;
                }
            }
        })
    }

    async fn attempt_chunk(
        self: &Arc<Self>,
        index: u64,
        generation: u64,
    ) -> Result<Attempt, UploadError> {
        let session_id = self.session_id();
        let id = chunk_id(session_id, index);

        let record = self.store.get_chunk(&id).await?;
        if !self.accepting(generation) {
            return Ok(Attempt::Skipped);
        }
        if record.status == ChunkStatus::Completed {
            let session = self.stored_session().await?;
            return Ok(Attempt::Completed {
                uploaded: session.uploaded_chunks,
                total: session.total_chunks,
            });
        }
        let Some(data) = record.data else {
            return Err(StoreError::Corrupt(format!("chunk {id} has no stored payload")).into());
        };

        let session = self.stored_session().await?;

        self.store
            .update_chunk(&id, ChunkPatch::status(ChunkStatus::Uploading))
            .await?;

        let meta = ChunkMeta {
            index,
            filename: session.file_name.clone(),
            session_id: session_id.to_string(),
            total_chunks: session.total_chunks,
            hash: record.hash.clone(),
        };
        let engine = Arc::clone(self);
        let on_progress: ChunkProgressFn =
            Arc::new(move |p| engine.progress.chunk_progress(index, p));

        debug!(
            session = %session_id,
            index,
            attempt = record.retries + 1,
            size = record.size,
            "sending chunk"
        );
        match self.transport.upload_chunk(meta, data, on_progress).await {
            Ok(_) => {
                // Only the uploader that completes the record counts it.
                let session = match self.store.complete_chunk(&id).await? {
                    Some(_) => self.store.increment_uploaded_chunks(session_id).await?,
                    None => {
                        debug!(session = %session_id, index, "chunk already acknowledged elsewhere");
                        self.stored_session().await?
                    }
                };
                self.progress.chunk_completed(index, record.size);
                debug!(
                    session = %session_id,
                    index,
                    uploaded = session.uploaded_chunks,
                    total = session.total_chunks,
                    "chunk acknowledged"
                );
                Ok(Attempt::Completed {
                    uploaded: session.uploaded_chunks,
                    total: session.total_chunks,
                })
            }
            Err(error) => {
                self.progress.chunk_abandoned(index);
                Ok(Attempt::Failed {
                    retries: record.retries,
                    error,
                })
            }
        }
    }

    /// Records a transport failure and either schedules a retry or fails the
    /// session once the retry budget is spent.
    async fn handle_failure(
        self: &Arc<Self>,
        index: u64,
        retries: u32,
        error: TransportError,
        generation: u64,
    ) {
        let id = chunk_id(self.session_id(), index);

        if retries >= self.config.max_retries {
            let patch = ChunkPatch {
                status: Some(ChunkStatus::Failed),
                last_error: Some(Some(error.to_string())),
                ..ChunkPatch::default()
            };
            let recorded = self.store.update_chunk(&id, patch).await;
            self.release(index);
            if let Err(e) = recorded {
                self.fail(generation, e.into()).await;
                return;
            }
            self.fail(
                generation,
                UploadError::ChunkExhausted {
                    index,
                    attempts: retries + 1,
                    source: error,
                },
            )
            .await;
            return;
        }

        let recorded = self
            .store
            .update_chunk(&id, ChunkPatch::failed(retries + 1, error.to_string()))
            .await;
        if let Err(e) = recorded {
            self.release(index);
            self.fail(generation, e.into()).await;
            return;
        }

        if !self.accepting(generation) {
            debug!(session = %self.session_id(), index, "chunk failed while paused, not scheduling retry");
            self.release(index);
            return;
        }

        let delay = self.config.retry_delay(retries);
        warn!(
            session = %self.session_id(),
            index,
            attempt = retries + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "chunk failed, retrying"
        );
        if self.slots().to_backoff(index) {
            self.idle.notify_waiters();
        }
        let token = self.run().token.clone();
        tokio::spawn(Arc::clone(self).retry_after(index, delay, token, generation));
        Arc::clone(self).refill(generation).await;
    }

    fn retry_after(
        self: Arc<Self>,
        index: u64,
        delay: Duration,
        token: CancellationToken,
        generation: u64,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(index, "retry backoff cancelled");
                    self.slots().leave_backoff(index);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if !self.accepting(generation) {
                self.slots().leave_backoff(index);
                return;
            }
            if !self.slots().from_backoff(index, self.limit()) {
                debug!(index, "no free slot after backoff, leaving retry to the queue");
                return;
            }
            self.run_chunk(index, generation).await;
        })
    }

    /// Asks the transport to assemble the upload. Runs at most once per run.
    pub(crate) async fn merge(self: &Arc<Self>, generation: u64) {
        if !self.accepting_writes(generation) || self.merge_started.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.try_merge(generation).await {
            Ok(receipt) => {
                if self.begin_settle(generation) {
                    info!(
                        session = %self.session_id(),
                        reference = %receipt.reference,
                        "upload completed"
                    );
                    self.finish(generation, Ok(receipt));
                }
            }
            Err(e) => self.fail(generation, e).await,
        }
    }

    /// Claims the session's merge and performs it, or waits for the
    /// uploader that holds the claim and adopts its receipt.
    async fn try_merge(&self, generation: u64) -> Result<MergeReceipt, UploadError> {
        let session_id = self.session_id();
        let token = {
            let run = self.run();
            if run.generation != generation {
                return Err(UploadError::Canceled);
            }
            run.token.clone()
        };

        loop {
            if let Some(session) = self.store.claim_merge(session_id).await? {
                info!(session = %session_id, chunks = session.total_chunks, "all chunks uploaded, merging");
                let receipt = self
                    .transport
                    .merge(MergeRequest {
                        filename: session.file_name.clone(),
                        session_id: session_id.to_string(),
                        total_chunks: session.total_chunks,
                        total_size: session.file_size,
                    })
                    .await
                    .map_err(UploadError::Merge)?;

                self.store
                    .update_session(session_id, SessionPatch::completed(receipt.clone()))
                    .await?;
                return Ok(receipt);
            }

            let session = self.stored_session().await?;
            match session.status {
                SessionStatus::Completed => {
                    debug!(session = %session_id, "merge finished elsewhere");
                    return session.server_response.ok_or_else(|| {
                        StoreError::Corrupt(format!("session {session_id} completed without a receipt"))
                            .into()
                    });
                }
                SessionStatus::Merging => {
                    debug!(session = %session_id, "merge claimed elsewhere, waiting");
                    tokio::select! {
                        _ = token.cancelled() => return Err(UploadError::Canceled),
                        _ = tokio::time::sleep(PEER_POLL_INTERVAL) => {}
                    }
                }
                // The other merge gave up; claim it again.
                _ => {}
            }
        }
    }

    /// Claims the terminal outcome of run `generation`.
    pub(crate) fn begin_settle(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
            && self
                .halted
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// Marks the session failed and rejects the outcome.
    ///
    /// Errors from a canceled or already settled run are dropped.
    pub(crate) async fn fail(&self, generation: u64, error: UploadError) {
        if self.canceled.load(Ordering::SeqCst) {
            debug!(session = %self.session_id(), error = %error, "ignoring error after cancel");
            return;
        }
        if !self.begin_settle(generation) {
            debug!(session = %self.session_id(), error = %error, "ignoring error from settled run");
            return;
        }

        error!(session = %self.session_id(), error = %error, "upload failed");
        if let Err(e) = self
            .store
            .update_session(self.session_id(), SessionPatch::failed(error.to_string()))
            .await
        {
            warn!(session = %self.session_id(), error = %e, "could not record failure");
        }
        self.finish(generation, Err(error));
    }

    /// Publishes the outcome of run `generation` and stops its background work.
    pub(crate) fn finish(&self, generation: u64, outcome: Outcome) {
        let hasher = {
            let mut run = self.run();
            if run.generation != generation || !run.active {
                return;
            }
            run.active = false;
            run.token.cancel();
            run.outcome.send_replace(Some(outcome));
            run.hasher.take()
        };
        self.slots().clear_backoff();
        if let Some(hasher) = hasher {
            hasher.terminate();
        }
    }
}
