//! Session controller: the public face of the upload engine.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use futures_util::stream;
use tokio::sync::{Notify, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chunkferry_protocol::messages::MergeReceipt;
use chunkferry_protocol::types::{ChunkStatus, SessionStatus, UploadProgress};
use chunkferry_transfer::{
    ChunkDigest, ChunkPatch, ChunkPlan, ChunkRecord, HashWorker, PlanningError, ProgressTracker,
    SessionPatch, Sha256Digest, StateStore, UploadSession,
};

use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::scheduler::{Engine, RunState, Slots};
use crate::source::FileSource;
use crate::transport::Transport;

const ALL_CHUNK_STATUSES: [ChunkStatus; 4] = [
    ChunkStatus::Pending,
    ChunkStatus::Uploading,
    ChunkStatus::Completed,
    ChunkStatus::Failed,
];

/// Resumable upload of one file.
///
/// Cheap to clone; clones share the same session. The session's progress
/// lives in the [`StateStore`], so a new `Uploader` for the same file and
/// store picks up where a previous process stopped.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use chunkferry_transfer::MemoryStore;
/// # use chunkferry_uploader::{DirectoryTransport, FileSource, Uploader, UploaderConfig};
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let source = FileSource::from_path("movie.mkv").await?;
/// let uploader = Uploader::new(
///     source,
///     Arc::new(MemoryStore::new()),
///     Arc::new(DirectoryTransport::new("/srv/incoming")),
///     UploaderConfig::default(),
/// );
/// uploader.on_progress(|p| println!("{:.1}%", p.percentage()));
/// let receipt = uploader.start().await?;
/// println!("stored at {}", receipt.reference);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Uploader {
    engine: Arc<Engine>,
}

impl Uploader {
    /// Creates an uploader hashing chunks with SHA-256.
    pub fn new(
        source: FileSource,
        store: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
        config: UploaderConfig,
    ) -> Self {
        Self::with_digest(source, store, transport, config, Arc::new(Sha256Digest))
    }

    /// Creates an uploader hashing chunks with `digest`.
    pub fn with_digest(
        source: FileSource,
        store: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
        config: UploaderConfig,
        digest: Arc<dyn ChunkDigest>,
    ) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            engine: Arc::new(Engine {
                source,
                store,
                transport,
                digest,
                config,
                progress: ProgressTracker::new(),
                slots: Mutex::new(Slots::default()),
                run: Mutex::new(RunState {
                    generation: 0,
                    active: false,
                    token: CancellationToken::new(),
                    outcome,
                    hasher: None,
                }),
                generation: AtomicU64::new(0),
                paused: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                halted: AtomicBool::new(true),
                merge_started: AtomicBool::new(false),
                peer_watch: AtomicU64::new(0),
                dispatching: AtomicBool::new(false),
                idle: Notify::new(),
                write_gate: RwLock::new(()),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        self.engine.session_id()
    }

    /// Registers a progress callback.
    ///
    /// Called on every chunk progress update and every chunk completion.
    /// A panicking callback is logged and never affects the upload.
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(UploadProgress) + Send + Sync + 'static,
    {
        self.engine.progress.on_progress(Arc::new(callback));
    }

    /// Current overall progress of this uploader.
    pub fn progress(&self) -> UploadProgress {
        self.engine.progress.snapshot()
    }

    /// Uploads the file, resuming any stored progress, and resolves once
    /// the merge is acknowledged.
    ///
    /// Calling `start` again while a run is active joins the same run and
    /// resolves with the same outcome.
    pub async fn start(&self) -> Result<MergeReceipt, UploadError> {
        let engine = &self.engine;
        let mut outcome = {
            let mut run = engine.run();
            if !run.active {
                let generation = engine.generation.fetch_add(1, Ordering::SeqCst) + 1;
                engine.paused.store(false, Ordering::SeqCst);
                engine.canceled.store(false, Ordering::SeqCst);
                engine.halted.store(false, Ordering::SeqCst);
                engine.merge_started.store(false, Ordering::SeqCst);
                engine.dispatching.store(false, Ordering::SeqCst);

                let (tx, _) = watch::channel(None);
                *run = RunState {
                    generation,
                    active: true,
                    token: CancellationToken::new(),
                    outcome: tx,
                    hasher: None,
                };
                info!(session = %engine.session_id(), generation, "starting upload");
                tokio::spawn(Arc::clone(engine).launch(generation));
            } else {
                debug!(session = %engine.session_id(), "joining active upload");
            }
            run.outcome.subscribe()
        };

        let result = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| UploadError::Task("upload run ended without an outcome".into()))?;
        match &*result {
            Some(outcome) => outcome.clone(),
            None => Err(UploadError::Task("upload run ended without an outcome".into())),
        }
    }

    /// Stops starting new transfers. In-flight transfers finish normally.
    pub fn pause(&self) {
        if !self.engine.paused.swap(true, Ordering::SeqCst) {
            info!(session = %self.session_id(), "upload paused");
        }
    }

    /// Clears the pause flag and refills free transfer slots.
    pub fn resume(&self) {
        let engine = &self.engine;
        if engine.canceled.load(Ordering::SeqCst) || !engine.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        let (active, generation) = {
            let run = engine.run();
            (run.active, run.generation)
        };
        info!(session = %self.session_id(), "upload resumed");
        if active {
            tokio::spawn(Arc::clone(engine).refill(generation));
        }
    }

    /// Aborts the upload, deletes its stored records and rejects the
    /// outcome with [`UploadError::Canceled`].
    ///
    /// Transfers already in flight run to completion; their results are
    /// discarded.
    pub async fn cancel(&self) -> Result<(), UploadError> {
        let engine = &self.engine;
        engine.paused.store(true, Ordering::SeqCst);
        engine.canceled.store(true, Ordering::SeqCst);

        let (generation, hasher) = {
            let mut run = engine.run();
            run.token.cancel();
            (run.generation, run.hasher.take())
        };
        if let Some(hasher) = hasher {
            hasher.terminate();
        }

        let deleted = {
            let _gate = engine.write_gate.write().await;
            let session_id = engine.session_id();
            if let Err(e) = engine
                .store
                .update_session(session_id, SessionPatch::status(SessionStatus::Canceled))
                .await
                && !e.is_not_found()
            {
                warn!(session = %session_id, error = %e, "could not mark session canceled");
            }
            engine.store.delete_session_and_chunks(session_id).await
        };

        engine.halted.store(true, Ordering::SeqCst);
        engine.finish(generation, Err(UploadError::Canceled));
        info!(session = %self.session_id(), "upload canceled");
        deleted.map_err(UploadError::from)
    }

    /// The stored session record, if any.
    pub async fn status(&self) -> Result<Option<UploadSession>, UploadError> {
        Ok(self.engine.store.get_session(self.session_id()).await?)
    }

    /// Deletes every stored record of this session.
    ///
    /// An active run is canceled first.
    pub async fn clear(&self) -> Result<(), UploadError> {
        if self.engine.run().active {
            return self.cancel().await;
        }
        let _gate = self.engine.write_gate.write().await;
        self.engine
            .store
            .delete_session_and_chunks(self.session_id())
            .await?;
        info!(session = %self.session_id(), "cleared stored upload state");
        Ok(())
    }

    /// Chunk transfers currently in flight.
    pub fn in_flight(&self) -> usize {
        self.engine.slots().in_flight()
    }

    pub fn is_paused(&self) -> bool {
        self.engine.paused.load(Ordering::SeqCst)
    }
}

impl Engine {
    async fn launch(self: Arc<Self>, generation: u64) {
        if let Err(e) = self.run_session(generation).await {
            self.fail(generation, e).await;
        }
    }

    async fn run_session(self: &Arc<Self>, generation: u64) -> Result<(), UploadError> {
        self.wait_idle().await;

        let session_id = self.session_id();
        let session = match self.store.get_session(session_id).await? {
            Some(session) if session.status == SessionStatus::Completed => {
                info!(session = %session_id, "session already completed");
                let receipt = session.server_response.unwrap_or(MergeReceipt {
                    reference: String::new(),
                    size: session.file_size,
                });
                if self.begin_settle(generation) {
                    self.finish(generation, Ok(receipt));
                }
                return Ok(());
            }
            Some(session) => {
                if session.file_size != self.source.size() {
                    return Err(PlanningError::SourceChanged {
                        session_id: session_id.to_string(),
                        expected: session.file_size,
                        actual: self.source.size(),
                    }
                    .into());
                }
                info!(
                    session = %session_id,
                    status = %session.status,
                    uploaded = session.uploaded_chunks,
                    total = session.total_chunks,
                    "resuming stored session"
                );
                session
            }
            None => {
                let plan = ChunkPlan::new(self.source.size(), self.config.chunk_size)?;
                let session = UploadSession::new(
                    session_id.to_string(),
                    self.source.file_name().to_string(),
                    plan.file_size(),
                    plan.chunk_size(),
                    plan.total_chunks(),
                    self.digest.name(),
                );
                let _gate = self.write_gate.read().await;
                if !self.accepting_writes(generation) {
                    return Ok(());
                }
                self.store.put_session(session.clone()).await?;
                debug!(session = %session_id, chunks = plan.total_chunks(), "created session");
                session
            }
        };

        // Stored sessions keep the chunk size they were planned with.
        let plan = ChunkPlan::new(session.file_size, session.chunk_size)?;

        if !session.is_prepared() {
            self.prepare(&session, &plan, generation).await?;
        }
        let session = self.reconcile(&session).await?;

        if session.total_chunks == 0 {
            let receipt = MergeReceipt {
                reference: String::new(),
                size: 0,
            };
            self.store
                .update_session(session_id, SessionPatch::completed(receipt.clone()))
                .await?;
            info!(session = %session_id, "empty file, nothing to upload");
            if self.begin_settle(generation) {
                self.finish(generation, Ok(receipt));
            }
            return Ok(());
        }

        self.dispatching.store(true, Ordering::SeqCst);
        if session.uploaded_chunks >= session.total_chunks {
            self.merge(generation).await;
            return Ok(());
        }
        self.pump(generation).await
    }

    /// Hashes and persists every chunk that has no record yet.
    async fn prepare(
        self: &Arc<Self>,
        session: &UploadSession,
        plan: &ChunkPlan,
        generation: u64,
    ) -> Result<(), UploadError> {
        let existing: HashSet<u64> = self
            .store
            .query_chunks_by_status(&session.id, &ALL_CHUNK_STATUSES)
            .await?
            .into_iter()
            .map(|c| c.index)
            .collect();
        let missing: Vec<(u64, Range<u64>)> = plan
            .iter()
            .filter(|(index, _)| !existing.contains(index))
            .collect();
        info!(
            session = %session.id,
            missing = missing.len(),
            total = plan.total_chunks(),
            "preparing chunks"
        );

        if !missing.is_empty() {
            let hasher = Arc::new(HashWorker::spawn(Arc::clone(&self.digest))?);
            {
                let mut run = self.run();
                if run.generation != generation || !run.active {
                    return Ok(());
                }
                run.hasher = Some(Arc::clone(&hasher));
            }

            let prepared = stream::iter(missing)
                .map(|(index, range)| {
                    let hasher = Arc::clone(&hasher);
                    async move { self.prepare_chunk(&hasher, index, range, generation).await }
                })
                .buffer_unordered(self.config.effective_hash_concurrency());
            let mut prepared = std::pin::pin!(prepared);
            while let Some(result) = prepared.next().await {
                result?;
            }

            hasher.terminate();
            self.run().hasher = None;
        }

        let _gate = self.write_gate.read().await;
        if !self.accepting_writes(generation) {
            return Err(UploadError::Canceled);
        }
        self.store
            .update_session(
                &session.id,
                SessionPatch {
                    status: Some(SessionStatus::Prepared),
                    prepared_chunks: Some(plan.total_chunks()),
                    ..SessionPatch::default()
                },
            )
            .await?;
        debug!(session = %session.id, "all chunks prepared");
        Ok(())
    }

    async fn prepare_chunk(
        &self,
        hasher: &HashWorker,
        index: u64,
        range: Range<u64>,
        generation: u64,
    ) -> Result<(), UploadError> {
        let source = self.source.clone();
        let offset = range.start;
        let data = tokio::task::spawn_blocking(move || {
            let mut reader = source.open_reader()?;
            reader
                .read_range(range)
                .map_err(|e| PlanningError::Source(format!("{}: {e}", source.path().display())))
        })
        .await
        .map_err(|e| UploadError::Task(format!("chunk read task failed: {e}")))??;

        let (hash, data) = hasher.hash(index, data).await?;

        let _gate = self.write_gate.read().await;
        if !self.accepting_writes(generation) {
            return Err(UploadError::Canceled);
        }
        self.store
            .put_chunk(ChunkRecord::new(self.session_id(), index, offset, hash, data))
            .await?;
        debug!(session = %self.session_id(), index, "chunk prepared");
        Ok(())
    }

    /// Brings stored state in line with reality before transfers start.
    ///
    /// Chunks a dead process left `uploading` go back to `pending`, the
    /// uploaded counter is recounted from completed records, and a failed
    /// session gets a fresh retry budget for its failed chunks.
    async fn reconcile(&self, session: &UploadSession) -> Result<UploadSession, UploadError> {
        let session_id = session.id.as_str();

        let stuck = self
            .store
            .query_chunks_by_status(session_id, &[ChunkStatus::Uploading])
            .await?;
        for chunk in &stuck {
            self.store
                .update_chunk(&chunk.id(), ChunkPatch::status(ChunkStatus::Pending))
                .await?;
        }
        if !stuck.is_empty() {
            debug!(session = %session_id, chunks = stuck.len(), "reset interrupted chunks");
        }

        if session.status == SessionStatus::Failed {
            let failed = self
                .store
                .query_chunks_by_status(session_id, &[ChunkStatus::Failed])
                .await?;
            for chunk in &failed {
                self.store
                    .update_chunk(
                        &chunk.id(),
                        ChunkPatch {
                            retries: Some(0),
                            ..ChunkPatch::default()
                        },
                    )
                    .await?;
            }
        }

        let completed = self
            .store
            .query_chunks_by_status(session_id, &[ChunkStatus::Completed])
            .await?;
        let completed_bytes: u64 = completed.iter().map(|c| c.size).sum();
        let session = self
            .store
            .update_session(
                session_id,
                SessionPatch {
                    status: Some(SessionStatus::Uploading),
                    uploaded_chunks: Some(completed.len() as u64),
                    last_error: Some(None),
                    ..SessionPatch::default()
                },
            )
            .await?;

        self.progress.reset(
            session_id,
            session.total_chunks,
            session.file_size,
            session.uploaded_chunks,
            completed_bytes,
        );
        info!(
            session = %session_id,
            uploaded = session.uploaded_chunks,
            total = session.total_chunks,
            "uploading"
        );
        Ok(session)
    }
}
