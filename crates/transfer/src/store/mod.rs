//! Durable chunk and session records.
//!
//! Two collections are kept: `chunks`, keyed by [`chunk_id`], and
//! `uploadStatus`, keyed by session id. Both are queried by session id. Every
//! operation is atomic with respect to the record it touches.

mod file;
mod memory;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use chunkferry_protocol::types::{ChunkStatus, SessionStatus};

use crate::types::{ChunkPatch, ChunkRecord, SessionPatch, UploadSession, chunk_id};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Boxed future returned by [`StateStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Errors surfaced by a [`StateStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("{collection} record not found: {id}")]
    NotFound {
        collection: &'static str,
        id: String,
    },

    #[error("state store corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    fn chunk_not_found(id: &str) -> Self {
        Self::NotFound {
            collection: CHUNKS,
            id: id.to_string(),
        }
    }

    fn session_not_found(id: &str) -> Self {
        Self::NotFound {
            collection: UPLOAD_STATUS,
            id: id.to_string(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corrupt(e.to_string())
    }
}

const CHUNKS: &str = "chunks";
const UPLOAD_STATUS: &str = "uploadStatus";

/// Asynchronous persistence for upload state.
///
/// Implementations must be safe to share between tasks; the engine holds one
/// behind an `Arc` and calls it from every in-flight transfer.
pub trait StateStore: Send + Sync {
    /// Inserts or replaces a chunk record, payload included.
    fn put_chunk(&self, record: ChunkRecord) -> StoreFuture<'_, ()>;

    /// Returns the chunk record with its payload.
    fn get_chunk<'a>(&'a self, id: &'a str) -> StoreFuture<'a, ChunkRecord>;

    /// Applies `patch` and returns the updated record (without payload).
    fn update_chunk<'a>(&'a self, id: &'a str, patch: ChunkPatch) -> StoreFuture<'a, ChunkRecord>;

    fn put_session(&self, session: UploadSession) -> StoreFuture<'_, ()>;

    fn get_session<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<UploadSession>>;

    fn update_session<'a>(
        &'a self,
        id: &'a str,
        patch: SessionPatch,
    ) -> StoreFuture<'a, UploadSession>;

    /// Atomically adds one to `uploaded_chunks`, saturating at `total_chunks`.
    fn increment_uploaded_chunks<'a>(&'a self, id: &'a str) -> StoreFuture<'a, UploadSession>;

    /// Marks a chunk completed and releases its payload.
    ///
    /// Returns the updated record, or `None` when the chunk was already
    /// completed. Only the caller that gets `Some` may count the chunk.
    fn complete_chunk<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<ChunkRecord>>;

    /// Moves a session to `merging` unless it is already merging or
    /// completed, in which case `None` is returned and nothing changes.
    fn claim_merge<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<UploadSession>>;

    /// Chunks of `session_id` whose status is one of `statuses`, ordered by
    /// index ascending, without payloads.
    fn query_chunks_by_status<'a>(
        &'a self,
        session_id: &'a str,
        statuses: &'a [ChunkStatus],
    ) -> StoreFuture<'a, Vec<ChunkRecord>>;

    /// Removes the session record and every chunk record belonging to it.
    fn delete_session_and_chunks<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, ()>;

    fn list_sessions(&self) -> StoreFuture<'_, Vec<UploadSession>>;
}

/// In-memory form of both collections, shared by the store implementations.
///
/// Chunk records are kept without payloads; each implementation decides
/// where payload bytes live. Mutations are computed against a borrowed view
/// first and committed with the `insert_*` methods once they are durable.
#[derive(Debug, Default)]
pub(crate) struct Collections {
    pub(crate) chunks: BTreeMap<String, ChunkRecord>,
    pub(crate) sessions: BTreeMap<String, UploadSession>,
}

impl Collections {
    pub(crate) fn chunk(&self, id: &str) -> Result<&ChunkRecord, StoreError> {
        self.chunks
            .get(id)
            .ok_or_else(|| StoreError::chunk_not_found(id))
    }

    pub(crate) fn session(&self, id: &str) -> Result<&UploadSession, StoreError> {
        self.sessions
            .get(id)
            .ok_or_else(|| StoreError::session_not_found(id))
    }

    pub(crate) fn insert_chunk(&mut self, record: ChunkRecord) {
        self.chunks.insert(record.id(), record.without_data());
    }

    pub(crate) fn insert_session(&mut self, session: UploadSession) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub(crate) fn patched_chunk(
        &self,
        id: &str,
        patch: &ChunkPatch,
    ) -> Result<ChunkRecord, StoreError> {
        let mut record = self.chunk(id)?.clone();
        record.apply(patch);
        Ok(record)
    }

    pub(crate) fn patched_session(
        &self,
        id: &str,
        patch: &SessionPatch,
    ) -> Result<UploadSession, StoreError> {
        let mut session = self.session(id)?.clone();
        session.apply(patch);
        Ok(session)
    }

    pub(crate) fn incremented(&self, id: &str) -> Result<UploadSession, StoreError> {
        let next = self.session(id)?.uploaded_chunks.saturating_add(1);
        self.patched_session(
            id,
            &SessionPatch {
                uploaded_chunks: Some(next),
                ..SessionPatch::default()
            },
        )
    }

    /// The completed form of a chunk, or `None` when it already is.
    pub(crate) fn completion(&self, id: &str) -> Result<Option<ChunkRecord>, StoreError> {
        if self.chunk(id)?.status == ChunkStatus::Completed {
            return Ok(None);
        }
        self.patched_chunk(id, &ChunkPatch::completed()).map(Some)
    }

    /// The session moved to `merging`, or `None` when a merge was already
    /// claimed or has finished.
    pub(crate) fn merge_claim(&self, id: &str) -> Result<Option<UploadSession>, StoreError> {
        if matches!(
            self.session(id)?.status,
            SessionStatus::Merging | SessionStatus::Completed
        ) {
            return Ok(None);
        }
        self.patched_session(id, &SessionPatch::status(SessionStatus::Merging))
            .map(Some)
    }

    pub(crate) fn query(&self, session_id: &str, statuses: &[ChunkStatus]) -> Vec<ChunkRecord> {
        let mut found: Vec<ChunkRecord> = self
            .chunks
            .values()
            .filter(|c| c.session_id == session_id && statuses.contains(&c.status))
            .cloned()
            .collect();
        found.sort_by_key(|c| c.index);
        found
    }

    /// Removes a session and its chunks, returning the removed chunk ids.
    pub(crate) fn remove_session(&mut self, session_id: &str) -> Vec<String> {
        self.sessions.remove(session_id);
        let ids: Vec<String> = self
            .chunks
            .values()
            .filter(|c| c.session_id == session_id)
            .map(|c| chunk_id(&c.session_id, c.index))
            .collect();
        for id in &ids {
            self.chunks.remove(id);
        }
        ids
    }

    pub(crate) fn sessions(&self) -> Vec<UploadSession> {
        let mut all: Vec<UploadSession> = self.sessions.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn session(id: &str, total: u64) -> UploadSession {
        UploadSession::new(id.into(), "f.bin".into(), total * 4, 4, total, "sha256")
    }

    pub(crate) fn chunk(session_id: &str, index: u64) -> ChunkRecord {
        ChunkRecord::new(
            session_id,
            index,
            index * 4,
            format!("hash-{index}"),
            vec![index as u8; 4],
        )
    }

    /// Behaviour every [`StateStore`] must share.
    pub(crate) async fn exercise_store(store: &dyn StateStore) {
        store.put_session(session("s1", 3)).await.unwrap();
        store.put_session(session("s2", 1)).await.unwrap();
        for i in [2, 0, 1] {
            store.put_chunk(chunk("s1", i)).await.unwrap();
        }
        store.put_chunk(chunk("s2", 0)).await.unwrap();

        // Payload round-trips through get, not through queries.
        let c = store.get_chunk("s1-1").await.unwrap();
        assert_eq!(c.data.as_deref(), Some(&[1u8; 4][..]));
        let pending = store
            .query_chunks_by_status("s1", &ChunkStatus::READY)
            .await
            .unwrap();
        assert_eq!(
            pending.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(pending.iter().all(|c| c.data.is_none()));

        // Completing releases the payload.
        let done = store
            .update_chunk("s1-0", ChunkPatch::completed())
            .await
            .unwrap();
        assert_eq!(done.status, ChunkStatus::Completed);
        assert!(store.get_chunk("s1-0").await.unwrap().data.is_none());
        assert_eq!(store.get_chunk("s1-0").await.unwrap().hash, "hash-0");

        // Only the first completion counts.
        assert!(store.complete_chunk("s1-0").await.unwrap().is_none());
        let first = store.complete_chunk("s1-1").await.unwrap().unwrap();
        assert_eq!(first.status, ChunkStatus::Completed);
        assert!(store.get_chunk("s1-1").await.unwrap().data.is_none());
        assert!(store.complete_chunk("s1-1").await.unwrap().is_none());
        assert!(store.complete_chunk("s1-9").await.unwrap_err().is_not_found());

        // Increment saturates at total.
        for _ in 0..5 {
            store.increment_uploaded_chunks("s1").await.unwrap();
        }
        assert_eq!(
            store.get_session("s1").await.unwrap().unwrap().uploaded_chunks,
            3
        );

        assert!(
            store
                .update_chunk("s1-9", ChunkPatch::default())
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(
            store
                .update_session("nope", SessionPatch::default())
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(store.get_session("nope").await.unwrap().is_none());

        // A merge is claimed once.
        let claimed = store.claim_merge("s1").await.unwrap().unwrap();
        assert_eq!(claimed.status, SessionStatus::Merging);
        assert!(store.claim_merge("s1").await.unwrap().is_none());
        assert_eq!(
            store.get_session("s1").await.unwrap().unwrap().status,
            SessionStatus::Merging
        );
        assert!(store.claim_merge("nope").await.unwrap_err().is_not_found());

        assert_eq!(store.list_sessions().await.unwrap().len(), 2);

        store.delete_session_and_chunks("s1").await.unwrap();
        assert!(store.get_session("s1").await.unwrap().is_none());
        assert!(store.get_chunk("s1-1").await.unwrap_err().is_not_found());
        assert!(
            store
                .query_chunks_by_status("s1", &ChunkStatus::READY)
                .await
                .unwrap()
                .is_empty()
        );
        // Other sessions are untouched.
        assert!(store.get_chunk("s2-0").await.is_ok());
    }
}
