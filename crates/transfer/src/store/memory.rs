use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use chunkferry_protocol::types::ChunkStatus;

use super::{Collections, StateStore, StoreError, StoreFuture};
use crate::types::{ChunkPatch, ChunkRecord, SessionPatch, UploadSession};

/// Volatile [`StateStore`] kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

#[derive(Debug, Default)]
struct Inner {
    collections: Collections,
    blobs: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

impl StateStore for MemoryStore {
    fn put_chunk(&self, mut record: ChunkRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check()?;
            let mut inner = self.inner.lock().await;
            let id = record.id();
            match record.data.take() {
                Some(data) => inner.blobs.insert(id, data),
                None => inner.blobs.remove(&id),
            };
            inner.collections.insert_chunk(record);
            Ok(())
        })
    }

    fn get_chunk<'a>(&'a self, id: &'a str) -> StoreFuture<'a, ChunkRecord> {
        Box::pin(async move {
            self.check()?;
            let inner = self.inner.lock().await;
            let mut record = inner.collections.chunk(id)?.clone();
            record.data = inner.blobs.get(id).cloned();
            Ok(record)
        })
    }

    fn update_chunk<'a>(&'a self, id: &'a str, patch: ChunkPatch) -> StoreFuture<'a, ChunkRecord> {
        Box::pin(async move {
            self.check()?;
            let mut inner = self.inner.lock().await;
            let record = inner.collections.patched_chunk(id, &patch)?;
            if patch.release_data {
                inner.blobs.remove(id);
            }
            inner.collections.insert_chunk(record.clone());
            Ok(record)
        })
    }

    fn put_session(&self, session: UploadSession) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check()?;
            self.inner.lock().await.collections.insert_session(session);
            Ok(())
        })
    }

    fn get_session<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<UploadSession>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.inner.lock().await.collections.sessions.get(id).cloned())
        })
    }

    fn update_session<'a>(
        &'a self,
        id: &'a str,
        patch: SessionPatch,
    ) -> StoreFuture<'a, UploadSession> {
        Box::pin(async move {
            self.check()?;
            let mut inner = self.inner.lock().await;
            let session = inner.collections.patched_session(id, &patch)?;
            inner.collections.insert_session(session.clone());
            Ok(session)
        })
    }

    fn increment_uploaded_chunks<'a>(&'a self, id: &'a str) -> StoreFuture<'a, UploadSession> {
        Box::pin(async move {
            self.check()?;
            let mut inner = self.inner.lock().await;
            let session = inner.collections.incremented(id)?;
            inner.collections.insert_session(session.clone());
            Ok(session)
        })
    }

    fn complete_chunk<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<ChunkRecord>> {
        Box::pin(async move {
            self.check()?;
            let mut inner = self.inner.lock().await;
            let Some(record) = inner.collections.completion(id)? else {
                return Ok(None);
            };
            inner.blobs.remove(id);
            inner.collections.insert_chunk(record.clone());
            Ok(Some(record))
        })
    }

    fn claim_merge<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<UploadSession>> {
        Box::pin(async move {
            self.check()?;
            let mut inner = self.inner.lock().await;
            let claimed = inner.collections.merge_claim(id)?;
            if let Some(session) = &claimed {
                inner.collections.insert_session(session.clone());
            }
            Ok(claimed)
        })
    }

    fn query_chunks_by_status<'a>(
        &'a self,
        session_id: &'a str,
        statuses: &'a [ChunkStatus],
    ) -> StoreFuture<'a, Vec<ChunkRecord>> {
        Box::pin(async move {
            self.check()?;
            Ok(self
                .inner
                .lock()
                .await
                .collections
                .query(session_id, statuses))
        })
    }

    fn delete_session_and_chunks<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            let mut inner = self.inner.lock().await;
            for id in inner.collections.remove_session(session_id) {
                inner.blobs.remove(&id);
            }
            Ok(())
        })
    }

    fn list_sessions(&self) -> StoreFuture<'_, Vec<UploadSession>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.inner.lock().await.collections.sessions())
        })
    }
}
