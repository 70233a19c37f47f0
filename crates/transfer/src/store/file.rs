use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use chunkferry_protocol::types::ChunkStatus;

use super::{Collections, StateStore, StoreError, StoreFuture};
use crate::chunked::checksum_bytes;
use crate::types::{ChunkPatch, ChunkRecord, SessionPatch, UploadSession};

const SESSIONS_DIR: &str = "sessions";
const TRASH_DIR: &str = "trash";
const SESSION_FILE: &str = "session.json";
const CHUNKS_DIR: &str = "chunks";

/// Durable [`StateStore`] backed by a directory tree of JSON records.
///
/// Layout under `root`:
/// - `sessions/<sha256(session id)>/session.json`: the session record
/// - `sessions/<sha256(session id)>/chunks/<index>.json`: one chunk record
/// - `sessions/<sha256(session id)>/chunks/<index>.bin`: its payload until released
/// - `trash/`: session directories being deleted
///
/// Every mutation rewrites only the record it touches, through a temp file
/// and rename. The in-memory cache is updated after the write succeeds, so
/// a failed write leaves both cache and disk on the previous record.
pub struct FileStore {
    root: PathBuf,
    state: Mutex<Collections>,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(SESSIONS_DIR)).await?;
        tokio::fs::create_dir_all(root.join(TRASH_DIR)).await?;
        empty_trash(&root.join(TRASH_DIR)).await;

        let mut state = Collections::default();
        let mut dirs = tokio::fs::read_dir(root.join(SESSIONS_DIR)).await?;
        while let Some(entry) = dirs.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                load_session_dir(&entry.path(), &mut state).await?;
            }
        }
        debug!(
            root = %root.display(),
            sessions = state.sessions.len(),
            chunks = state.chunks.len(),
            "opened file store"
        );

        Ok(Self {
            root,
            state: Mutex::new(state),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root
            .join(SESSIONS_DIR)
            .join(checksum_bytes(session_id.as_bytes()))
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(SESSION_FILE)
    }

    fn chunk_path(&self, record: &ChunkRecord, extension: &str) -> PathBuf {
        self.session_dir(&record.session_id)
            .join(CHUNKS_DIR)
            .join(format!("{}.{extension}", record.index))
    }

    async fn save_chunk(&self, record: &ChunkRecord) -> Result<(), StoreError> {
        save(&self.chunk_path(record, "json"), record).await
    }

    async fn save_session(&self, session: &UploadSession) -> Result<(), StoreError> {
        save(&self.session_path(&session.id), session).await
    }

    /// Drops a payload whose record no longer references it.
    async fn release_blob(&self, record: &ChunkRecord) {
        if let Err(e) = remove_file(&self.chunk_path(record, "bin")).await {
            warn!(chunk = %record.id(), error = %e, "failed to remove chunk payload");
        }
    }
}

impl StateStore for FileStore {
    fn put_chunk(&self, mut record: ChunkRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let blob = self.chunk_path(&record, "bin");
            if let Some(parent) = blob.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            match record.data.take() {
                Some(data) => write_atomic(&blob, &data).await?,
                None => remove_file(&blob).await?,
            }
            self.save_chunk(&record).await?;
            state.insert_chunk(record);
            Ok(())
        })
    }

    fn get_chunk<'a>(&'a self, id: &'a str) -> StoreFuture<'a, ChunkRecord> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut record = state.chunk(id)?.clone();
            record.data = match tokio::fs::read(self.chunk_path(&record, "bin")).await {
                Ok(data) => Some(data),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            Ok(record)
        })
    }

    fn update_chunk<'a>(&'a self, id: &'a str, patch: ChunkPatch) -> StoreFuture<'a, ChunkRecord> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let record = state.patched_chunk(id, &patch)?;
            self.save_chunk(&record).await?;
            state.insert_chunk(record.clone());
            if patch.release_data {
                self.release_blob(&record).await;
            }
            Ok(record)
        })
    }

    fn put_session(&self, session: UploadSession) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            tokio::fs::create_dir_all(self.session_dir(&session.id)).await?;
            self.save_session(&session).await?;
            state.insert_session(session);
            Ok(())
        })
    }

    fn get_session<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<UploadSession>> {
        Box::pin(async move { Ok(self.state.lock().await.sessions.get(id).cloned()) })
    }

    fn update_session<'a>(
        &'a self,
        id: &'a str,
        patch: SessionPatch,
    ) -> StoreFuture<'a, UploadSession> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let session = state.patched_session(id, &patch)?;
            self.save_session(&session).await?;
            state.insert_session(session.clone());
            Ok(session)
        })
    }

    fn increment_uploaded_chunks<'a>(&'a self, id: &'a str) -> StoreFuture<'a, UploadSession> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let session = state.incremented(id)?;
            self.save_session(&session).await?;
            state.insert_session(session.clone());
            Ok(session)
        })
    }

    fn complete_chunk<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<ChunkRecord>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let Some(record) = state.completion(id)? else {
                return Ok(None);
            };
            self.save_chunk(&record).await?;
            state.insert_chunk(record.clone());
            self.release_blob(&record).await;
            Ok(Some(record))
        })
    }

    fn claim_merge<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<UploadSession>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let Some(session) = state.merge_claim(id)? else {
                return Ok(None);
            };
            self.save_session(&session).await?;
            state.insert_session(session.clone());
            Ok(Some(session))
        })
    }

    fn query_chunks_by_status<'a>(
        &'a self,
        session_id: &'a str,
        statuses: &'a [ChunkStatus],
    ) -> StoreFuture<'a, Vec<ChunkRecord>> {
        Box::pin(async move { Ok(self.state.lock().await.query(session_id, statuses)) })
    }

    fn delete_session_and_chunks<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let dir = self.session_dir(session_id);
            let grave = self.root.join(TRASH_DIR).join(format!(
                "{}.{}",
                checksum_bytes(session_id.as_bytes()),
                Utc::now().timestamp_nanos_opt().unwrap_or_default()
            ));
            // The rename is the commit point; the tree is reclaimed afterwards.
            match tokio::fs::rename(&dir, &grave).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let removed = state.remove_session(session_id);
            match tokio::fs::remove_dir_all(&grave).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(session = %session_id, error = %e, "failed to reclaim session files")
                }
            }
            debug!(session = %session_id, chunks = removed.len(), "deleted session records");
            Ok(())
        })
    }

    fn list_sessions(&self) -> StoreFuture<'_, Vec<UploadSession>> {
        Box::pin(async move { Ok(self.state.lock().await.sessions()) })
    }
}

async fn load_session_dir(dir: &Path, state: &mut Collections) -> Result<(), StoreError> {
    if let Some(session) = load::<UploadSession>(&dir.join(SESSION_FILE)).await? {
        state.insert_session(session);
    }
    let mut files = match tokio::fs::read_dir(dir.join(CHUNKS_DIR)).await {
        Ok(files) => files,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = files.next_entry().await? {
        let path = entry.path();
        if !path.extension().is_some_and(|ext| ext == "json") {
            continue;
        }
        if let Some(record) = load::<ChunkRecord>(&path).await? {
            state.insert_chunk(record);
        }
    }
    Ok(())
}

async fn empty_trash(trash: &Path) {
    let mut entries = match tokio::fs::read_dir(trash).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %trash.display(), error = %e, "cannot read trash");
            return;
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
            warn!(path = %entry.path().display(), error = %e, "failed to empty trash");
        }
    }
}

/// Reads one JSON record, treating a missing file as absent.
async fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn save<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json).await
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_file(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
