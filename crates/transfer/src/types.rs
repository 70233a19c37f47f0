use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chunkferry_protocol::messages::MergeReceipt;
use chunkferry_protocol::types::{ChunkStatus, SessionStatus};

/// Builds the composite key of a chunk record.
pub fn chunk_id(session_id: &str, index: u64) -> String {
    format!("{session_id}-{index}")
}

// ---------------------------------------------------------------------------
// UploadSession
// ---------------------------------------------------------------------------

/// Durable record of one resumable upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub uploaded_chunks: u64,
    pub prepared_chunks: u64,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Digest algorithm used for every chunk hash of this session.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_response: Option<MergeReceipt>,
}

impl UploadSession {
    /// Creates a session in the `preparing` state.
    pub fn new(
        id: String,
        file_name: String,
        file_size: u64,
        chunk_size: u64,
        total_chunks: u64,
        digest: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            file_name,
            file_size,
            chunk_size,
            total_chunks,
            uploaded_chunks: 0,
            prepared_chunks: 0,
            status: SessionStatus::Preparing,
            last_error: None,
            digest: digest.to_string(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            server_response: None,
        }
    }

    /// Every chunk has a persisted hash and payload.
    pub fn is_prepared(&self) -> bool {
        self.prepared_chunks == self.total_chunks
            && !matches!(self.status, SessionStatus::Preparing)
    }

    /// Applies `patch` in place and bumps `updated_at`.
    pub fn apply(&mut self, patch: &SessionPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(n) = patch.uploaded_chunks {
            self.uploaded_chunks = n.min(self.total_chunks);
        }
        if let Some(n) = patch.prepared_chunks {
            self.prepared_chunks = n.min(self.total_chunks);
        }
        if let Some(err) = &patch.last_error {
            self.last_error = err.clone();
        }
        if let Some(at) = patch.completed_at {
            self.completed_at = Some(at);
        }
        if let Some(receipt) = &patch.server_response {
            self.server_response = Some(receipt.clone());
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update of an [`UploadSession`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub uploaded_chunks: Option<u64>,
    pub prepared_chunks: Option<u64>,
    /// `Some(None)` clears the error.
    pub last_error: Option<Option<String>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub server_response: Option<MergeReceipt>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(SessionStatus::Failed),
            last_error: Some(Some(error.into())),
            ..Self::default()
        }
    }

    pub fn completed(receipt: MergeReceipt) -> Self {
        Self {
            status: Some(SessionStatus::Completed),
            last_error: Some(None),
            completed_at: Some(Utc::now()),
            server_response: Some(receipt),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// ChunkRecord
// ---------------------------------------------------------------------------

/// Durable record of one chunk of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub session_id: String,
    pub index: u64,
    /// Byte offset within the source file.
    pub offset: u64,
    pub size: u64,
    /// Digest of the chunk bytes. Never changes once written.
    pub hash: String,
    pub status: ChunkStatus,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Chunk payload. Stores keep it out of their index and release it once
    /// the chunk is completed.
    #[serde(skip)]
    pub data: Option<Vec<u8>>,
}

impl ChunkRecord {
    /// Creates a pending record carrying its payload.
    pub fn new(session_id: &str, index: u64, offset: u64, hash: String, data: Vec<u8>) -> Self {
        Self {
            session_id: session_id.to_string(),
            index,
            offset,
            size: data.len() as u64,
            hash,
            status: ChunkStatus::Pending,
            retries: 0,
            last_error: None,
            completed_at: None,
            data: Some(data),
        }
    }

    pub fn id(&self) -> String {
        chunk_id(&self.session_id, self.index)
    }

    /// Returns a copy without the payload.
    pub fn without_data(&self) -> Self {
        Self {
            data: None,
            ..self.clone()
        }
    }

    /// Applies `patch` in place. The hash is never touched.
    pub fn apply(&mut self, patch: &ChunkPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(retries) = patch.retries {
            self.retries = retries;
        }
        if let Some(err) = &patch.last_error {
            self.last_error = err.clone();
        }
        if let Some(at) = patch.completed_at {
            self.completed_at = Some(at);
        }
        if patch.release_data {
            self.data = None;
        }
    }
}

/// Partial update of a [`ChunkRecord`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkPatch {
    pub status: Option<ChunkStatus>,
    pub retries: Option<u32>,
    /// `Some(None)` clears the error.
    pub last_error: Option<Option<String>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Drop the stored payload.
    pub release_data: bool,
}

impl ChunkPatch {
    pub fn status(status: ChunkStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Marks the chunk acknowledged and frees its payload.
    pub fn completed() -> Self {
        Self {
            status: Some(ChunkStatus::Completed),
            last_error: Some(None),
            completed_at: Some(Utc::now()),
            release_data: true,
            ..Self::default()
        }
    }

    pub fn failed(retries: u32, error: impl Into<String>) -> Self {
        Self {
            status: Some(ChunkStatus::Failed),
            retries: Some(retries),
            last_error: Some(Some(error.into())),
            ..Self::default()
        }
    }
}
