use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Chunk upload
// ---------------------------------------------------------------------------

/// Metadata sent alongside every chunk body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    pub index: u64,
    pub filename: String,
    pub session_id: String,
    pub total_chunks: u64,
    /// Hex digest of the chunk body.
    pub hash: String,
}

/// Byte-level progress of one chunk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub loaded: u64,
    pub total: u64,
}

impl TransferProgress {
    /// Fraction of the chunk sent so far, in `[0.0, 1.0]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.loaded as f64 / self.total as f64).clamp(0.0, 1.0)
    }
}

/// Opaque acknowledgement of a received chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub index: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Asks the server to assemble all received chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub filename: String,
    pub session_id: String,
    pub total_chunks: u64,
    pub total_size: u64,
}

/// Server response to a successful merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReceipt {
    /// Server-assigned reference to the assembled file.
    pub reference: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub size: u64,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_meta_field_names() {
        let meta = ChunkMeta {
            index: 1,
            filename: "movie.mkv".into(),
            session_id: "movie.mkv-10-1".into(),
            total_chunks: 3,
            hash: "ab".into(),
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"sessionId\""));
        assert!(json.contains("\"totalChunks\":3"));
    }

    #[test]
    fn merge_request_from_json() {
        let json = r#"{"filename":"a.bin","sessionId":"s","totalChunks":3,"totalSize":5242880}"#;
        let req: MergeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.total_chunks, 3);
        assert_eq!(req.total_size, 5_242_880);
    }

    #[test]
    fn merge_receipt_omits_zero_size() {
        let receipt = MergeReceipt {
            reference: "files/a.bin".into(),
            size: 0,
        };
        let json = serde_json::to_string(&receipt).unwrap();
        assert!(!json.contains("size"));
    }

    #[test]
    fn transfer_progress_fraction() {
        let p = TransferProgress {
            loaded: 25,
            total: 100,
        };
        assert!((p.fraction() - 0.25).abs() < f64::EPSILON);
        let empty = TransferProgress { loaded: 0, total: 0 };
        assert!((empty.fraction() - 1.0).abs() < f64::EPSILON);
    }
}
