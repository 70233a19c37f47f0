use std::ops::Range;

/// Errors raised while planning chunk boundaries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanningError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("source file unreadable: {0}")]
    Source(String),

    #[error("source changed since session {session_id} was created (expected {expected} bytes, found {actual})")]
    SourceChanged {
        session_id: String,
        expected: u64,
        actual: u64,
    },
}

/// Fixed-size split of a file into half-open byte ranges.
///
/// Deterministic in `(file_size, chunk_size)`: the same inputs always yield
/// the same boundaries, which is what lets a resumed session trust the
/// indices it persisted earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
    total_chunks: u64,
}

impl ChunkPlan {
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, PlanningError> {
        if chunk_size == 0 {
            return Err(PlanningError::ZeroChunkSize);
        }
        Ok(Self {
            file_size,
            chunk_size,
            total_chunks: file_size.div_ceil(chunk_size),
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    /// Byte range of chunk `index`, or `None` past the last chunk.
    pub fn range(&self, index: u64) -> Option<Range<u64>> {
        if index >= self.total_chunks {
            return None;
        }
        let start = index * self.chunk_size;
        let end = start.saturating_add(self.chunk_size).min(self.file_size);
        Some(start..end)
    }

    /// Length of chunk `index` in bytes.
    pub fn chunk_len(&self, index: u64) -> Option<u64> {
        self.range(index).map(|r| r.end - r.start)
    }

    /// Iterates `(index, range)` pairs in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, Range<u64>)> + '_ {
        (0..self.total_chunks).filter_map(move |i| self.range(i).map(|r| (i, r)))
    }
}
