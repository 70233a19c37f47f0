//! The local file being uploaded.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chunkferry_transfer::{ChunkReader, PlanningError, validate_path_component};

/// A file on local disk plus the identity that ties it to a session.
///
/// The default session id is `"{file_name}-{size}-{mtime_ms}"`, so the same
/// unchanged file maps to the same session across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSource {
    path: PathBuf,
    file_name: String,
    size: u64,
    modified_ms: u128,
    session_id: String,
}

impl FileSource {
    /// Stats `path` and derives its session id.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, PlanningError> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| PlanningError::Source(format!("{}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(PlanningError::Source(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PlanningError::Source(format!("{} has no file name", path.display())))?
            .to_string();
        validate_path_component(&file_name).map_err(|e| PlanningError::Source(e.to_string()))?;

        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_millis());
        let size = meta.len();

        Ok(Self {
            session_id: format!("{file_name}-{size}-{modified_ms}"),
            path,
            file_name,
            size,
            modified_ms,
        })
    }

    /// Replaces the derived session id.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Opens the file for ranged reads, checking it still has the planned size.
    pub(crate) fn open_reader(&self) -> Result<ChunkReader, PlanningError> {
        let reader = ChunkReader::open(&self.path)
            .map_err(|e| PlanningError::Source(format!("{}: {e}", self.path.display())))?;
        if reader.file_size() != self.size {
            return Err(PlanningError::SourceChanged {
                session_id: self.session_id.clone(),
                expected: self.size,
                actual: reader.file_size(),
            });
        }
        Ok(reader)
    }
}
