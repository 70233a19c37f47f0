use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::TransferError;
use crate::validation::validate_path_component;

/// Directory (under the writer root) that holds not-yet-merged parts.
const PARTS_DIR: &str = ".parts";

/// Buffer size used when streaming parts into the assembled file.
const COPY_BUF_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Random-access reader for planned chunk ranges of a source file.
pub struct ChunkReader {
    file: File,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` for chunked reading.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        Ok(Self { file, file_size })
    }

    /// Reads exactly the bytes in `range`.
    ///
    /// Fails with `UnexpectedEof` if the file is shorter than the range,
    /// which happens when the source was truncated after planning.
    pub fn read_range(&mut self, range: Range<u64>) -> Result<Vec<u8>, TransferError> {
        let len = range.end.saturating_sub(range.start) as usize;
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(range.start))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}

// ---------------------------------------------------------------------------
// ChunkWriter
// ---------------------------------------------------------------------------

/// Receives chunk parts into a directory and assembles them into files.
///
/// Layout under `base_path`:
/// - `.parts/<session_id>/<index>.part` while a session is in progress
/// - `<file_name>` once assembled
pub struct ChunkWriter {
    base_path: PathBuf,
}

impl ChunkWriter {
    /// Creates a writer rooted at `base_path`.
    pub fn new(base_path: &Path) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
        }
    }

    /// Returns the base output path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn parts_dir(&self, session_id: &str) -> PathBuf {
        self.base_path.join(PARTS_DIR).join(session_id)
    }

    fn part_path(&self, session_id: &str, index: u64) -> PathBuf {
        self.parts_dir(session_id).join(format!("{index}.part"))
    }

    /// Writes one part, reporting cumulative bytes written through `on_written`.
    ///
    /// The part is written to a temporary name and renamed into place, so a
    /// part file that exists is always complete. Re-sending an index
    /// overwrites the previous copy.
    pub fn write_part(
        &self,
        session_id: &str,
        index: u64,
        data: &[u8],
        on_written: &dyn Fn(u64),
    ) -> Result<(), TransferError> {
        validate_path_component(session_id)?;

        let dir = self.parts_dir(session_id);
        std::fs::create_dir_all(&dir)?;

        let tmp = dir.join(format!("{index}.part.tmp"));
        let mut file = File::create(&tmp)?;
        let mut written = 0u64;
        for block in data.chunks(COPY_BUF_SIZE) {
            file.write_all(block)?;
            written += block.len() as u64;
            on_written(written);
        }
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, self.part_path(session_id, index))?;
        Ok(())
    }

    /// Returns `true` if part `index` of `session_id` has been received.
    pub fn has_part(&self, session_id: &str, index: u64) -> bool {
        self.part_path(session_id, index).is_file()
    }

    /// Concatenates parts `0..total_chunks` into `<base>/<file_name>`.
    ///
    /// Verifies every part is present and the result is `total_size` bytes,
    /// then removes the parts directory. Returns the assembled path.
    pub fn assemble(
        &self,
        session_id: &str,
        file_name: &str,
        total_chunks: u64,
        total_size: u64,
    ) -> Result<PathBuf, TransferError> {
        validate_path_component(session_id)?;
        validate_path_component(file_name)?;

        for index in 0..total_chunks {
            if !self.has_part(session_id, index) {
                return Err(TransferError::MissingPart {
                    session_id: session_id.to_string(),
                    index,
                });
            }
        }

        std::fs::create_dir_all(&self.base_path)?;
        let dest = self.base_path.join(file_name);
        let tmp = self.base_path.join(format!(".{file_name}.{session_id}.assembling"));

        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut actual = 0u64;
        for index in 0..total_chunks {
            let mut part = File::open(self.part_path(session_id, index))?;
            loop {
                let n = part.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
                actual += n as u64;
            }
        }
        out.sync_all()?;
        drop(out);

        if actual != total_size {
            let _ = std::fs::remove_file(&tmp);
            return Err(TransferError::SizeMismatch {
                expected: total_size,
                actual,
            });
        }

        std::fs::rename(&tmp, &dest)?;
        self.discard(session_id)?;
        Ok(dest)
    }

    /// Removes all received parts for a session. Missing directories are fine.
    pub fn discard(&self, session_id: &str) -> Result<(), TransferError> {
        validate_path_component(session_id)?;
        match std::fs::remove_dir_all(self.parts_dir(session_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        let c2 = checksum_bytes(b"hello world");
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64); // SHA-256 = 64 hex chars.
        assert_ne!(c1, checksum_bytes(b"hello"));
    }

    #[test]
    fn chunk_reader_reads_ranges() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"AABBCCDDEE");

        let mut reader = ChunkReader::open(&path).unwrap();
        assert_eq!(reader.file_size(), 10);
        assert_eq!(reader.read_range(4..8).unwrap(), b"CCDD");
        assert_eq!(reader.read_range(8..10).unwrap(), b"EE");
        assert_eq!(reader.read_range(0..4).unwrap(), b"AABB");
    }

    #[test]
    fn chunk_reader_short_file_errors() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"0123");
        let mut reader = ChunkReader::open(&path).unwrap();
        assert!(reader.read_range(2..8).is_err());
    }

    #[test]
    fn write_part_reports_progress() {
        let dir = TempDir::new().unwrap();
        let writer = ChunkWriter::new(dir.path());
        let data = vec![7u8; COPY_BUF_SIZE * 2 + 10];

        let seen = std::sync::Mutex::new(Vec::new());
        writer
            .write_part("s1", 0, &data, &|n| seen.lock().unwrap().push(n))
            .unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(
            seen,
            vec![
                COPY_BUF_SIZE as u64,
                2 * COPY_BUF_SIZE as u64,
                data.len() as u64
            ]
        );
        assert!(writer.has_part("s1", 0));
        assert!(!writer.has_part("s1", 1));
    }

    #[test]
    fn assemble_concatenates_in_index_order() {
        let dir = TempDir::new().unwrap();
        let writer = ChunkWriter::new(dir.path());

        // Arrive out of order.
        writer.write_part("s1", 2, b"dog", &|_| {}).unwrap();
        writer.write_part("s1", 0, b"lazy ", &|_| {}).unwrap();
        writer.write_part("s1", 1, b"brown ", &|_| {}).unwrap();

        let dest = writer.assemble("s1", "out.txt", 3, 14).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"lazy brown dog");
        assert!(!dir.path().join(PARTS_DIR).join("s1").exists());
    }

    #[test]
    fn assemble_missing_part_fails() {
        let dir = TempDir::new().unwrap();
        let writer = ChunkWriter::new(dir.path());
        writer.write_part("s1", 0, b"abc", &|_| {}).unwrap();

        let err = writer.assemble("s1", "out.bin", 2, 6).unwrap_err();
        assert!(matches!(err, TransferError::MissingPart { index: 1, .. }));
    }

    #[test]
    fn assemble_size_mismatch_fails() {
        let dir = TempDir::new().unwrap();
        let writer = ChunkWriter::new(dir.path());
        writer.write_part("s1", 0, b"abc", &|_| {}).unwrap();

        let err = writer.assemble("s1", "out.bin", 1, 4).unwrap_err();
        assert!(matches!(
            err,
            TransferError::SizeMismatch {
                expected: 4,
                actual: 3
            }
        ));
        assert!(!dir.path().join("out.bin").exists());
    }

    #[test]
    fn traversal_in_file_name_rejected() {
        let dir = TempDir::new().unwrap();
        let writer = ChunkWriter::new(dir.path());
        writer.write_part("s1", 0, b"evil", &|_| {}).unwrap();

        let err = writer.assemble("s1", "../../etc/passwd", 1, 4).unwrap_err();
        assert!(matches!(err, TransferError::InvalidPath(_)));
    }

    #[test]
    fn traversal_in_session_id_rejected() {
        let dir = TempDir::new().unwrap();
        let writer = ChunkWriter::new(dir.path());
        let err = writer.write_part("../escape", 0, b"x", &|_| {}).unwrap_err();
        assert!(matches!(err, TransferError::InvalidPath(_)));
    }

    #[test]
    fn discard_missing_session_is_ok() {
        let dir = TempDir::new().unwrap();
        let writer = ChunkWriter::new(dir.path());
        writer.discard("never-seen").unwrap();
    }

    #[test]
    fn reader_writer_roundtrip() {
        let dir = TempDir::new().unwrap();
        let original = b"The quick brown fox jumps over the lazy dog";
        let src = create_test_file(dir.path(), "src.txt", original);
        let out_dir = dir.path().join("server");

        let plan = crate::ChunkPlan::new(original.len() as u64, 10).unwrap();
        let mut reader = ChunkReader::open(&src).unwrap();
        let writer = ChunkWriter::new(&out_dir);
        for (index, range) in plan.iter() {
            let data = reader.read_range(range).unwrap();
            writer.write_part("s1", index, &data, &|_| {}).unwrap();
        }

        let dest = writer
            .assemble("s1", "dst.txt", plan.total_chunks(), original.len() as u64)
            .unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), original);
    }
}
