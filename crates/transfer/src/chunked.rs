use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use stowage_protocol::constants::STAGING_DIR;
use stowage_protocol::{FileDescriptor, FinalizeRequest};
use tracing::{debug, info};

use crate::planner::ChunkRange;
use crate::validation::{validate_name, validate_target_path};
use crate::TransferError;

// ---------------------------------------------------------------------------
// Checksum and range helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Reads exactly the bytes of `range` from the file at `path`.
pub fn read_range(path: &Path, range: &ChunkRange) -> Result<Vec<u8>, TransferError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(range.start))?;
    let mut buf = vec![0u8; range.len() as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Deterministic name of one chunk artifact.
///
/// `report.pdf`, index 7, session `s` becomes `report_chunk_0007_s.pdf`.
pub fn artifact_name(filename: &str, index: usize, session_id: &str) -> String {
    let path = Path::new(filename);
    let ext = path.extension().and_then(|e| e.to_str());
    let base = match ext {
        Some(_) => path.file_stem().and_then(|s| s.to_str()).unwrap_or(filename),
        None => filename,
    };
    match ext {
        Some(ext) => format!("{base}_chunk_{index:04}_{session_id}.{ext}"),
        None => format!("{base}_chunk_{index:04}_{session_id}"),
    }
}

/// Staging directory of a session, relative to the storage root.
pub fn staging_dir(target_path: &str, session_id: &str) -> String {
    let target = target_path.trim_matches('/');
    if target.is_empty() {
        format!("{STAGING_DIR}/{session_id}")
    } else {
        format!("{target}/{STAGING_DIR}/{session_id}")
    }
}

// ---------------------------------------------------------------------------
// ChunkStore
// ---------------------------------------------------------------------------

/// Filesystem storage for chunk artifacts and their assembly.
///
/// Chunks land in `<root>/<target>/.chunks/<session>/` and are combined in
/// index order into `<root>/<target>/<filename>`.
pub struct ChunkStore {
    root: PathBuf,
    finalized: Mutex<HashMap<String, FileDescriptor>>,
}

impl ChunkStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            finalized: Mutex::new(HashMap::new()),
        }
    }

    /// Stores one chunk artifact, verifying `checksum` when non-empty.
    ///
    /// Chunks arriving for an already-finalized session are accepted and
    /// dropped. Returns the number of bytes stored.
    pub fn write_chunk(
        &self,
        target_path: &str,
        session_id: &str,
        filename: &str,
        index: usize,
        data: &[u8],
        checksum: &str,
    ) -> Result<u64, TransferError> {
        validate_target_path(target_path)?;
        validate_name(filename)?;
        validate_name(session_id)?;

        if !checksum.is_empty() && checksum_bytes(data) != checksum {
            return Err(TransferError::ChecksumMismatch(index));
        }

        if self.finalized_descriptor(session_id).is_some() {
            debug!(session = session_id, chunk = index, "chunk for finalized session ignored");
            return Ok(data.len() as u64);
        }

        let dir = self.root.join(staging_dir(target_path, session_id));
        fs::create_dir_all(&dir)?;
        let path = dir.join(artifact_name(filename, index, session_id));
        let mut file = File::create(&path)?;
        file.write_all(data)?;
        file.flush()?;

        debug!(session = session_id, chunk = index, bytes = data.len(), "chunk stored");
        Ok(data.len() as u64)
    }

    /// Assembles every chunk of the session into the final file.
    ///
    /// Repeating the call for a session that already combined returns the
    /// same descriptor without touching the disk.
    pub fn combine(&self, req: &FinalizeRequest) -> Result<FileDescriptor, TransferError> {
        if let Some(desc) = self.finalized_descriptor(&req.session_id) {
            debug!(session = %req.session_id, "finalize repeated, returning recorded result");
            return Ok(desc);
        }

        validate_target_path(&req.target_path)?;
        validate_name(&req.original_filename)?;
        validate_name(&req.session_id)?;

        let staging = self.root.join(staging_dir(&req.target_path, &req.session_id));
        let target_dir = self.root.join(req.target_path.trim_matches('/'));
        let final_path = target_dir.join(&req.original_filename);
        let part_path = target_dir.join(format!(".{}.{}.part", req.original_filename, req.session_id));

        let assembled = match self.assemble(req, &staging, &part_path) {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&part_path);
                return Err(e);
            }
        };

        if assembled != req.file_size {
            let _ = fs::remove_file(&part_path);
            return Err(TransferError::SizeMismatch {
                expected: req.file_size,
                actual: assembled,
            });
        }

        fs::rename(&part_path, &final_path)?;
        remove_dir_if_exists(&staging)?;

        let rel = Path::new(req.target_path.trim_matches('/')).join(&req.original_filename);
        let desc = FileDescriptor {
            path: rel.to_string_lossy().into_owned(),
            name: req.original_filename.clone(),
            size: assembled,
        };
        self.finalized
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(req.session_id.clone(), desc.clone());

        info!(
            session = %req.session_id,
            file = %desc.path,
            size = desc.size,
            chunks = req.total_chunks,
            "chunks combined"
        );
        Ok(desc)
    }

    /// Removes the partial chunks of a session. Missing sessions are fine.
    pub fn discard(&self, target_path: &str, session_id: &str) -> Result<(), TransferError> {
        validate_target_path(target_path)?;
        validate_name(session_id)?;
        let staging = self.root.join(staging_dir(target_path, session_id));
        remove_dir_if_exists(&staging)?;
        debug!(session = session_id, "staging directory discarded");
        Ok(())
    }

    /// Number of chunk artifacts currently staged for a session.
    pub fn staged_chunks(&self, target_path: &str, session_id: &str) -> usize {
        let staging = self.root.join(staging_dir(target_path, session_id));
        fs::read_dir(staging).map(|entries| entries.count()).unwrap_or(0)
    }

    fn finalized_descriptor(&self, session_id: &str) -> Option<FileDescriptor> {
        self.finalized
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    fn assemble(
        &self,
        req: &FinalizeRequest,
        staging: &Path,
        part_path: &Path,
    ) -> Result<u64, TransferError> {
        // Check for gaps before creating any output.
        for index in 0..req.total_chunks {
            let chunk = staging.join(artifact_name(&req.original_filename, index, &req.session_id));
            if !chunk.is_file() {
                return Err(TransferError::MissingChunk {
                    index,
                    total: req.total_chunks,
                });
            }
        }

        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(part_path)?;
        let mut written = 0u64;
        for index in 0..req.total_chunks {
            let chunk = staging.join(artifact_name(&req.original_filename, index, &req.session_id));
            let mut input = File::open(&chunk)?;
            written += io::copy(&mut input, &mut out)?;
        }
        out.flush()?;
        Ok(written)
    }
}

fn remove_dir_if_exists(dir: &Path) -> Result<(), TransferError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan_chunks;
    use tempfile::TempDir;

    fn finalize_request(name: &str, session: &str, chunks: usize, size: u64) -> FinalizeRequest {
        FinalizeRequest {
            original_filename: name.into(),
            total_chunks: chunks,
            session_id: session.into(),
            target_path: "docs".into(),
            file_size: size,
        }
    }

    fn stage_all(store: &ChunkStore, name: &str, session: &str, data: &[u8], chunk: u64) -> usize {
        let ranges = plan_chunks(data.len() as u64, chunk).unwrap();
        // Store out of order to prove assembly is index ordered.
        for r in ranges.iter().rev() {
            let bytes = &data[r.start as usize..r.end as usize];
            store
                .write_chunk("docs", session, name, r.index, bytes, &checksum_bytes(bytes))
                .unwrap();
        }
        ranges.len()
    }

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        assert_eq!(c1, checksum_bytes(b"hello world"));
        assert_eq!(c1.len(), 64);
        assert_ne!(c1, checksum_bytes(b"hello"));
    }

    #[test]
    fn read_range_reads_exact_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src.bin");
        fs::write(&path, b"0123456789").unwrap();

        let range = ChunkRange { index: 1, start: 4, end: 8 };
        assert_eq!(read_range(&path, &range).unwrap(), b"4567");
    }

    #[test]
    fn read_range_past_eof_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.bin");
        fs::write(&path, b"abc").unwrap();

        let range = ChunkRange { index: 0, start: 0, end: 10 };
        assert!(matches!(read_range(&path, &range), Err(TransferError::Io(_))));
    }

    #[test]
    fn artifact_names() {
        assert_eq!(artifact_name("report.pdf", 7, "s1"), "report_chunk_0007_s1.pdf");
        assert_eq!(artifact_name("archive.tar.gz", 12, "s1"), "archive.tar_chunk_0012_s1.gz");
        assert_eq!(artifact_name("README", 0, "s1"), "README_chunk_0000_s1");
        assert_eq!(artifact_name(".env", 1, "s1"), ".env_chunk_0001_s1");
    }

    #[test]
    fn staging_dir_layout() {
        assert_eq!(staging_dir("docs/", "abc"), "docs/.chunks/abc");
        assert_eq!(staging_dir("", "abc"), ".chunks/abc");
    }

    #[test]
    fn combine_assembles_in_index_order() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

        let chunks = stage_all(&store, "blob.bin", "s1", &data, 3000);
        assert_eq!(store.staged_chunks("docs", "s1"), 4);

        let desc = store
            .combine(&finalize_request("blob.bin", "s1", chunks, data.len() as u64))
            .unwrap();
        assert_eq!(desc.name, "blob.bin");
        assert_eq!(desc.path, "docs/blob.bin");
        assert_eq!(desc.size, 10_000);

        assert_eq!(fs::read(dir.path().join("docs/blob.bin")).unwrap(), data);
        assert!(!dir.path().join("docs/.chunks/s1").exists());
    }

    #[test]
    fn combine_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let chunks = stage_all(&store, "a.txt", "s1", b"hello chunked world", 5);
        let req = finalize_request("a.txt", "s1", chunks, 19);

        let first = store.combine(&req).unwrap();
        let second = store.combine(&req).unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read(dir.path().join("docs/a.txt")).unwrap(), b"hello chunked world");
    }

    #[test]
    fn late_chunk_after_finalize_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let chunks = stage_all(&store, "a.txt", "s1", b"abcdef", 3);
        store.combine(&finalize_request("a.txt", "s1", chunks, 6)).unwrap();

        let n = store.write_chunk("docs", "s1", "a.txt", 1, b"def", "").unwrap();
        assert_eq!(n, 3);
        assert!(!dir.path().join("docs/.chunks/s1").exists());
    }

    #[test]
    fn combine_reports_missing_chunk() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        store.write_chunk("docs", "s1", "a.txt", 0, b"abc", "").unwrap();
        store.write_chunk("docs", "s1", "a.txt", 2, b"ghi", "").unwrap();

        let err = store.combine(&finalize_request("a.txt", "s1", 3, 9)).unwrap_err();
        assert!(matches!(err, TransferError::MissingChunk { index: 1, total: 3 }));
        assert!(!dir.path().join("docs/a.txt").exists());
        // Partial chunks stay for a later attempt.
        assert_eq!(store.staged_chunks("docs", "s1"), 2);
    }

    #[test]
    fn combine_verifies_size() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let chunks = stage_all(&store, "a.txt", "s1", b"abcdef", 3);

        let err = store.combine(&finalize_request("a.txt", "s1", chunks, 7)).unwrap_err();
        assert!(matches!(err, TransferError::SizeMismatch { expected: 7, actual: 6 }));
        assert!(!dir.path().join("docs/a.txt").exists());
    }

    #[test]
    fn write_chunk_verifies_checksum() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let bad = "0".repeat(64);
        let err = store.write_chunk("docs", "s1", "a.txt", 3, b"data", &bad).unwrap_err();
        assert!(matches!(err, TransferError::ChecksumMismatch(3)));
        assert_eq!(store.staged_chunks("docs", "s1"), 0);
    }

    #[test]
    fn write_chunk_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        assert!(store.write_chunk("../etc", "s1", "a.txt", 0, b"x", "").is_err());
        assert!(store.write_chunk("docs", "s1", "../a.txt", 0, b"x", "").is_err());
        assert!(store.write_chunk("docs", "../s1", "a.txt", 0, b"x", "").is_err());
    }

    #[test]
    fn same_name_sessions_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        store.write_chunk("docs", "s1", "a.txt", 0, b"first", "").unwrap();
        store.write_chunk("docs", "s2", "a.txt", 0, b"second", "").unwrap();
        assert_eq!(store.staged_chunks("docs", "s1"), 1);
        assert_eq!(store.staged_chunks("docs", "s2"), 1);

        store.combine(&finalize_request("a.txt", "s2", 1, 6)).unwrap();
        assert_eq!(fs::read(dir.path().join("docs/a.txt")).unwrap(), b"second");
        assert_eq!(store.staged_chunks("docs", "s1"), 1);
    }

    #[test]
    fn discard_removes_staging() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        store.write_chunk("docs", "s1", "a.txt", 0, b"abc", "").unwrap();
        store.discard("docs", "s1").unwrap();
        assert_eq!(store.staged_chunks("docs", "s1"), 0);
        // Second discard is a no-op.
        store.discard("docs", "s1").unwrap();
    }
}
