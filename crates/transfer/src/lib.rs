//! Chunk planning, progress accounting and server-side chunk assembly.
//!
//! Everything here is synchronous; async callers run the file I/O through
//! `spawn_blocking`.

mod chunked;
mod format;
mod planner;
mod progress;
mod validation;

pub use chunked::{ChunkStore, artifact_name, checksum_bytes, read_range, staging_dir};
pub use format::{format_eta, format_file_size, format_speed};
pub use planner::{ChunkRange, chunk_count, plan_chunks};
pub use progress::{FileProgress, ProgressSnapshot, SpeedCalculator};
pub use validation::{DEFAULT_MAX_FILE_SIZE_MB, MAX_FILENAME_LEN, validate_file, validate_target_path};

/// Default chunk size: 3 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 3 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(u64),

    #[error("file is empty")]
    EmptyFile,

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("file size too large, maximum allowed size is {max_mb}MB")]
    FileTooLarge { size: u64, max_mb: u64 },

    #[error("checksum mismatch for chunk {0}")]
    ChecksumMismatch(usize),

    #[error("missing chunk {index} of {total}")]
    MissingChunk { index: usize, total: usize },

    #[error("size mismatch: expected {expected} bytes, assembled {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}
