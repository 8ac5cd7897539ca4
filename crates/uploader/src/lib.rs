//! Chunked upload scheduler.
//!
//! Files are split into byte-range chunks and sent to a storage backend
//! under two concurrency caps: how many files are active at once, and how
//! many chunk transfers are in flight across all of them.
//!
//! # Pipeline
//!
//! 1. **Submit**: validate each file and plan its chunks
//! 2. **Admit**: promote pending files, then pending chunks, up to capacity
//! 3. **Transfer**: send one chunk, racing the call against its cancel token
//! 4. **Retry**: re-queue failed chunks after a linear backoff
//! 5. **Finalize**: combine the chunks once every byte is acknowledged

pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod local;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod types;

#[cfg(test)]
mod mock;

// Re-export primary types for convenience.
pub use backend::{BackendFuture, ChunkUpload, ProgressFn, StaticToken, StorageBackend, TokenProvider};
pub use config::UploaderConfig;
pub use error::{BackendError, UploadError};
pub use executor::{ChunkOutcome, TransferExecutor};
pub use http::HttpBackend;
pub use local::LocalBackend;
pub use retry::RetryPolicy;
pub use scheduler::UploadScheduler;
pub use session::SessionManager;
pub use types::{
    ChunkSnapshot, ChunkStatus, FileSource, JobId, JobSnapshot, JobStatus, UploadEvent,
    UploadFile, UploadStats,
};

pub use stowage_protocol::FileDescriptor;
pub use stowage_transfer::ProgressSnapshot;
