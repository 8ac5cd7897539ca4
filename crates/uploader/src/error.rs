//! Uploader error types.

use stowage_transfer::TransferError;

use crate::types::JobId;

/// Failures reported by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("chunk acknowledged {received} of {expected} bytes")]
    Incomplete { expected: u64, received: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

impl BackendError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Network(_) | Self::Io(_) | Self::Incomplete { .. } => true,
            Self::Transfer(e) => matches!(
                e,
                TransferError::Io(_) | TransferError::ChecksumMismatch(_)
            ),
            Self::Unauthorized(_) | Self::Rejected(_) => false,
        }
    }
}

/// Errors surfaced by the upload scheduler.
///
/// Per-job failures travel as events and are recorded on the job; only
/// misuse of the API is returned as `Err`.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(#[from] TransferError),

    #[error("chunk {index} failed after {attempts} attempts: {message}")]
    Transfer {
        index: usize,
        attempts: u32,
        message: String,
    },

    #[error("finalize failed: {0}")]
    Finalize(String),

    #[error("upload aborted")]
    Aborted,

    #[error("missing authentication token")]
    MissingToken,

    #[error("unknown upload job: {0}")]
    UnknownJob(JobId),

    #[error("uploader has been disposed")]
    Disposed,
}
