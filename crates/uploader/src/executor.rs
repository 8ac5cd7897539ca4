//! Single-chunk transfer.

use std::sync::Arc;

use stowage_protocol::{ChunkMetadata, ChunkReceipt};
use stowage_transfer::{ChunkRange, checksum_bytes, read_range};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{ChunkUpload, ProgressFn, StorageBackend};
use crate::error::BackendError;
use crate::types::FileSource;

/// Result of one chunk attempt.
#[derive(Debug)]
pub enum ChunkOutcome {
    Completed(ChunkReceipt),
    Failed(BackendError),
    /// The chunk's cancel token fired. Never retried, never an error.
    Aborted,
}

/// Everything needed to send one chunk attempt.
#[derive(Debug, Clone)]
pub struct ChunkTask {
    pub source: FileSource,
    pub range: ChunkRange,
    pub metadata: ChunkMetadata,
    pub artifact_name: String,
    pub token: String,
}

/// Performs chunk transfers against a backend.
#[derive(Clone)]
pub struct TransferExecutor {
    backend: Arc<dyn StorageBackend>,
}

impl TransferExecutor {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Sends one chunk, racing the call against `cancel`.
    pub async fn execute(
        &self,
        task: ChunkTask,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> ChunkOutcome {
        if cancel.is_cancelled() {
            return ChunkOutcome::Aborted;
        }

        let data = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ChunkOutcome::Aborted,
            data = read_chunk(&task.source, task.range) => data,
        };
        let data = match data {
            Ok(data) => data,
            Err(e) => return ChunkOutcome::Failed(e),
        };

        let expected = task.range.len();
        let mut metadata = task.metadata;
        metadata.checksum = checksum_bytes(&data);
        let chunk = ChunkUpload {
            metadata,
            artifact_name: task.artifact_name,
            data,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(chunk = task.range.index, "chunk transfer aborted");
                return ChunkOutcome::Aborted;
            }
            result = self.backend.upload_chunk(chunk, task.token, progress) => result,
        };

        match result {
            Ok(receipt) if receipt.bytes_received != expected => {
                ChunkOutcome::Failed(BackendError::Incomplete {
                    expected,
                    received: receipt.bytes_received,
                })
            }
            Ok(receipt) => ChunkOutcome::Completed(receipt),
            Err(e) => ChunkOutcome::Failed(e),
        }
    }
}

async fn read_chunk(source: &FileSource, range: ChunkRange) -> Result<Vec<u8>, BackendError> {
    match source {
        FileSource::Path(path) => {
            let path = path.clone();
            tokio::task::spawn_blocking(move || read_range(&path, &range))
                .await
                .map_err(|e| BackendError::Io(std::io::Error::other(e)))?
                .map_err(BackendError::from)
        }
        FileSource::Memory(buf) => {
            let start = range.start as usize;
            let end = range.end as usize;
            buf.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
                BackendError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("range {start}..{end} outside buffer of {} bytes", buf.len()),
                ))
            })
        }
    }
}
