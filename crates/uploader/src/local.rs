//! Filesystem-backed storage.

use std::path::Path;
use std::sync::Arc;

use stowage_protocol::{AbortRequest, ChunkReceipt, FileDescriptor, FinalizeRequest};
use stowage_transfer::{ChunkStore, TransferError};

use crate::backend::{BackendFuture, ChunkUpload, ProgressFn, StorageBackend};
use crate::error::BackendError;

/// Stores chunks and assembled files under a local directory.
#[derive(Clone)]
pub struct LocalBackend {
    store: Arc<ChunkStore>,
}

impl LocalBackend {
    pub fn new(root: &Path) -> Self {
        Self {
            store: Arc::new(ChunkStore::new(root)),
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }
}

async fn blocking<T, F>(f: F) -> Result<T, BackendError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TransferError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackendError::Io(std::io::Error::other(e)))?
        .map_err(BackendError::from)
}

impl StorageBackend for LocalBackend {
    fn upload_chunk(
        &self,
        chunk: ChunkUpload,
        _token: String,
        progress: ProgressFn,
    ) -> BackendFuture<'_, ChunkReceipt> {
        let store = Arc::clone(&self.store);
        Box::pin(async move {
            let meta = chunk.metadata;
            let data = chunk.data;
            let checksum = meta.checksum.clone();
            let index = meta.chunk_index;
            let written = blocking(move || {
                store.write_chunk(
                    &meta.target_path,
                    &meta.session_id,
                    &meta.filename,
                    meta.chunk_index,
                    &data,
                    &meta.checksum,
                )
            })
            .await?;
            progress(written);
            Ok(ChunkReceipt {
                chunk_index: index,
                bytes_received: written,
                checksum,
            })
        })
    }

    fn finalize(&self, req: FinalizeRequest, _token: String) -> BackendFuture<'_, FileDescriptor> {
        let store = Arc::clone(&self.store);
        Box::pin(async move { blocking(move || store.combine(&req)).await })
    }

    fn abort(&self, req: AbortRequest, _token: String) -> BackendFuture<'_, ()> {
        let store = Arc::clone(&self.store);
        Box::pin(async move {
            blocking(move || store.discard(&req.target_path, &req.session_id)).await
        })
    }
}
