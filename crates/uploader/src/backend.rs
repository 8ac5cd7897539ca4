//! Storage backend and token provider traits.
//!
//! The scheduler talks to storage only through [`StorageBackend`], which keeps
//! the scheduling logic independent of the transport and testable with mocks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use stowage_protocol::{AbortRequest, ChunkMetadata, ChunkReceipt, FileDescriptor, FinalizeRequest};

use crate::error::BackendError;

/// Boxed future returned by backend calls.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Receives the cumulative bytes sent by the current chunk attempt.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// One chunk ready to be sent.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub metadata: ChunkMetadata,
    /// Deterministic artifact name within the session's staging area.
    pub artifact_name: String,
    pub data: Vec<u8>,
}

/// Remote (or local) storage accepting chunks and assembling them.
pub trait StorageBackend: Send + Sync {
    /// Stores one chunk, reporting progress as bytes are handed off.
    fn upload_chunk(
        &self,
        chunk: ChunkUpload,
        token: String,
        progress: ProgressFn,
    ) -> BackendFuture<'_, ChunkReceipt>;

    /// Combines a session's chunks into the final artifact.
    fn finalize(&self, req: FinalizeRequest, token: String) -> BackendFuture<'_, FileDescriptor>;

    /// Best-effort removal of a session's partial chunks.
    fn abort(&self, req: AbortRequest, token: String) -> BackendFuture<'_, ()>;
}

/// Supplies the bearer token used for every backend call.
pub trait TokenProvider: Send + Sync {
    /// Returns the current token, or `None` when not authenticated.
    fn token(&self) -> Option<String>;
}

/// Fixed token, typically read from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        Self((!token.trim().is_empty()).then_some(token))
    }

    /// A provider that never has a token.
    pub fn none() -> Self {
        Self(None)
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}
