//! Upload session identity, chunk naming and the finalize step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;
use stowage_protocol::{AbortRequest, FileDescriptor, FinalizeRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::StorageBackend;
use crate::error::UploadError;
use crate::retry::RetryPolicy;

const SESSION_SUFFIX_LEN: usize = 9;

/// Allocates session ids and drives finalize/abort for each file.
pub struct SessionManager {
    backend: Arc<dyn StorageBackend>,
    retry: RetryPolicy,
    finalized: Mutex<HashMap<String, FileDescriptor>>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn StorageBackend>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            retry,
            finalized: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `<unix-millis>-<9 random base36 chars>`.
    pub fn new_session_id() -> String {
        let millis = chrono::Utc::now().timestamp_millis();
        let mut rng = rand::thread_rng();
        let suffix: String = (0..SESSION_SUFFIX_LEN)
            .filter_map(|_| char::from_digit(rng.gen_range(0..36), 36))
            .collect();
        format!("{millis}-{suffix}")
    }

    /// Name of chunk `index` inside the session's staging area.
    pub fn artifact_name(filename: &str, index: usize, session_id: &str) -> String {
        stowage_transfer::artifact_name(filename, index, session_id)
    }

    /// Previously recorded finalize result for a session.
    pub fn finalized(&self, session_id: &str) -> Option<FileDescriptor> {
        self.finalized
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    /// Combines the session's chunks, retrying transient failures.
    ///
    /// A session that already finalized returns its recorded descriptor
    /// without another backend call.
    pub async fn finalize(
        &self,
        req: FinalizeRequest,
        token: String,
        cancel: &CancellationToken,
    ) -> Result<FileDescriptor, UploadError> {
        if let Some(desc) = self.finalized(&req.session_id) {
            debug!(session = %req.session_id, "finalize already done");
            return Ok(desc);
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Aborted),
                result = self.backend.finalize(req.clone(), token.clone()) => result,
            };

            match result {
                Ok(desc) => {
                    info!(
                        session = %req.session_id,
                        file = %desc.path,
                        size = desc.size,
                        attempt,
                        "upload finalized"
                    );
                    self.finalized
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(req.session_id.clone(), desc.clone());
                    return Ok(desc);
                }
                Err(e) if self.retry.should_retry(attempt, &e) => {
                    let delay = self.retry.delay_for_retry(attempt);
                    warn!(
                        session = %req.session_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "finalize failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(UploadError::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(session = %req.session_id, attempt, error = %e, "finalize failed");
                    return Err(UploadError::Finalize(e.to_string()));
                }
            }
        }
    }

    /// Asks the backend to drop a session's partial chunks. Failures are logged.
    pub async fn abort(&self, req: AbortRequest, token: String) {
        let session = req.session_id.clone();
        match self.backend.abort(req, token).await {
            Ok(()) => debug!(session = %session, "partial chunks discarded"),
            Err(e) => warn!(session = %session, error = %e, "abort request failed"),
        }
    }
}
