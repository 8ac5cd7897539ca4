//! Scripted in-memory backend for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use stowage_protocol::{AbortRequest, ChunkReceipt, FileDescriptor, FinalizeRequest};
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;

use crate::backend::{BackendFuture, ChunkUpload, ProgressFn, StorageBackend};
use crate::error::BackendError;

/// Behaviour of one chunk index across attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Script {
    /// Attempts (1-based) up to this number fail.
    fail_first: u32,
    status: u16,
    /// Attempts up to this number acknowledge one byte short.
    short_first: u32,
}

impl Script {
    pub fn fail_times(times: u32, status: u16) -> Self {
        Self {
            fail_first: times,
            status,
            short_first: 0,
        }
    }

    pub fn short_ack(times: u32) -> Self {
        Self {
            fail_first: 0,
            status: 0,
            short_first: times,
        }
    }
}

/// A recorded chunk call.
#[derive(Debug, Clone)]
pub struct UploadCall {
    pub filename: String,
    pub index: usize,
    pub at: Instant,
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<usize, Script>,
    attempts: HashMap<(String, usize), u32>,
    uploads: Vec<ChunkUpload>,
    calls: Vec<UploadCall>,
    in_flight: Vec<String>,
    max_in_flight: usize,
    max_files_in_flight: usize,
    finalize_calls: Vec<FinalizeRequest>,
    finalize_failures: u32,
    finalize_status: u16,
    abort_calls: Vec<AbortRequest>,
    fail_aborts: bool,
}

pub struct MockBackend {
    state: Mutex<MockState>,
    changed: Notify,
    hold: AtomicBool,
    gate: Semaphore,
}

/// Decrements the in-flight count even when the call is dropped mid-way.
struct InFlight<'a> {
    backend: &'a MockBackend,
    session: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut s = self.backend.lock();
        if let Some(pos) = s.in_flight.iter().position(|x| *x == self.session) {
            s.in_flight.remove(pos);
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            changed: Notify::new(),
            hold: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn script_chunk(&self, index: usize, script: Script) {
        self.lock().scripts.insert(index, script);
    }

    /// Makes every upload wait for [`release`](Self::release).
    pub fn hold_uploads(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    /// Lets `n` held uploads finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Stops holding and lets every waiting upload finish.
    pub fn release_all(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn fail_finalize(&self, times: u32, status: u16) {
        let mut s = self.lock();
        s.finalize_failures = times;
        s.finalize_status = status;
    }

    pub fn fail_aborts(&self) {
        self.lock().fail_aborts = true;
    }

    pub fn upload_calls(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn calls(&self) -> Vec<UploadCall> {
        self.lock().calls.clone()
    }

    pub fn uploads(&self) -> Vec<ChunkUpload> {
        self.lock().uploads.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn max_files_in_flight(&self) -> usize {
        self.lock().max_files_in_flight
    }

    pub fn finalize_calls(&self) -> Vec<FinalizeRequest> {
        self.lock().finalize_calls.clone()
    }

    pub fn abort_calls(&self) -> Vec<AbortRequest> {
        self.lock().abort_calls.clone()
    }

    /// Waits until at least `n` chunk calls have started.
    pub async fn wait_for_uploads(&self, n: usize) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.upload_calls() >= n {
                return;
            }
            notified.await;
        }
    }

    /// Waits until at least `n` abort requests arrived.
    pub async fn wait_for_aborts(&self, n: usize) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.abort_calls().len() >= n {
                return;
            }
            notified.await;
        }
    }

    async fn upload(&self, chunk: ChunkUpload, progress: ProgressFn) -> Result<ChunkReceipt, BackendError> {
        let meta = chunk.metadata.clone();
        let len = chunk.data.len() as u64;
        let (attempt, script) = {
            let mut s = self.lock();
            let attempt = s
                .attempts
                .entry((meta.session_id.clone(), meta.chunk_index))
                .or_insert(0);
            *attempt += 1;
            let attempt = *attempt;
            let script = s.scripts.get(&meta.chunk_index).copied().unwrap_or_default();
            s.calls.push(UploadCall {
                filename: meta.filename.clone(),
                index: meta.chunk_index,
                at: Instant::now(),
            });
            s.uploads.push(chunk);
            s.in_flight.push(meta.session_id.clone());
            s.max_in_flight = s.max_in_flight.max(s.in_flight.len());
            let files = s.in_flight.iter().collect::<HashSet<_>>().len();
            s.max_files_in_flight = s.max_files_in_flight.max(files);
            (attempt, script)
        };
        let _guard = InFlight {
            backend: self,
            session: meta.session_id.clone(),
        };
        self.changed.notify_waiters();

        progress(len / 2);

        if self.hold.load(Ordering::SeqCst) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }

        if attempt <= script.fail_first {
            return Err(BackendError::Http {
                status: script.status,
                body: format!("scripted failure {attempt}"),
            });
        }

        let bytes_received = if attempt <= script.short_first {
            len.saturating_sub(1)
        } else {
            progress(len);
            len
        };
        Ok(ChunkReceipt {
            chunk_index: meta.chunk_index,
            bytes_received,
            checksum: meta.checksum,
        })
    }
}

impl StorageBackend for MockBackend {
    fn upload_chunk(
        &self,
        chunk: ChunkUpload,
        _token: String,
        progress: ProgressFn,
    ) -> BackendFuture<'_, ChunkReceipt> {
        Box::pin(self.upload(chunk, progress))
    }

    fn finalize(&self, req: FinalizeRequest, _token: String) -> BackendFuture<'_, FileDescriptor> {
        Box::pin(async move {
            let mut s = self.lock();
            s.finalize_calls.push(req.clone());
            if s.finalize_failures > 0 {
                s.finalize_failures -= 1;
                return Err(BackendError::Http {
                    status: s.finalize_status,
                    body: "scripted finalize failure".into(),
                });
            }
            Ok(FileDescriptor {
                path: format!("{}/{}", req.target_path.trim_matches('/'), req.original_filename),
                name: req.original_filename,
                size: req.file_size,
            })
        })
    }

    fn abort(&self, req: AbortRequest, _token: String) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            let fail = {
                let mut s = self.lock();
                s.abort_calls.push(req);
                s.fail_aborts
            };
            self.changed.notify_waiters();
            if fail {
                Err(BackendError::Network("abort refused".into()))
            } else {
                Ok(())
            }
        })
    }
}
