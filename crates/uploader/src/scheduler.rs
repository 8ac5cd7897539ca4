//! Upload scheduler.
//!
//! Owns every job and chunk, admits work through the [`JobQueue`] and reacts
//! to transfer outcomes. All state lives behind one mutex; spawned transfer,
//! backoff and finalize tasks report back through it, so every mutation
//! happens in a single logical turn.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use stowage_protocol::{AbortRequest, ChunkMetadata, FileDescriptor, FinalizeRequest};
use stowage_transfer::{
    ChunkRange, FileProgress, ProgressSnapshot, SpeedCalculator, plan_chunks, validate_file,
    validate_target_path,
};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{ProgressFn, StorageBackend, TokenProvider};
use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::executor::{ChunkOutcome, ChunkTask, TransferExecutor};
use crate::queue::{JobQueue, QueuedChunk};
use crate::retry::RetryPolicy;
use crate::session::SessionManager;
use crate::types::{
    ChunkSnapshot, ChunkStatus, JobId, JobSnapshot, JobStatus, UploadEvent, UploadFile,
    UploadStats,
};

/// Schedules chunked uploads under a file cap and a global chunk cap.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct UploadScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: UploaderConfig,
    retry: RetryPolicy,
    tokens: Arc<dyn TokenProvider>,
    executor: TransferExecutor,
    sessions: SessionManager,
    state: Mutex<State>,
    idle: Notify,
}

struct State {
    jobs: HashMap<JobId, Job>,
    order: Vec<JobId>,
    queue: JobQueue,
    next_seq: u64,
    running: bool,
    disposed: bool,
    token: Option<String>,
    /// Spawned transfer, backoff and finalize tasks not yet reported back.
    outstanding: usize,
    subscribers: Vec<Subscriber>,
    overall_speed: SpeedCalculator,
}

struct Subscriber {
    job: Option<JobId>,
    tx: mpsc::UnboundedSender<UploadEvent>,
}

struct Job {
    id: JobId,
    seq: u64,
    file: UploadFile,
    target_path: Option<String>,
    session_id: String,
    status: JobStatus,
    error: Option<String>,
    chunks: Vec<ChunkState>,
    progress: FileProgress,
    cancel: CancellationToken,
    finalizing: bool,
    result: Option<FileDescriptor>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

struct ChunkState {
    range: ChunkRange,
    status: ChunkStatus,
    attempts: u32,
    error: Option<String>,
    /// Token of the running attempt or backoff wait.
    cancel: Option<CancellationToken>,
    backing_off: bool,
}

// ---------------------------------------------------------------------------
// Job bookkeeping
// ---------------------------------------------------------------------------

impl Job {
    fn new(id: JobId, seq: u64, file: UploadFile, target_path: Option<String>, ranges: Vec<ChunkRange>) -> Self {
        let progress = FileProgress::new(&ranges);
        let chunks = ranges
            .into_iter()
            .map(|range| ChunkState {
                range,
                status: ChunkStatus::Pending,
                attempts: 0,
                error: None,
                cancel: None,
                backing_off: false,
            })
            .collect();
        Self {
            id,
            seq,
            file,
            target_path,
            session_id: SessionManager::new_session_id(),
            status: JobStatus::Pending,
            error: None,
            chunks,
            progress,
            cancel: CancellationToken::new(),
            finalizing: false,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    fn pending_chunk_indices(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.status == ChunkStatus::Pending)
            .map(|(i, _)| i)
            .collect()
    }

    /// True while any chunk may still be transferred.
    fn has_live_chunks(&self) -> bool {
        self.chunks.iter().any(|c| {
            matches!(c.status, ChunkStatus::Pending | ChunkStatus::Uploading) || c.backing_off
        })
    }

    /// Every chunk acknowledged and counted to its exact length.
    fn is_complete(&self) -> bool {
        self.chunks.iter().all(|c| c.status == ChunkStatus::Completed)
            && self.progress.is_byte_complete()
    }

    fn finish(&mut self, status: JobStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }

    /// Marks every unfinished chunk aborted.
    fn abort_chunks(&mut self) {
        for chunk in &mut self.chunks {
            if chunk.status != ChunkStatus::Completed {
                chunk.status = ChunkStatus::Aborted;
            }
            chunk.backing_off = false;
            chunk.cancel = None;
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            name: self.file.name.clone(),
            size: self.file.size,
            target_path: self.target_path.clone(),
            session_id: self.session_id.clone(),
            status: self.status,
            error: self.error.clone(),
            progress: self.progress.snapshot(),
            chunks: self
                .chunks
                .iter()
                .enumerate()
                .map(|(i, c)| ChunkSnapshot {
                    index: c.range.index,
                    start: c.range.start,
                    end: c.range.end,
                    status: c.status,
                    transferred: self.progress.chunk_transferred(i),
                    attempts: c.attempts,
                    error: c.error.clone(),
                })
                .collect(),
            result: self.result.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

impl State {
    fn emit(&mut self, event: UploadEvent) {
        let job = event.job();
        self.subscribers.retain(|sub| match sub.job {
            Some(id) if id != job => !sub.tx.is_closed(),
            _ => sub.tx.send(event.clone()).is_ok(),
        });
    }

    fn is_idle(&self) -> bool {
        self.outstanding == 0
            && self
                .jobs
                .values()
                .all(|j| !matches!(j.status, JobStatus::Pending | JobStatus::Uploading))
    }

    fn counted_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Uploading | JobStatus::Completed))
    }

    fn sample_overall(&mut self) {
        let uploaded = self.counted_jobs().map(|j| j.progress.uploaded()).sum::<u64>();
        self.overall_speed.add_sample(uploaded);
    }

    /// Fails a job after a non-recoverable chunk or finalize error.
    ///
    /// Chunks already in flight keep running and their results are still
    /// recorded; queued chunks and backoff waits are dropped.
    fn fail_job(&mut self, id: JobId, err: UploadError) {
        let drained = self.queue.drain_pending_chunks(id);
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        if job.status.is_terminal() {
            return;
        }
        for index in drained {
            if let Some(chunk) = job.chunks.get_mut(index) {
                chunk.status = ChunkStatus::Aborted;
            }
        }
        for chunk in job.chunks.iter_mut().filter(|c| c.backing_off) {
            if let Some(token) = chunk.cancel.take() {
                token.cancel();
            }
            chunk.backing_off = false;
            chunk.status = ChunkStatus::Aborted;
        }
        let message = err.to_string();
        error!(job = %id, file = %job.file.name, error = %message, "upload failed");
        job.finish(JobStatus::Error, Some(message.clone()));
        self.emit(UploadEvent::Error { job: id, message });
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl UploadScheduler {
    /// Creates a scheduler. Nothing is transferred until [`start`](Self::start).
    pub fn new(
        config: UploaderConfig,
        backend: Arc<dyn StorageBackend>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let config = config.normalized();
        let retry = config.chunk_retry();
        let sessions = SessionManager::new(Arc::clone(&backend), config.finalize_retry());
        let state = State {
            jobs: HashMap::new(),
            order: Vec::new(),
            queue: JobQueue::new(config.max_files, config.max_chunks),
            next_seq: 0,
            running: false,
            disposed: false,
            token: None,
            outstanding: 0,
            subscribers: Vec::new(),
            overall_speed: SpeedCalculator::default(),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                retry,
                tokens,
                executor: TransferExecutor::new(backend),
                sessions,
                state: Mutex::new(state),
                idle: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.inner.config
    }

    /// Validates and queues files; returns one job id per file, in order.
    ///
    /// Files failing validation become `Error` jobs right away and never
    /// transfer. `max_file_size_mb` overrides the configured limit.
    pub fn submit(
        &self,
        files: Vec<UploadFile>,
        target_path: Option<&str>,
        max_file_size_mb: Option<u64>,
    ) -> Result<Vec<JobId>, UploadError> {
        let inner = &self.inner;
        let mut state = inner.lock();
        if state.disposed {
            return Err(UploadError::Disposed);
        }

        let limit = max_file_size_mb.or(Some(inner.config.max_file_size_mb));
        let mut ids = Vec::with_capacity(files.len());
        for file in files {
            let id = JobId::new();
            let seq = state.next_seq;
            state.next_seq += 1;

            let planned = validate_file(&file.name, file.size, limit)
                .and_then(|()| target_path.map_or(Ok(()), validate_target_path))
                .and_then(|()| plan_chunks(file.size, inner.config.chunk_size));

            match planned {
                Ok(ranges) => {
                    let job = Job::new(id, seq, file, target_path.map(str::to_string), ranges);
                    info!(
                        job = %id,
                        file = %job.file.name,
                        size = job.file.size,
                        chunks = job.chunks.len(),
                        session = %job.session_id,
                        "upload queued"
                    );
                    state.queue.push_file(seq, id);
                    state.jobs.insert(id, job);
                }
                Err(e) => {
                    let message = UploadError::Validation(e).to_string();
                    warn!(job = %id, file = %file.name, error = %message, "file rejected");
                    let mut job = Job::new(id, seq, file, target_path.map(str::to_string), Vec::new());
                    job.finish(JobStatus::Error, Some(message.clone()));
                    state.jobs.insert(id, job);
                    state.emit(UploadEvent::Error { job: id, message });
                }
            }
            state.order.push(id);
            ids.push(id);
        }

        inner.dispatch(&mut state);
        Ok(ids)
    }

    /// Starts transferring and resolves once no job is pending or uploading.
    ///
    /// `target_path` applies to pending jobs submitted without one. A missing
    /// token fails every pending job and returns [`UploadError::MissingToken`].
    pub async fn start(&self, target_path: Option<&str>) -> Result<(), UploadError> {
        {
            let inner = &self.inner;
            let mut state = inner.lock();
            if state.disposed {
                return Err(UploadError::Disposed);
            }
            if let Some(target) = target_path {
                validate_target_path(target)?;
                for job in state.jobs.values_mut() {
                    if job.status == JobStatus::Pending && job.target_path.is_none() {
                        job.target_path = Some(target.to_string());
                    }
                }
            }

            let Some(token) = inner.tokens.token().filter(|t| !t.is_empty()) else {
                let pending: Vec<JobId> = state
                    .order
                    .iter()
                    .copied()
                    .filter(|id| state.jobs.get(id).is_some_and(|j| j.status == JobStatus::Pending))
                    .collect();
                warn!(jobs = pending.len(), "no authentication token, failing pending uploads");
                for id in pending {
                    state.queue.remove_job(id);
                    if let Some(job) = state.jobs.get_mut(&id) {
                        job.abort_chunks();
                    }
                    state.fail_job(id, UploadError::MissingToken);
                }
                return Err(UploadError::MissingToken);
            };

            state.token = Some(token);
            state.running = true;
            info!(
                pending = state.queue.pending_file_count(),
                max_files = inner.config.max_files,
                max_chunks = inner.config.max_chunks,
                "upload started"
            );
            inner.dispatch(&mut state);
        }

        self.inner.wait_idle().await;
        if self.inner.lock().disposed {
            return Err(UploadError::Disposed);
        }
        Ok(())
    }

    /// Runs one admission pass. Repeated calls without new capacity or
    /// work start nothing.
    pub fn dispatch(&self) -> Result<(), UploadError> {
        let mut state = self.inner.lock();
        if state.disposed {
            return Err(UploadError::Disposed);
        }
        self.inner.dispatch(&mut state);
        Ok(())
    }

    /// Cancels a job: queued chunks are dropped, running ones aborted.
    ///
    /// Cancelling a finished job is a no-op.
    pub fn cancel(&self, id: JobId) -> Result<(), UploadError> {
        let mut state = self.inner.lock();
        if state.disposed {
            return Err(UploadError::Disposed);
        }
        let status = state.jobs.get(&id).ok_or(UploadError::UnknownJob(id))?.status;
        if status.is_terminal() {
            return Ok(());
        }
        self.inner.cancel_job(&mut state, id);
        self.inner.dispatch(&mut state);
        drop(state);
        self.inner.idle.notify_waiters();
        Ok(())
    }

    /// Events of a single job.
    pub fn subscribe(&self, id: JobId) -> Result<mpsc::UnboundedReceiver<UploadEvent>, UploadError> {
        let mut state = self.inner.lock();
        if state.disposed {
            return Err(UploadError::Disposed);
        }
        if !state.jobs.contains_key(&id) {
            return Err(UploadError::UnknownJob(id));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber { job: Some(id), tx });
        Ok(rx)
    }

    /// Events of every job.
    pub fn events(&self) -> Result<mpsc::UnboundedReceiver<UploadEvent>, UploadError> {
        let mut state = self.inner.lock();
        if state.disposed {
            return Err(UploadError::Disposed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber { job: None, tx });
        Ok(rx)
    }

    /// Forgets a job, cancelling it first if it is still active.
    pub fn remove(&self, id: JobId) -> Result<(), UploadError> {
        let mut state = self.inner.lock();
        if state.disposed {
            return Err(UploadError::Disposed);
        }
        if !state.jobs.contains_key(&id) {
            return Err(UploadError::UnknownJob(id));
        }
        self.inner.forget_job(&mut state, id);
        self.inner.dispatch(&mut state);
        drop(state);
        self.inner.idle.notify_waiters();
        Ok(())
    }

    /// Forgets completed jobs. Returns how many were removed.
    pub fn clear_completed(&self) -> Result<usize, UploadError> {
        let mut state = self.inner.lock();
        if state.disposed {
            return Err(UploadError::Disposed);
        }
        let before = state.jobs.len();
        state.jobs.retain(|_, j| j.status != JobStatus::Completed);
        let State { jobs, order, .. } = &mut *state;
        order.retain(|id| jobs.contains_key(id));
        Ok(before - state.jobs.len())
    }

    /// Cancels every active job and forgets all of them.
    pub fn clear_all(&self) -> Result<(), UploadError> {
        let mut state = self.inner.lock();
        if state.disposed {
            return Err(UploadError::Disposed);
        }
        let ids: Vec<JobId> = state.order.clone();
        for id in ids {
            self.inner.forget_job(&mut state, id);
        }
        state.jobs.clear();
        state.order.clear();
        state.overall_speed.reset();
        drop(state);
        self.inner.idle.notify_waiters();
        Ok(())
    }

    pub fn stats(&self) -> Result<UploadStats, UploadError> {
        let state = self.inner.lock();
        if state.disposed {
            return Err(UploadError::Disposed);
        }
        let mut stats = UploadStats {
            total: state.jobs.len(),
            ..Default::default()
        };
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Uploading => stats.uploading += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Error => stats.error += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        for job in state.counted_jobs() {
            stats.uploaded_bytes += job.progress.uploaded();
            stats.total_bytes += job.progress.total_bytes();
        }
        Ok(stats)
    }

    /// Progress across every pending, uploading and completed job.
    pub fn overall_progress(&self) -> Result<ProgressSnapshot, UploadError> {
        let state = self.inner.lock();
        if state.disposed {
            return Err(UploadError::Disposed);
        }
        let (uploaded, total) = state
            .counted_jobs()
            .fold((0u64, 0u64), |(u, t), j| (u + j.progress.uploaded(), t + j.progress.total_bytes()));
        let speed = state.overall_speed.bytes_per_second();
        Ok(ProgressSnapshot {
            uploaded_bytes: uploaded,
            total_bytes: total,
            percent: if total == 0 { 0.0 } else { uploaded as f64 * 100.0 / total as f64 },
            speed,
            eta_secs: state
                .overall_speed
                .eta(total.saturating_sub(uploaded))
                .map(|d| d.as_secs_f64()),
        })
    }

    /// Snapshots of every job in submission order.
    pub fn jobs(&self) -> Result<Vec<JobSnapshot>, UploadError> {
        let state = self.inner.lock();
        if state.disposed {
            return Err(UploadError::Disposed);
        }
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .map(Job::snapshot)
            .collect())
    }

    pub fn job(&self, id: JobId) -> Result<JobSnapshot, UploadError> {
        let state = self.inner.lock();
        if state.disposed {
            return Err(UploadError::Disposed);
        }
        state
            .jobs
            .get(&id)
            .map(Job::snapshot)
            .ok_or(UploadError::UnknownJob(id))
    }

    /// Cancels everything and closes all event streams. Every later call
    /// returns [`UploadError::Disposed`].
    pub fn dispose(&self) {
        let mut state = self.inner.lock();
        if state.disposed {
            return;
        }
        let active: Vec<JobId> = state
            .order
            .iter()
            .copied()
            .filter(|id| state.jobs.get(id).is_some_and(|j| !j.status.is_terminal()))
            .collect();
        for id in active {
            self.inner.cancel_job(&mut state, id);
        }
        state.disposed = true;
        state.running = false;
        state.subscribers.clear();
        info!("uploader disposed");
        drop(state);
        self.inner.idle.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Scheduling internals
// ---------------------------------------------------------------------------

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock();
                if state.disposed || state.is_idle() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Admission pass: promote files, then launch chunks, up to capacity.
    fn dispatch(self: &Arc<Self>, state: &mut State) {
        if !state.running || state.disposed {
            return;
        }

        let State { jobs, queue, .. } = state;
        let promoted = queue.promote_files(|id| {
            jobs.get(&id)
                .map(Job::pending_chunk_indices)
                .unwrap_or_default()
        });
        for id in promoted {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Uploading;
                info!(job = %id, file = %job.file.name, "upload active");
            }
        }

        while let Some(next) = state.queue.next_chunk() {
            self.launch_chunk(state, next);
        }

        debug_assert!(state.queue.active_file_count() <= self.config.max_files);
        debug_assert!(state.queue.active_chunk_count() <= self.config.max_chunks);
        debug_assert!(!state.queue.has_admissible_work());
    }

    fn launch_chunk(self: &Arc<Self>, state: &mut State, next: QueuedChunk) {
        let token = state.token.clone().unwrap_or_default();
        let Some(job) = state.jobs.get_mut(&next.job) else {
            state.queue.finish_chunk(next.job, next.index);
            return;
        };
        let total_chunks = job.chunks.len();
        let Some(chunk) = job.chunks.get_mut(next.index) else {
            state.queue.finish_chunk(next.job, next.index);
            return;
        };

        chunk.status = ChunkStatus::Uploading;
        chunk.attempts += 1;
        chunk.backing_off = false;
        let cancel = job.cancel.child_token();
        chunk.cancel = Some(cancel.clone());
        let attempt = chunk.attempts;
        let range = chunk.range;
        job.progress.reset_chunk(next.index);

        let task = ChunkTask {
            source: job.file.source.clone(),
            range,
            metadata: ChunkMetadata {
                chunk_index: next.index,
                total_chunks,
                filename: job.file.name.clone(),
                target_path: job.target_path.clone().unwrap_or_default(),
                session_id: job.session_id.clone(),
                checksum: String::new(),
            },
            artifact_name: SessionManager::artifact_name(&job.file.name, next.index, &job.session_id),
            token,
        };
        debug!(
            job = %next.job,
            chunk = next.index,
            attempt,
            bytes = range.len(),
            queued = state.queue.pending_chunk_count(),
            "chunk admitted"
        );
        state.outstanding += 1;

        let (id, index) = (next.job, next.index);
        let progress: ProgressFn = {
            let inner = Arc::clone(self);
            Arc::new(move |bytes| inner.on_chunk_progress(id, index, attempt, bytes))
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = inner.executor.execute(task, progress, cancel).await;
            inner.on_chunk_finished(id, index, attempt, outcome);
        });
    }

    fn on_chunk_progress(&self, id: JobId, index: usize, attempt: u32, bytes: u64) {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(&id) else {
            return;
        };
        let live = job
            .chunks
            .get(index)
            .is_some_and(|c| c.status == ChunkStatus::Uploading && c.attempts == attempt);
        if !live {
            return;
        }
        job.progress.record(index, bytes);
        let progress = job.progress.snapshot();
        state.sample_overall();
        state.emit(UploadEvent::Progress { job: id, progress });
    }

    fn on_chunk_finished(self: &Arc<Self>, id: JobId, index: usize, attempt: u32, outcome: ChunkOutcome) {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        self.apply_outcome(&mut state, id, index, attempt, outcome);
        self.dispatch(&mut state);
        drop(state);
        self.idle.notify_waiters();
    }

    fn apply_outcome(
        self: &Arc<Self>,
        state: &mut State,
        id: JobId,
        index: usize,
        attempt: u32,
        outcome: ChunkOutcome,
    ) {
        let Some(job) = state.jobs.get_mut(&id) else {
            state.queue.finish_chunk(id, index);
            state.queue.release_file(id);
            debug!(job = %id, chunk = index, attempt, "result for removed job dropped");
            return;
        };
        let job_active = job.status == JobStatus::Uploading;
        let Some(chunk) = job.chunks.get_mut(index) else {
            return;
        };
        if chunk.status != ChunkStatus::Uploading || chunk.attempts != attempt {
            debug!(job = %id, chunk = index, attempt, "stale chunk result ignored");
            return;
        }
        chunk.cancel = None;

        match outcome {
            ChunkOutcome::Completed(_) => {
                chunk.status = ChunkStatus::Completed;
                chunk.error = None;
                job.progress.complete_chunk(index);
                debug!(job = %id, chunk = index, attempt, "chunk completed");
                let progress = job.progress.snapshot();
                state.queue.finish_chunk(id, index);
                state.sample_overall();
                state.emit(UploadEvent::Progress { job: id, progress });
            }
            ChunkOutcome::Aborted => {
                chunk.status = ChunkStatus::Aborted;
                state.queue.finish_chunk(id, index);
            }
            ChunkOutcome::Failed(err) => {
                let message = err.to_string();
                chunk.status = ChunkStatus::Error;
                chunk.error = Some(message.clone());
                state.queue.finish_chunk(id, index);

                if job_active && self.retry.should_retry(attempt, &err) {
                    let delay = self.retry.delay_for_retry(attempt);
                    warn!(
                        job = %id,
                        chunk = index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "chunk failed, retrying"
                    );
                    let cancel = job.cancel.child_token();
                    chunk.cancel = Some(cancel.clone());
                    chunk.backing_off = true;
                    state.outstanding += 1;

                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        let elapsed = tokio::select! {
                            _ = cancel.cancelled() => false,
                            _ = tokio::time::sleep(delay) => true,
                        };
                        inner.on_backoff_finished(id, index, attempt, elapsed);
                    });
                } else {
                    warn!(
                        job = %id,
                        chunk = index,
                        attempt,
                        max_attempts = self.retry.max_attempts(),
                        error = %message,
                        "chunk failed"
                    );
                    if job_active {
                        state.fail_job(
                            id,
                            UploadError::Transfer {
                                index,
                                attempts: attempt,
                                message,
                            },
                        );
                    }
                }
            }
        }

        self.settle(state, id);
    }

    fn on_backoff_finished(self: &Arc<Self>, id: JobId, index: usize, attempt: u32, elapsed: bool) {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if elapsed {
            let requeue = state.jobs.get_mut(&id).and_then(|job| {
                if job.status != JobStatus::Uploading {
                    return None;
                }
                let seq = job.seq;
                let chunk = job.chunks.get_mut(index)?;
                if !chunk.backing_off || chunk.attempts != attempt {
                    return None;
                }
                chunk.backing_off = false;
                chunk.cancel = None;
                chunk.status = ChunkStatus::Pending;
                Some(QueuedChunk { seq, job: id, index })
            });
            if let Some(chunk) = requeue {
                debug!(job = %id, chunk = index, "chunk re-queued");
                state.queue.requeue_chunk(chunk);
            }
        }
        self.dispatch(&mut state);
        drop(state);
        self.idle.notify_waiters();
    }

    /// Releases the file slot once no chunk of the job can run again, and
    /// starts finalize when every byte is accounted for.
    fn settle(self: &Arc<Self>, state: &mut State, id: JobId) {
        let Some(job) = state.jobs.get(&id) else {
            return;
        };
        if job.has_live_chunks() {
            return;
        }
        if state.queue.release_file(id) {
            debug!(job = %id, "file slot released");
        }
        if job.status != JobStatus::Uploading || job.finalizing {
            return;
        }
        if job.is_complete() {
            self.begin_finalize(state, id);
        } else {
            state.fail_job(id, UploadError::Aborted);
        }
    }

    fn begin_finalize(self: &Arc<Self>, state: &mut State, id: JobId) {
        let token = state.token.clone().unwrap_or_default();
        let Some(job) = state.jobs.get_mut(&id) else {
            return;
        };
        job.finalizing = true;
        let req = FinalizeRequest {
            original_filename: job.file.name.clone(),
            total_chunks: job.chunks.len(),
            session_id: job.session_id.clone(),
            target_path: job.target_path.clone().unwrap_or_default(),
            file_size: job.file.size,
        };
        let cancel = job.cancel.clone();
        info!(job = %id, file = %job.file.name, chunks = req.total_chunks, "all chunks uploaded, finalizing");
        state.outstanding += 1;

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = inner.sessions.finalize(req, token, &cancel).await;
            inner.on_finalized(id, result);
        });
    }

    fn on_finalized(self: &Arc<Self>, id: JobId, result: Result<FileDescriptor, UploadError>) {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if let Some(job) = state.jobs.get_mut(&id) {
            job.finalizing = false;
            if job.status == JobStatus::Uploading {
                match result {
                    Ok(desc) => {
                        info!(job = %id, file = %desc.path, size = desc.size, "upload completed");
                        job.result = Some(desc.clone());
                        job.finish(JobStatus::Completed, None);
                        state.emit(UploadEvent::Complete { job: id, result: desc });
                    }
                    Err(UploadError::Aborted) => {}
                    Err(e) => state.fail_job(id, e),
                }
            }
        }
        self.dispatch(&mut state);
        drop(state);
        self.idle.notify_waiters();
    }

    /// Drops a job, cancelling it first when still active.
    ///
    /// A failed job may still have sibling chunks in flight; their slots
    /// are freed here and their transfers cancelled.
    fn forget_job(self: &Arc<Self>, state: &mut State, id: JobId) {
        let Some(job) = state.jobs.get(&id) else {
            return;
        };
        if job.status.is_terminal() {
            job.cancel.cancel();
            let removed = state.queue.remove_job(id);
            if !removed.active_chunks.is_empty() || removed.was_active_file {
                debug!(
                    job = %id,
                    in_flight = removed.active_chunks.len(),
                    file_slot = removed.was_active_file,
                    "slots of finished job released"
                );
            }
        } else {
            self.cancel_job(state, id);
        }
        state.jobs.remove(&id);
        state.order.retain(|j| *j != id);
    }

    /// Cascading cancel of a pending or uploading job.
    fn cancel_job(self: &Arc<Self>, state: &mut State, id: JobId) {
        let removed = state.queue.remove_job(id);
        let token = state.token.clone();
        let Some(job) = state.jobs.get_mut(&id) else {
            return;
        };
        let was_uploading = job.status == JobStatus::Uploading;
        job.cancel.cancel();
        job.abort_chunks();
        job.finish(JobStatus::Cancelled, None);
        info!(
            job = %id,
            file = %job.file.name,
            waiting = removed.was_pending_file,
            queued = removed.pending_chunks.len(),
            in_flight = removed.active_chunks.len(),
            "upload cancelled"
        );

        let abort = was_uploading.then(|| AbortRequest {
            session_id: job.session_id.clone(),
            filename: job.file.name.clone(),
            target_path: job.target_path.clone().unwrap_or_default(),
        });
        state.emit(UploadEvent::Cancelled { job: id });

        if let (Some(req), Some(token)) = (abort, token) {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.sessions.abort(req, token).await });
        }
    }
}
