//! Two-level admission queues: files, then chunks.

use std::collections::{HashSet, VecDeque};

use crate::types::JobId;

/// A chunk waiting for (or holding) a transfer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueuedChunk {
    /// Submission sequence of the owning job.
    pub seq: u64,
    pub job: JobId,
    pub index: usize,
}

impl QueuedChunk {
    fn order_key(&self) -> (u64, usize) {
        (self.seq, self.index)
    }
}

/// Work taken out of the queues by [`JobQueue::remove_job`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RemovedWork {
    pub was_pending_file: bool,
    pub was_active_file: bool,
    /// Chunk indices that were still waiting for a slot.
    pub pending_chunks: Vec<usize>,
    /// Chunk indices that held a transfer slot.
    pub active_chunks: Vec<usize>,
}

/// FIFO admission state under a file cap and a global chunk cap.
#[derive(Debug)]
pub struct JobQueue {
    max_files: usize,
    max_chunks: usize,
    pending_files: VecDeque<(u64, JobId)>,
    active_files: HashSet<JobId>,
    pending_chunks: VecDeque<QueuedChunk>,
    active_chunks: HashSet<(JobId, usize)>,
}

impl JobQueue {
    pub fn new(max_files: usize, max_chunks: usize) -> Self {
        Self {
            max_files,
            max_chunks,
            pending_files: VecDeque::new(),
            active_files: HashSet::new(),
            pending_chunks: VecDeque::new(),
            active_chunks: HashSet::new(),
        }
    }

    /// Appends a file in submission order.
    pub fn push_file(&mut self, seq: u64, job: JobId) {
        self.pending_files.push_back((seq, job));
    }

    /// Promotes pending files while file capacity remains.
    ///
    /// Each promoted file's chunks, as returned by `chunks_of`, go to the
    /// tail of the chunk queue in the order given.
    pub fn promote_files<F>(&mut self, mut chunks_of: F) -> Vec<JobId>
    where
        F: FnMut(JobId) -> Vec<usize>,
    {
        let mut promoted = Vec::new();
        while self.active_files.len() < self.max_files {
            let Some((seq, job)) = self.pending_files.pop_front() else {
                break;
            };
            self.active_files.insert(job);
            for index in chunks_of(job) {
                self.pending_chunks.push_back(QueuedChunk { seq, job, index });
            }
            promoted.push(job);
        }
        promoted
    }

    /// Takes the head chunk if a transfer slot is free.
    pub fn next_chunk(&mut self) -> Option<QueuedChunk> {
        if self.active_chunks.len() >= self.max_chunks {
            return None;
        }
        let chunk = self.pending_chunks.pop_front()?;
        self.active_chunks.insert((chunk.job, chunk.index));
        Some(chunk)
    }

    /// Frees the transfer slot held by a chunk.
    pub fn finish_chunk(&mut self, job: JobId, index: usize) -> bool {
        self.active_chunks.remove(&(job, index))
    }

    /// Puts a chunk back at its (file sequence, index) position.
    pub fn requeue_chunk(&mut self, chunk: QueuedChunk) {
        let key = chunk.order_key();
        let pos = self
            .pending_chunks
            .iter()
            .position(|c| c.order_key() > key)
            .unwrap_or(self.pending_chunks.len());
        self.pending_chunks.insert(pos, chunk);
    }

    /// Frees the file slot held by a job.
    pub fn release_file(&mut self, job: JobId) -> bool {
        self.active_files.remove(&job)
    }

    /// Drops pending chunks of a job that are still waiting for a slot.
    pub fn drain_pending_chunks(&mut self, job: JobId) -> Vec<usize> {
        let mut drained = Vec::new();
        self.pending_chunks.retain(|c| {
            if c.job == job {
                drained.push(c.index);
                false
            } else {
                true
            }
        });
        drained
    }

    /// Removes every trace of a job from both levels.
    pub fn remove_job(&mut self, job: JobId) -> RemovedWork {
        let before = self.pending_files.len();
        self.pending_files.retain(|(_, j)| *j != job);
        let was_pending_file = self.pending_files.len() != before;
        let was_active_file = self.active_files.remove(&job);
        let pending_chunks = self.drain_pending_chunks(job);

        let mut active_chunks: Vec<usize> = self
            .active_chunks
            .iter()
            .filter(|(j, _)| *j == job)
            .map(|(_, index)| *index)
            .collect();
        active_chunks.sort_unstable();
        self.active_chunks.retain(|(j, _)| *j != job);

        RemovedWork {
            was_pending_file,
            was_active_file,
            pending_chunks,
            active_chunks,
        }
    }

    pub fn active_file_count(&self) -> usize {
        self.active_files.len()
    }

    pub fn active_chunk_count(&self) -> usize {
        self.active_chunks.len()
    }

    pub fn pending_file_count(&self) -> usize {
        self.pending_files.len()
    }

    pub fn pending_chunk_count(&self) -> usize {
        self.pending_chunks.len()
    }

    /// Whether `dispatch` would admit anything right now.
    pub fn has_admissible_work(&self) -> bool {
        (self.active_files.len() < self.max_files && !self.pending_files.is_empty())
            || (self.active_chunks.len() < self.max_chunks && !self.pending_chunks.is_empty())
    }
}
