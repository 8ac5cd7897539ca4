//! Data types for the upload scheduler.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stowage_protocol::FileDescriptor;
use stowage_transfer::ProgressSnapshot;
use uuid::Uuid;

/// Stable identifier of an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a file's bytes come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Memory(Arc<[u8]>),
}

/// A file handed to the scheduler.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub size: u64,
    pub source: FileSource,
}

impl UploadFile {
    /// Describes a local file, taking name and size from the filesystem.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let size = std::fs::metadata(path)?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            name,
            size,
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    /// Wraps an in-memory buffer.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            source: FileSource::Memory(data),
        }
    }
}

/// Lifecycle of an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Uploading,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

/// Lifecycle of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Completed,
    /// Failed; waiting out a backoff if a retry is scheduled.
    Error,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSnapshot {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub status: ChunkStatus,
    pub transferred: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Read-only view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    pub size: u64,
    pub target_path: Option<String>,
    pub session_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub progress: ProgressSnapshot,
    pub chunks: Vec<ChunkSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<FileDescriptor>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Job counts by status, plus aggregate bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStats {
    pub total: usize,
    pub pending: usize,
    pub uploading: usize,
    pub completed: usize,
    pub error: usize,
    pub cancelled: usize,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
}

/// Notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Progress {
        job: JobId,
        progress: ProgressSnapshot,
    },
    /// The job failed; the message is also stored on the job.
    Error { job: JobId, message: String },
    Complete { job: JobId, result: FileDescriptor },
    Cancelled { job: JobId },
}

impl UploadEvent {
    pub fn job(&self) -> JobId {
        match self {
            Self::Progress { job, .. }
            | Self::Error { job, .. }
            | Self::Complete { job, .. }
            | Self::Cancelled { job } => *job,
        }
    }
}
