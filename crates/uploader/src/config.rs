//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use stowage_transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE_MB};

use crate::retry::RetryPolicy;

/// Tunables of the upload scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Files allowed to have chunks admitted at the same time.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    /// Chunk transfers in flight across all files.
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Extra attempts after a chunk's first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    /// Extra attempts for the finalize call.
    #[serde(default = "default_finalize_retries")]
    pub finalize_retries: u32,
}

fn default_max_files() -> usize {
    3
}

fn default_max_chunks() -> usize {
    5
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_max_file_size_mb() -> u64 {
    DEFAULT_MAX_FILE_SIZE_MB
}

fn default_finalize_retries() -> u32 {
    3
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_chunks: default_max_chunks(),
            chunk_size: default_chunk_size(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_file_size_mb: default_max_file_size_mb(),
            finalize_retries: default_finalize_retries(),
        }
    }
}

impl UploaderConfig {
    /// Returns a copy with zero capacities and sizes raised to 1.
    pub fn normalized(mut self) -> Self {
        self.max_files = self.max_files.max(1);
        self.max_chunks = self.max_chunks.max(1);
        self.chunk_size = self.chunk_size.max(1);
        self
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Retry policy for chunk transfers.
    pub fn chunk_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_base_delay())
    }

    /// Retry policy for the finalize call.
    pub fn finalize_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.finalize_retries, self.retry_base_delay())
    }
}
