use serde::{Deserialize, Serialize};

use crate::TransferError;

/// Half-open byte range `[start, end)` of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Number of chunks `file_size` splits into.
pub fn chunk_count(file_size: u64, chunk_size: u64) -> Result<usize, TransferError> {
    check_sizes(file_size, chunk_size)?;
    Ok(file_size.div_ceil(chunk_size) as usize)
}

/// Partitions `file_size` bytes into contiguous ranges of `chunk_size`.
///
/// Every range except the last is exactly `chunk_size` long.
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Result<Vec<ChunkRange>, TransferError> {
    let count = chunk_count(file_size, chunk_size)?;
    let ranges = (0..count)
        .map(|index| {
            let start = index as u64 * chunk_size;
            ChunkRange {
                index,
                start,
                end: (start + chunk_size).min(file_size),
            }
        })
        .collect();
    Ok(ranges)
}

fn check_sizes(file_size: u64, chunk_size: u64) -> Result<(), TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunkSize(chunk_size));
    }
    if file_size == 0 {
        return Err(TransferError::EmptyFile);
    }
    Ok(())
}
