use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};

/// Per-chunk metadata sent alongside the chunk body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Original (unencoded) filename.
    pub filename: String,
    pub target_path: String,
    pub session_id: String,
    /// SHA-256 hex digest of the chunk body (empty means no verification).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

impl ChunkMetadata {
    /// Filename percent-encoded for transport in a header.
    pub fn encoded_filename(&self) -> String {
        encode_header_value(&self.filename)
    }
}

/// Percent-encodes arbitrary UTF-8 so it is a valid header value.
pub fn encode_header_value(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

/// Describes the artifact produced by a successful finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    /// Path of the assembled file, relative to the storage root.
    pub path: String,
    pub name: String,
    pub size: u64,
}
