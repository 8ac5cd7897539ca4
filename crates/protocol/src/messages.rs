use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Asks the service to assemble a session's chunks into the final artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub original_filename: String,
    pub total_chunks: usize,
    pub session_id: String,
    pub target_path: String,
    /// Expected size of the assembled file.
    pub file_size: u64,
}

/// Requests removal of a session's partial chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub session_id: String,
    pub filename: String,
    pub target_path: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Acknowledges a stored chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub chunk_index: usize,
    pub bytes_received: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}
