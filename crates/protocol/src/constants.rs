//! Header names and endpoint paths of the storage service.

/// Zero-based index of the chunk carried in the request body.
pub const HEADER_CHUNK_INDEX: &str = "X-Chunk-Index";

/// Total number of chunks the file was split into.
pub const HEADER_TOTAL_CHUNKS: &str = "X-Total-Chunks";

/// Percent-encoded original filename.
pub const HEADER_FILENAME: &str = "X-Filename";

/// Session id scoping the chunk set of one file.
pub const HEADER_SESSION_ID: &str = "X-Session-Id";

/// SHA-256 hex digest of the chunk body.
pub const HEADER_CHUNK_CHECKSUM: &str = "X-Chunk-Checksum";

/// Artifact name of the chunk within the session's staging area.
pub const HEADER_CHUNK_NAME: &str = "X-Chunk-Name";

/// Directory (relative to the target path) that holds in-flight chunk sets.
pub const STAGING_DIR: &str = ".chunks";

const API_PREFIX: &str = "/api/file";

/// Chunk upload endpoint for a target directory.
pub fn upload_path(target_path: &str) -> String {
    endpoint("upload", target_path)
}

/// Finalize (combine) endpoint for a target directory.
pub fn finalize_path(target_path: &str) -> String {
    endpoint("finalize", target_path)
}

/// Best-effort cleanup endpoint for a target directory.
pub fn abort_path(target_path: &str) -> String {
    endpoint("abort", target_path)
}

fn endpoint(action: &str, target_path: &str) -> String {
    let target = target_path.trim_matches('/');
    if target.is_empty() {
        format!("{API_PREFIX}/{action}")
    } else {
        format!("{API_PREFIX}/{action}/{target}")
    }
}
