pub mod constants;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use messages::{AbortRequest, ChunkReceipt, FinalizeRequest};
pub use types::{ChunkMetadata, FileDescriptor, encode_header_value};
