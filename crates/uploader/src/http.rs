//! HTTP storage backend.
//!
//! Async client using `reqwest` with Bearer token authentication. Chunk
//! bodies are streamed so progress can be reported while they are sent.

use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use stowage_protocol::constants::{
    HEADER_CHUNK_CHECKSUM, HEADER_CHUNK_INDEX, HEADER_CHUNK_NAME, HEADER_FILENAME,
    HEADER_SESSION_ID, HEADER_TOTAL_CHUNKS, abort_path, finalize_path, upload_path,
};
use stowage_protocol::{
    AbortRequest, ChunkReceipt, FileDescriptor, FinalizeRequest, encode_header_value,
};
use tracing::debug;

use crate::backend::{BackendFuture, ChunkUpload, ProgressFn, StorageBackend};
use crate::error::BackendError;

/// Size of the pieces a chunk body is streamed in.
const STREAM_PIECE: usize = 64 * 1024;

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Storage service reached over HTTP.
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Creates a client for the service at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("stowage/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_chunk(
        &self,
        chunk: ChunkUpload,
        token: String,
        progress: ProgressFn,
    ) -> Result<ChunkReceipt, BackendError> {
        let meta = chunk.metadata;
        let len = chunk.data.len() as u64;
        let url = self.url(&upload_path(&meta.target_path));

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, len)
            .header(HEADER_CHUNK_INDEX, meta.chunk_index)
            .header(HEADER_TOTAL_CHUNKS, meta.total_chunks)
            .header(HEADER_FILENAME, meta.encoded_filename())
            .header(HEADER_SESSION_ID, meta.session_id.as_str())
            .header(HEADER_CHUNK_NAME, encode_header_value(&chunk.artifact_name))
            .header(HEADER_CHUNK_CHECKSUM, meta.checksum.as_str())
            .body(progress_body(chunk.data, progress))
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let body = resp.bytes().await?;
        // An empty or non-JSON 2xx body acknowledges the full chunk.
        let receipt = serde_json::from_slice::<ChunkReceipt>(&body).unwrap_or_else(|_| ChunkReceipt {
            chunk_index: meta.chunk_index,
            bytes_received: len,
            checksum: meta.checksum.clone(),
        });
        debug!(
            session = %meta.session_id,
            chunk = meta.chunk_index,
            bytes = receipt.bytes_received,
            "chunk acknowledged"
        );
        Ok(receipt)
    }

    async fn send_finalize(
        &self,
        req: FinalizeRequest,
        token: String,
    ) -> Result<FileDescriptor, BackendError> {
        let url = self.url(&finalize_path(&req.target_path));
        let resp = self.http.post(&url).bearer_auth(&token).json(&req).send().await?;
        let resp = check_status(resp).await?;
        let body = resp.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| BackendError::Rejected(format!("invalid finalize response: {e}")))
    }

    async fn send_abort(&self, req: AbortRequest, token: String) -> Result<(), BackendError> {
        let url = self.url(&abort_path(&req.target_path));
        let resp = self.http.post(&url).bearer_auth(&token).json(&req).send().await?;
        check_status(resp).await?;
        Ok(())
    }
}

impl StorageBackend for HttpBackend {
    fn upload_chunk(
        &self,
        chunk: ChunkUpload,
        token: String,
        progress: ProgressFn,
    ) -> BackendFuture<'_, ChunkReceipt> {
        Box::pin(self.send_chunk(chunk, token, progress))
    }

    fn finalize(&self, req: FinalizeRequest, token: String) -> BackendFuture<'_, FileDescriptor> {
        Box::pin(self.send_finalize(req, token))
    }

    fn abort(&self, req: AbortRequest, token: String) -> BackendFuture<'_, ()> {
        Box::pin(self.send_abort(req, token))
    }
}

/// Streams `data` in pieces, reporting the running total as each is handed off.
///
/// Pieces are slices of one shared buffer.
fn progress_body(data: Vec<u8>, progress: ProgressFn) -> reqwest::Body {
    let data = Bytes::from(data);
    let total = data.len();
    let stream = futures_util::stream::iter((0..total).step_by(STREAM_PIECE).map(move |start| {
        let end = (start + STREAM_PIECE).min(total);
        progress(end as u64);
        Ok::<_, std::io::Error>(data.slice(start..end))
    }));
    reqwest::Body::wrap_stream(stream)
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    match status.as_u16() {
        401 | 403 => Err(BackendError::Unauthorized(format!("{status}: {body}"))),
        code => Err(BackendError::Http { status: code, body }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use stowage_protocol::ChunkMetadata;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    struct Captured {
        request_line: String,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    }

    /// Serves one request with a canned response and hands back what it saw.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut tmp = [0u8; 4096];
            let header_end = loop {
                let n = sock.read(&mut tmp).await.unwrap();
                buf.extend_from_slice(&tmp[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
            let mut lines = head.split("\r\n");
            let request_line = lines.next().unwrap().to_string();
            let headers: HashMap<String, String> = lines
                .filter_map(|l| l.split_once(": "))
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect();
            let content_length: usize = headers
                .get("content-length")
                .map(|v| v.parse().unwrap())
                .unwrap_or(0);
            while buf.len() < header_end + content_length {
                let n = sock.read(&mut tmp).await.unwrap();
                buf.extend_from_slice(&tmp[..n]);
            }
            let body_bytes = buf[header_end..header_end + content_length].to_vec();

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(Captured {
                request_line,
                headers,
                body: body_bytes,
            });
        });

        (format!("http://{addr}"), rx)
    }

    fn chunk(data: &[u8]) -> ChunkUpload {
        ChunkUpload {
            metadata: ChunkMetadata {
                chunk_index: 1,
                total_chunks: 3,
                filename: "my report.pdf".into(),
                target_path: "/docs/".into(),
                session_id: "1700000000000-abcdefghi".into(),
                checksum: "abc123".into(),
            },
            artifact_name: "my report_chunk_0001_1700000000000-abcdefghi.pdf".into(),
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn upload_chunk_sends_metadata_and_body() {
        let (url, captured) =
            serve_once("200 OK", r#"{"chunkIndex":1,"bytesReceived":5}"#).await;
        let backend = HttpBackend::new(&url).unwrap();
        let seen = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&seen);

        let receipt = backend
            .upload_chunk(chunk(b"hello"), "tok".into(), Arc::new(move |n| s.store(n, Ordering::SeqCst)))
            .await
            .unwrap();
        assert_eq!(receipt.bytes_received, 5);
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        let req = captured.await.unwrap();
        assert_eq!(req.request_line, "POST /api/file/upload/docs HTTP/1.1");
        assert_eq!(req.headers["authorization"], "Bearer tok");
        assert_eq!(req.headers["x-chunk-index"], "1");
        assert_eq!(req.headers["x-total-chunks"], "3");
        assert_eq!(req.headers["x-filename"], "my%20report%2Epdf");
        assert_eq!(req.headers["x-session-id"], "1700000000000-abcdefghi");
        assert_eq!(req.headers["x-chunk-checksum"], "abc123");
        assert_eq!(req.body, b"hello");
    }

    #[tokio::test]
    async fn large_chunk_streams_in_pieces() {
        let len = 2 * STREAM_PIECE + 1000;
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let (url, captured) = serve_once("200 OK", "").await;
        let backend = HttpBackend::new(&url).unwrap();
        let reported = Arc::new(std::sync::Mutex::new(Vec::new()));
        let r = Arc::clone(&reported);

        let mut upload = chunk(&[]);
        upload.data = data.clone();
        let receipt = backend
            .upload_chunk(upload, "tok".into(), Arc::new(move |n| r.lock().unwrap().push(n)))
            .await
            .unwrap();
        assert_eq!(receipt.bytes_received, len as u64);

        let piece = STREAM_PIECE as u64;
        assert_eq!(*reported.lock().unwrap(), vec![piece, 2 * piece, len as u64]);
        let req = captured.await.unwrap();
        assert_eq!(req.headers["content-length"], len.to_string());
        assert_eq!(req.body, data);
    }

    #[tokio::test]
    async fn empty_success_body_acknowledges_whole_chunk() {
        let (url, _captured) = serve_once("200 OK", "").await;
        let backend = HttpBackend::new(&url).unwrap();
        let receipt = backend
            .upload_chunk(chunk(b"hello"), "tok".into(), Arc::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(receipt.chunk_index, 1);
        assert_eq!(receipt.bytes_received, 5);
    }

    #[tokio::test]
    async fn unauthorized_is_not_retryable() {
        let (url, _captured) = serve_once("401 Unauthorized", "token expired").await;
        let backend = HttpBackend::new(&url).unwrap();
        let err = backend
            .upload_chunk(chunk(b"hello"), "tok".into(), Arc::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unauthorized(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let (url, _captured) = serve_once("503 Service Unavailable", "busy").await;
        let backend = HttpBackend::new(&url).unwrap();
        let err = backend
            .upload_chunk(chunk(b"hello"), "tok".into(), Arc::new(|_| {}))
            .await
            .unwrap_err();
        match &err {
            BackendError::Http { status, body } => {
                assert_eq!(*status, 503);
                assert_eq!(body, "busy");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn finalize_posts_json() {
        let (url, captured) = serve_once(
            "200 OK",
            r#"{"path":"docs/a.bin","name":"a.bin","size":42}"#,
        )
        .await;
        let backend = HttpBackend::new(&format!("{url}/")).unwrap();
        let desc = backend
            .finalize(
                FinalizeRequest {
                    original_filename: "a.bin".into(),
                    total_chunks: 2,
                    session_id: "s1".into(),
                    target_path: "docs".into(),
                    file_size: 42,
                },
                "tok".into(),
            )
            .await
            .unwrap();
        assert_eq!(desc.size, 42);

        let req = captured.await.unwrap();
        assert_eq!(req.request_line, "POST /api/file/finalize/docs HTTP/1.1");
        let json: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(json["originalFilename"], "a.bin");
        assert_eq!(json["totalChunks"], 2);
        assert_eq!(json["fileSize"], 42);
    }

    #[tokio::test]
    async fn unreachable_server_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = HttpBackend::new(&format!("http://{addr}")).unwrap();
        let err = backend
            .abort(
                AbortRequest {
                    session_id: "s1".into(),
                    filename: "a.bin".into(),
                    target_path: String::new(),
                },
                "tok".into(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Network(_)));
        assert!(err.is_retryable());
    }
}
