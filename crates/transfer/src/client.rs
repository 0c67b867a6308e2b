//! Upload protocol client.
//!
//! [`ProtocolClient`] is the seam between the engine and the network; the
//! engine only ever talks to the server through it, so tests can swap in a
//! mock. [`HttpProtocolClient`] is the production implementation over
//! `reqwest`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chua_protocol::constants::{
    HEADER_CHUNK_CHECKSUM, HEADER_CHUNK_LENGTH, HEADER_CHUNK_OFFSET, chunk_path, complete_path,
    session_path, sessions_path,
};
use chua_protocol::{ChunkAckResponse, CompleteErrorResponse, OpenSessionRequest, OpenSessionResponse};
use reqwest::{StatusCode, Url};
use tracing::debug;
use uuid::Uuid;

use crate::UploadError;
use crate::planner::ChunkDescriptor;

/// Boxed future returned by [`ProtocolClient`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Server reply to an open-session request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOpened {
    pub session_id: Uuid,
    pub duplicated: bool,
}

/// Bytes of one chunk plus their local checksum.
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub data: Vec<u8>,
    pub checksum: String,
}

/// Server acknowledgement for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAck {
    pub index: usize,
    pub accepted: bool,
    pub server_checksum: String,
}

/// Server confirmation that a session was assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub session_id: Uuid,
}

/// Abstract connection to an upload server.
///
/// Errors are already classified: `TransientNetwork` is worth retrying,
/// everything else is not.
pub trait ProtocolClient: Send + Sync {
    /// Base URL this client talks to.
    fn base_url(&self) -> &str;

    /// Creates a server-side session.
    fn open_session(
        &self,
        request: OpenSessionRequest,
    ) -> BoxFuture<'_, Result<SessionOpened, UploadError>>;

    /// Uploads one chunk.
    fn upload_chunk(
        &self,
        session_id: Uuid,
        chunk: ChunkDescriptor,
        payload: ChunkPayload,
    ) -> BoxFuture<'_, Result<ChunkAck, UploadError>>;

    /// Asks the server to assemble the file.
    fn complete_session(&self, session_id: Uuid)
    -> BoxFuture<'_, Result<Confirmation, UploadError>>;

    /// Tells the server to drop the session.
    fn abort_session(&self, session_id: Uuid) -> BoxFuture<'_, Result<(), UploadError>>;
}

/// [`ProtocolClient`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProtocolClient {
    http: reqwest::Client,
    base: Url,
    base_url: String,
    timeout: Duration,
}

impl HttpProtocolClient {
    /// Creates a client with its own connection pool.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| UploadError::InvalidConfiguration(format!("HTTP client: {e}")))?;
        Self::with_client(http, base_url, timeout)
    }

    /// Creates a client sharing an existing `reqwest::Client`.
    pub fn with_client(
        http: reqwest::Client,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, UploadError> {
        let base = parse_base_url(base_url)?;
        Ok(Self {
            http,
            base,
            base_url: base_url.to_string(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> Result<Url, UploadError> {
        self.base
            .join(path)
            .map_err(|e| UploadError::InvalidConfiguration(format!("bad URL path {path}: {e}")))
    }

    async fn open(&self, request: OpenSessionRequest) -> Result<SessionOpened, UploadError> {
        let url = self.url(&sessions_path())?;
        let resp = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(match status_error(status, &body) {
                e @ UploadError::TransientNetwork(_) => e,
                e => UploadError::SessionInit(e.to_string()),
            });
        }

        let parsed: OpenSessionResponse = serde_json::from_slice(&body)
            .map_err(|e| UploadError::SessionInit(format!("malformed open response: {e}")))?;
        Ok(SessionOpened {
            session_id: parsed.session_uuid()?,
            duplicated: parsed.duplicated,
        })
    }

    async fn put_chunk(
        &self,
        session_id: Uuid,
        chunk: ChunkDescriptor,
        payload: ChunkPayload,
    ) -> Result<ChunkAck, UploadError> {
        let url = self.url(&chunk_path(&session_id, chunk.index))?;
        let resp = self
            .http
            .put(url)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(HEADER_CHUNK_OFFSET, chunk.offset)
            .header(HEADER_CHUNK_LENGTH, chunk.length)
            .header(HEADER_CHUNK_CHECKSUM, payload.checksum)
            .body(payload.data)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let ack: ChunkAckResponse = serde_json::from_slice(&body).map_err(|e| {
            UploadError::FatalProtocol(format!("malformed ack for chunk {}: {e}", chunk.index))
        })?;
        Ok(ChunkAck {
            index: ack.index.unwrap_or(chunk.index),
            accepted: ack.accepted,
            server_checksum: ack.server_checksum,
        })
    }

    async fn complete(&self, session_id: Uuid) -> Result<Confirmation, UploadError> {
        let url = self.url(&complete_path(&session_id))?;
        let resp = self
            .http
            .post(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(transport_error)?;
        if status == StatusCode::CONFLICT {
            let missing = serde_json::from_slice::<CompleteErrorResponse>(&body)
                .map(|r| r.missing_indices)
                .unwrap_or_default();
            return Err(UploadError::SessionComplete { missing });
        }
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        Ok(Confirmation { session_id })
    }

    async fn delete(&self, session_id: Uuid) -> Result<(), UploadError> {
        let url = self.url(&session_path(&session_id))?;
        let resp = self
            .http
            .delete(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        // Already gone is as good as deleted.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = resp.bytes().await.unwrap_or_default();
        Err(status_error(status, &body))
    }
}

impl ProtocolClient for HttpProtocolClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn open_session(
        &self,
        request: OpenSessionRequest,
    ) -> BoxFuture<'_, Result<SessionOpened, UploadError>> {
        Box::pin(self.open(request))
    }

    fn upload_chunk(
        &self,
        session_id: Uuid,
        chunk: ChunkDescriptor,
        payload: ChunkPayload,
    ) -> BoxFuture<'_, Result<ChunkAck, UploadError>> {
        Box::pin(self.put_chunk(session_id, chunk, payload))
    }

    fn complete_session(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'_, Result<Confirmation, UploadError>> {
        Box::pin(self.complete(session_id))
    }

    fn abort_session(&self, session_id: Uuid) -> BoxFuture<'_, Result<(), UploadError>> {
        Box::pin(self.delete(session_id))
    }
}

/// Parses and normalizes the server base URL so relative joins append to it.
fn parse_base_url(base_url: &str) -> Result<Url, UploadError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(UploadError::InvalidConfiguration(
            "base URL must not be empty".into(),
        ));
    }
    let mut url = Url::parse(trimmed)
        .map_err(|e| UploadError::InvalidConfiguration(format!("invalid base URL {trimmed}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(UploadError::InvalidConfiguration(format!(
            "unsupported URL scheme: {}",
            url.scheme()
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Classifies a failure to get any response at all.
fn transport_error(e: reqwest::Error) -> UploadError {
    if e.is_builder() {
        return UploadError::FatalProtocol(format!("request build failed: {e}"));
    }
    debug!(error = %e, timeout = e.is_timeout(), connect = e.is_connect(), "transport error");
    UploadError::TransientNetwork(e.to_string())
}

/// Classifies a non-success HTTP status.
fn status_error(status: StatusCode, body: &[u8]) -> UploadError {
    let body = String::from_utf8_lossy(body);
    let msg = if body.trim().is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), body.trim())
    };
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        UploadError::TransientNetwork(msg)
    } else {
        UploadError::FatalProtocol(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Debug, Clone)]
    struct Recorded {
        request_line: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl Recorded {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    fn find_head_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
    }

    /// Starts a mock HTTP server answering each connection with the next
    /// canned `(status, body)` and recording what it received.
    async fn mock_server(
        responses: Vec<(u16, &str)>,
    ) -> (String, Arc<Mutex<Vec<Recorded>>>, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}/api");
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&recorded);
        let responses: Vec<(u16, String)> =
            responses.into_iter().map(|(s, b)| (s, b.to_string())).collect();

        let handle = tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };

                let mut buf = Vec::new();
                let mut tmp = [0u8; 8192];
                let head_end = loop {
                    let n = stream.read(&mut tmp).await.unwrap_or(0);
                    if n == 0 {
                        break buf.len();
                    }
                    buf.extend_from_slice(&tmp[..n]);
                    if let Some(end) = find_head_end(&buf) {
                        break end;
                    }
                };

                let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                let mut lines = head.split("\r\n");
                let request_line = lines.next().unwrap_or_default().to_string();
                let headers: Vec<(String, String)> = lines
                    .filter_map(|l| l.split_once(':'))
                    .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
                    .collect();
                let content_length = headers
                    .iter()
                    .find(|(k, _)| k == "content-length")
                    .and_then(|(_, v)| v.parse::<usize>().ok())
                    .unwrap_or(0);

                let mut body_bytes = buf[head_end..].to_vec();
                while body_bytes.len() < content_length {
                    let n = stream.read(&mut tmp).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    body_bytes.extend_from_slice(&tmp[..n]);
                }

                log.lock().unwrap().push(Recorded {
                    request_line,
                    headers,
                    body: body_bytes,
                });

                let resp = format!(
                    "HTTP/1.1 {status} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (url, recorded, handle)
    }

    fn client(url: &str) -> HttpProtocolClient {
        HttpProtocolClient::new(url, Duration::from_secs(5)).unwrap()
    }

    const SESSION: &str = "67e55044-10b1-426f-9247-bb680e5fe0c8";

    fn session_id() -> Uuid {
        Uuid::parse_str(SESSION).unwrap()
    }

    fn open_request() -> OpenSessionRequest {
        OpenSessionRequest {
            file_name: "a.bin".into(),
            file_size: 10,
            chunk_count: 3,
            chunk_size: 4,
        }
    }

    #[test]
    fn base_url_validation() {
        assert!(parse_base_url("").is_err());
        assert!(parse_base_url("ftp://host/").is_err());
        assert!(parse_base_url("not a url").is_err());
        assert_eq!(
            parse_base_url("http://host/api").unwrap().as_str(),
            "http://host/api/"
        );
        assert_eq!(
            parse_base_url("https://host").unwrap().as_str(),
            "https://host/"
        );
    }

    #[test]
    fn status_classification() {
        let transient = [500, 502, 503, 504, 429, 408];
        for code in transient {
            let err = status_error(StatusCode::from_u16(code).unwrap(), b"");
            assert!(err.is_retryable(), "{code} should be retryable");
        }
        for code in [400, 401, 403, 404, 409, 413, 422] {
            let err = status_error(StatusCode::from_u16(code).unwrap(), b"nope");
            assert!(
                matches!(err, UploadError::FatalProtocol(ref m) if m.contains("nope")),
                "{code} should be fatal"
            );
        }
    }

    #[tokio::test]
    async fn open_session_posts_json() {
        let body = format!(r#"{{"sessionId":"{SESSION}"}}"#);
        let (url, recorded, handle) = mock_server(vec![(201, body.as_str())]).await;

        let opened = client(&url).open_session(open_request()).await.unwrap();
        assert_eq!(opened.session_id, session_id());
        assert!(!opened.duplicated);

        let req = recorded.lock().unwrap()[0].clone();
        assert_eq!(req.request_line, "POST /api/sessions HTTP/1.1");
        let sent: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(sent["fileName"], "a.bin");
        assert_eq!(sent["chunkCount"], 3);

        handle.abort();
    }

    #[tokio::test]
    async fn open_session_duplicated() {
        let body = format!(r#"{{"sessionId":"{SESSION}","duplicated":true}}"#);
        let (url, _, handle) = mock_server(vec![(201, body.as_str())]).await;

        let opened = client(&url).open_session(open_request()).await.unwrap();
        assert!(opened.duplicated);

        handle.abort();
    }

    #[tokio::test]
    async fn open_session_rejected_is_session_init() {
        let (url, _, handle) = mock_server(vec![(400, r#"{"error":"bad"}"#)]).await;

        let err = client(&url).open_session(open_request()).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionInit(_)));

        handle.abort();
    }

    #[tokio::test]
    async fn open_session_malformed_body_is_session_init() {
        let (url, _, handle) = mock_server(vec![(201, r#"{"duplicated":true}"#)]).await;

        let err = client(&url).open_session(open_request()).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionInit(_)));

        handle.abort();
    }

    #[tokio::test]
    async fn open_session_malformed_session_id_is_fatal() {
        let (url, _, handle) = mock_server(vec![(201, r#"{"sessionId":"xyz"}"#)]).await;

        let err = client(&url).open_session(open_request()).await.unwrap_err();
        assert!(
            matches!(err, UploadError::FatalProtocol(ref m) if m.contains("xyz")),
            "{err:?}"
        );

        handle.abort();
    }

    #[tokio::test]
    async fn open_session_503_stays_transient() {
        let (url, _, handle) = mock_server(vec![(503, "")]).await;

        let err = client(&url).open_session(open_request()).await.unwrap_err();
        assert!(matches!(err, UploadError::TransientNetwork(_)));

        handle.abort();
    }

    #[tokio::test]
    async fn upload_chunk_sends_headers_and_body() {
        let (url, recorded, handle) =
            mock_server(vec![(200, r#"{"accepted":true,"serverChecksum":"abc"}"#)]).await;

        let chunk = ChunkDescriptor {
            index: 2,
            offset: 8,
            length: 2,
        };
        let ack = client(&url)
            .upload_chunk(
                session_id(),
                chunk,
                ChunkPayload {
                    data: b"EE".to_vec(),
                    checksum: "abc".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            ack,
            ChunkAck {
                index: 2,
                accepted: true,
                server_checksum: "abc".into()
            }
        );

        let req = recorded.lock().unwrap()[0].clone();
        assert_eq!(
            req.request_line,
            format!("PUT /api/sessions/{SESSION}/chunks/2 HTTP/1.1")
        );
        assert_eq!(req.header(HEADER_CHUNK_OFFSET), Some("8"));
        assert_eq!(req.header(HEADER_CHUNK_LENGTH), Some("2"));
        assert_eq!(req.header(HEADER_CHUNK_CHECKSUM), Some("abc"));
        assert_eq!(req.body, b"EE");

        handle.abort();
    }

    #[tokio::test]
    async fn upload_chunk_conflict_is_fatal() {
        let (url, _, handle) = mock_server(vec![(409, "conflict")]).await;

        let err = client(&url)
            .upload_chunk(
                session_id(),
                ChunkDescriptor {
                    index: 0,
                    offset: 0,
                    length: 1,
                },
                ChunkPayload {
                    data: vec![1],
                    checksum: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::FatalProtocol(_)));

        handle.abort();
    }

    #[tokio::test]
    async fn complete_session_ok() {
        let (url, recorded, handle) = mock_server(vec![(200, "{}")]).await;

        let confirmation = client(&url).complete_session(session_id()).await.unwrap();
        assert_eq!(confirmation.session_id, session_id());
        assert_eq!(
            recorded.lock().unwrap()[0].request_line,
            format!("POST /api/sessions/{SESSION}/complete HTTP/1.1")
        );

        handle.abort();
    }

    #[tokio::test]
    async fn complete_session_lists_missing_indices() {
        let (url, _, handle) = mock_server(vec![(409, r#"{"missingIndices":[1,4]}"#)]).await;

        let err = client(&url).complete_session(session_id()).await.unwrap_err();
        match err {
            UploadError::SessionComplete { missing } => assert_eq!(missing, vec![1, 4]),
            other => panic!("unexpected error: {other:?}"),
        }

        handle.abort();
    }

    #[tokio::test]
    async fn abort_session_sends_delete_and_tolerates_404() {
        let (url, recorded, handle) = mock_server(vec![(204, ""), (404, "")]).await;

        let c = client(&url);
        c.abort_session(session_id()).await.unwrap();
        c.abort_session(session_id()).await.unwrap();
        assert_eq!(
            recorded.lock().unwrap()[0].request_line,
            format!("DELETE /api/sessions/{SESSION} HTTP/1.1")
        );

        handle.abort();
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = client(&format!("http://127.0.0.1:{port}"))
            .complete_session(session_id())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
