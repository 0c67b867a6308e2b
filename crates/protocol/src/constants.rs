use std::time::Duration;

use uuid::Uuid;

/// Collection route for upload sessions.
pub const SESSIONS_ROUTE: &str = "sessions";

/// Sub-route for chunk uploads within a session.
pub const CHUNKS_ROUTE: &str = "chunks";

/// Sub-route that finalizes a session.
pub const COMPLETE_ROUTE: &str = "complete";

/// Byte offset of the chunk within the source file.
pub const HEADER_CHUNK_OFFSET: &str = "x-chunk-offset";

/// Length of the chunk body in bytes.
pub const HEADER_CHUNK_LENGTH: &str = "x-chunk-length";

/// Hex SHA-256 digest of the chunk body.
pub const HEADER_CHUNK_CHECKSUM: &str = "x-chunk-checksum";

/// Default request timeout for every protocol round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// `POST {base}/sessions`
pub fn sessions_path() -> String {
    SESSIONS_ROUTE.to_string()
}

/// `DELETE {base}/sessions/{id}`
pub fn session_path(session_id: &Uuid) -> String {
    format!("{SESSIONS_ROUTE}/{session_id}")
}

/// `PUT {base}/sessions/{id}/chunks/{index}`
pub fn chunk_path(session_id: &Uuid, index: usize) -> String {
    format!("{SESSIONS_ROUTE}/{session_id}/{CHUNKS_ROUTE}/{index}")
}

/// `POST {base}/sessions/{id}/complete`
pub fn complete_path(session_id: &Uuid) -> String {
    format!("{SESSIONS_ROUTE}/{session_id}/{COMPLETE_ROUTE}")
}
