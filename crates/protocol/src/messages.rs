use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ProtocolError, parse_session_id};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Starts a new upload session (`POST /sessions`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionRequest {
    pub file_name: String,
    pub file_size: u64,
    pub chunk_count: usize,
    /// Planned chunk size; lets the server validate every chunk but the last.
    pub chunk_size: u64,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Reply to [`OpenSessionRequest`] (`201 Created`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionResponse {
    /// Kept as text so a malformed id is told apart from a malformed body.
    pub session_id: String,
    /// Set when the server already holds an identical file under this id.
    #[serde(default, skip_serializing_if = "is_false")]
    pub duplicated: bool,
}

impl OpenSessionResponse {
    /// Parses the server-assigned session id.
    pub fn session_uuid(&self) -> Result<Uuid, ProtocolError> {
        parse_session_id(&self.session_id)
    }
}

/// Reply to a chunk upload (`200 OK`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAckResponse {
    pub accepted: bool,
    #[serde(default)]
    pub server_checksum: String,
    /// Echo of the chunk index; older servers omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

/// Successful completion (`200 {}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompleteResponse {}

/// Completion refused because chunks are missing (`409`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteErrorResponse {
    #[serde(default)]
    pub missing_indices: Vec<usize>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

fn is_false(v: &bool) -> bool {
    !*v
}
