//! Wire protocol types for chua chunked uploads.
//!
//! The protocol is plain HTTP with JSON control bodies and raw binary chunk
//! bodies. See [`constants`] for routes and header names, [`messages`] for the
//! JSON payloads.

pub mod checksum;
pub mod constants;
pub mod messages;

// Re-export primary types for convenience.
pub use checksum::checksum_bytes;
pub use messages::{
    ChunkAckResponse, CompleteErrorResponse, CompleteResponse, OpenSessionRequest,
    OpenSessionResponse,
};

/// Errors produced while decoding wire values.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
}

/// Parses a session id in its canonical textual form.
pub fn parse_session_id(raw: &str) -> Result<uuid::Uuid, ProtocolError> {
    uuid::Uuid::parse_str(raw.trim()).map_err(|_| ProtocolError::InvalidSessionId(raw.into()))
}
