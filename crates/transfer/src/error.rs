//! Upload error taxonomy.

use std::fmt;

/// Errors produced by the upload engine.
///
/// Every failure that reaches the caller is one of these; [`UploadError::kind`]
/// collapses them into the coarse result codes exposed at the binding boundary.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session init failed: {0}")]
    SessionInit(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("fatal protocol error: {0}")]
    FatalProtocol(String),

    #[error("session completion failed, missing chunks {missing:?}")]
    SessionComplete { missing: Vec<usize> },

    #[error("checksum mismatch on chunk {index}")]
    ChecksumMismatch { index: usize },

    #[error("chunk {index} not accepted by server")]
    ChunkRejected { index: usize },

    #[error("chunk {index} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        index: usize,
        attempts: u32,
        #[source]
        source: Box<UploadError>,
    },

    #[error("chunk {index} failed: {source}")]
    ChunkFailed {
        index: usize,
        #[source]
        source: Box<UploadError>,
    },

    #[error("cancelled")]
    Cancelled,
}

impl From<chua_protocol::ProtocolError> for UploadError {
    fn from(e: chua_protocol::ProtocolError) -> Self {
        Self::FatalProtocol(e.to_string())
    }
}

/// Result code surfaced through the binding boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidConfiguration,
    SessionInitError,
    TransientNetworkError,
    FatalProtocolError,
    SessionCompleteError,
    Cancelled,
    IoError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidConfiguration => "InvalidConfiguration",
            Self::SessionInitError => "SessionInitError",
            Self::TransientNetworkError => "TransientNetworkError",
            Self::FatalProtocolError => "FatalProtocolError",
            Self::SessionCompleteError => "SessionCompleteError",
            Self::Cancelled => "Cancelled",
            Self::IoError => "IOError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl UploadError {
    /// Maps this error to its externally visible result code.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            Self::Io(_) => ErrorKind::IoError,
            Self::SessionInit(_) => ErrorKind::SessionInitError,
            Self::TransientNetwork(_)
            | Self::ChecksumMismatch { .. }
            | Self::ChunkRejected { .. }
            | Self::RetriesExhausted { .. } => ErrorKind::TransientNetworkError,
            Self::FatalProtocol(_) => ErrorKind::FatalProtocolError,
            Self::SessionComplete { .. } => ErrorKind::SessionCompleteError,
            Self::ChunkFailed { source, .. } => source.kind(),
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Returns `true` if retrying the same chunk may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_) | Self::ChecksumMismatch { .. } | Self::ChunkRejected { .. }
        )
    }

    /// Index of the chunk this error is attributed to, if any.
    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            Self::ChecksumMismatch { index }
            | Self::ChunkRejected { index }
            | Self::RetriesExhausted { index, .. }
            | Self::ChunkFailed { index, .. } => Some(*index),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_of_wrapped_chunk_error_follows_source() {
        let err = UploadError::ChunkFailed {
            index: 3,
            source: Box::new(UploadError::FatalProtocol("HTTP 409".into())),
        };
        assert_eq!(err.kind(), ErrorKind::FatalProtocolError);
        assert_eq!(err.chunk_index(), Some(3));
        assert!(err.to_string().contains("chunk 3"));
    }

    #[test]
    fn exhausted_retries_report_transient_kind() {
        let err = UploadError::RetriesExhausted {
            index: 1,
            attempts: 3,
            source: Box::new(UploadError::TransientNetwork("reset".into())),
        };
        assert_eq!(err.kind(), ErrorKind::TransientNetworkError);
        assert!(!err.is_retryable());
    }

    #[test]
    fn retryable_classes() {
        assert!(UploadError::TransientNetwork("timeout".into()).is_retryable());
        assert!(UploadError::ChecksumMismatch { index: 0 }.is_retryable());
        assert!(UploadError::ChunkRejected { index: 0 }.is_retryable());
        assert!(!UploadError::FatalProtocol("400".into()).is_retryable());
        assert!(!UploadError::Cancelled.is_retryable());
        assert!(!UploadError::Io(std::io::Error::other("disk")).is_retryable());
    }

    #[test]
    fn io_kind_display() {
        let err = UploadError::from(std::io::Error::other("gone"));
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert_eq!(err.kind().to_string(), "IOError");
    }
}
