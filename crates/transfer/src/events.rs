//! Progress events emitted while an upload runs.

use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

/// Progress notification for observers of an upload.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// Server accepted the open-session request.
    SessionOpened {
        session_id: Uuid,
        chunk_count: usize,
        total_bytes: u64,
        duplicated: bool,
    },
    /// A chunk attempt was dispatched.
    ChunkStarted { index: usize, attempt: u32 },
    /// A chunk was acknowledged.
    ChunkUploaded {
        index: usize,
        bytes: u64,
        uploaded_bytes: u64,
        total_bytes: u64,
    },
    /// A chunk attempt failed and will be retried after `delay`.
    ChunkRetrying {
        index: usize,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// Session completed on the server.
    Completed { session_id: Uuid },
    /// Session aborted.
    Aborted { session_id: Uuid, error: String },
}

impl UploadEvent {
    /// Fraction of bytes acknowledged, in `[0.0, 1.0]`, for byte-level events.
    pub fn progress(&self) -> Option<f64> {
        match self {
            Self::ChunkUploaded {
                uploaded_bytes,
                total_bytes,
                ..
            } => Some(if *total_bytes == 0 {
                1.0
            } else {
                *uploaded_bytes as f64 / *total_bytes as f64
            }),
            Self::Completed { .. } => Some(1.0),
            _ => None,
        }
    }
}

/// Non-blocking event sender. Events are dropped when the channel is full or
/// nobody is listening; progress reporting never slows the upload down.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::Sender<UploadEvent>>);

impl EventSink {
    pub fn new(tx: mpsc::Sender<UploadEvent>) -> Self {
        Self(Some(tx))
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self(None)
    }

    pub fn emit(&self, event: UploadEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.try_send(event);
        }
    }
}
