//! Chunked, parallel file uploads over HTTP.
//!
//! A file is split into fixed-size chunks, a session is opened on the server,
//! chunks are uploaded concurrently with per-chunk retries, and the session is
//! then completed or aborted. The caller gets the session id or one error.

mod binding;
mod chunked;
mod client;
mod config;
mod coordinator;
mod error;
mod events;
mod planner;
mod pool;
mod session;

pub use binding::{upload, upload_with_cancel, upload_with_config};
pub use chunked::ChunkReader;
pub use client::{
    BoxFuture, ChunkAck, ChunkPayload, Confirmation, HttpProtocolClient, ProtocolClient,
    SessionOpened,
};
pub use config::{RetryPolicy, UploadConfig};
pub use coordinator::{UploadCoordinator, upload_file};
pub use error::{ErrorKind, UploadError};
pub use events::{EventSink, UploadEvent};
pub use planner::{ChunkDescriptor, chunk_count, normalize_parallel, plan, validate_chunk_size};
pub use pool::WorkerPool;
pub use session::{ChunkStatus, Outcome, SessionState, Transition, TransitionError, UploadSession};

pub use tokio_util::sync::CancellationToken;
pub use uuid::Uuid;

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Outcome of one upload: the server session id, or why it failed.
pub type UploadResult = Result<Uuid, UploadError>;
