//! Upload coordinator: one file, one session, one result.
//!
//! Validates the request, plans chunks, opens the server session, runs the
//! worker pool and then either completes the session or aborts it exactly
//! once. Every collaborator error is turned into the single [`UploadError`]
//! the caller sees.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chua_protocol::OpenSessionRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunked::ChunkReader;
use crate::client::{BoxFuture, HttpProtocolClient, ProtocolClient, SessionOpened};
use crate::config::UploadConfig;
use crate::events::{EventSink, UploadEvent};
use crate::planner::{normalize_parallel, plan, validate_chunk_size};
use crate::pool::WorkerPool;
use crate::session::{SessionState, Transition, UploadSession};
use crate::{UploadError, UploadResult};

/// Drives a complete upload against one server.
pub struct UploadCoordinator {
    client: Arc<dyn ProtocolClient>,
    config: UploadConfig,
    events: EventSink,
    cancel: CancellationToken,
    deadline: Option<Duration>,
}

impl UploadCoordinator {
    pub fn new(client: Arc<dyn ProtocolClient>, config: UploadConfig) -> Self {
        Self {
            client,
            config,
            events: EventSink::disabled(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Sends progress events to `events`.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Uses an externally owned cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancels the upload if it has not finished after `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Returns a cancellation token for this upload.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Uploads the file at `path`, returning the server session id.
    pub async fn upload(&self, path: impl AsRef<Path>) -> UploadResult {
        let path = path.as_ref();
        let started = Instant::now();
        let result = self.run(path).await;
        match &result {
            Ok(id) => info!(
                session = %id,
                path = %path.display(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "upload completed"
            ),
            Err(e) => error!(
                path = %path.display(),
                kind = %e.kind(),
                error = %e,
                "upload failed"
            ),
        }
        result
    }

    async fn run(&self, path: &Path) -> UploadResult {
        self.validate(path).await?;

        let owned = path.to_path_buf();
        let reader = tokio::task::spawn_blocking(move || ChunkReader::open(&owned))
            .await
            .map_err(|e| UploadError::Io(std::io::Error::other(e)))??;
        let reader = Arc::new(reader);
        let chunks = plan(reader.file_size(), self.config.chunk_size)?;
        let total_bytes = reader.file_size();
        let chunk_count = chunks.len();

        let cancel = self.cancel.child_token();
        // Stops the deadline timer once this call returns.
        let _cancel_on_exit = cancel.clone().drop_guard();
        if let Some(deadline) = self.deadline {
            spawn_deadline(cancel.clone(), deadline);
        }

        let request = OpenSessionRequest {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_size: total_bytes,
            chunk_count,
            chunk_size: self.config.chunk_size,
        };
        let opened = self.open_session(request, &cancel).await?;
        let session_id = opened.session_id;

        info!(
            session = %session_id,
            chunks = chunk_count,
            bytes = total_bytes,
            duplicated = opened.duplicated,
            "session opened"
        );
        self.events.emit(UploadEvent::SessionOpened {
            session_id,
            chunk_count,
            total_bytes,
            duplicated: opened.duplicated,
        });

        if opened.duplicated {
            self.events.emit(UploadEvent::Completed { session_id });
            return Ok(session_id);
        }

        let session = UploadSession::new(
            session_id,
            self.client.base_url(),
            chunks,
            self.config.retry.budget(),
        );
        let pool = WorkerPool::new(
            Arc::clone(&self.client),
            reader,
            self.config.effective_parallel(),
        )
        .with_retry(self.config.retry.clone())
        .with_cancel_grace(self.config.cancel_grace())
        .with_events(self.events.clone());

        if pool.run(&session, &cancel).await == SessionState::Completing {
            match self.complete_session(session_id, &cancel).await {
                Ok(()) => {
                    let _ = session.apply(Transition::Finalize);
                    self.events.emit(UploadEvent::Completed { session_id });
                    return Ok(session_id);
                }
                Err(e) => {
                    let _ = session.apply(Transition::Abort(e));
                }
            }
        }

        let cause = session
            .take_cause()
            .unwrap_or_else(|| UploadError::FatalProtocol("session aborted without a cause".into()));
        self.abort_remote(&session, &cause).await;
        Err(cause)
    }

    async fn validate(&self, path: &Path) -> Result<(), UploadError> {
        if self.client.base_url().trim().is_empty() {
            return Err(UploadError::InvalidConfiguration(
                "base URL must not be empty".into(),
            ));
        }
        if path.as_os_str().is_empty() {
            return Err(UploadError::InvalidConfiguration(
                "file path must not be empty".into(),
            ));
        }
        if self.config.chunk_size == 0 {
            return Err(UploadError::InvalidConfiguration(
                "chunk size must be greater than 0".into(),
            ));
        }
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(UploadError::InvalidConfiguration(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        Ok(())
    }

    async fn open_session(
        &self,
        request: OpenSessionRequest,
        cancel: &CancellationToken,
    ) -> Result<SessionOpened, UploadError> {
        let budget = self.config.retry.budget();
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            let mut open = self.client.open_session(request.clone());
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.discard_late_open(open).await;
                    return Err(UploadError::Cancelled);
                }
                r = &mut open => r,
            };
            match result {
                Ok(opened) => return Ok(opened),
                Err(UploadError::TransientNetwork(msg)) if attempt >= budget => {
                    return Err(UploadError::SessionInit(format!(
                        "giving up after {attempt} attempts: {msg}"
                    )));
                }
                Err(e @ UploadError::TransientNetwork(_)) => {
                    self.backoff(attempt, &e, "open session", cancel).await?;
                }
                Err(e) => return Err(e),
            }
            attempt += 1;
        }
    }

    /// Lets an open that raced cancellation finish, then deletes the session
    /// it created so nothing is left behind on the server.
    async fn discard_late_open(
        &self,
        open: BoxFuture<'_, Result<SessionOpened, UploadError>>,
    ) {
        let Ok(Ok(opened)) = tokio::time::timeout(self.config.cancel_grace(), open).await else {
            return;
        };
        debug!(session = %opened.session_id, "deleting session opened after cancellation");
        if let Err(e) = self.client.abort_session(opened.session_id).await {
            warn!(session = %opened.session_id, error = %e, "failed to abort session on server");
        }
    }

    async fn complete_session(
        &self,
        session_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        let budget = self.config.retry.budget();
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                r = self.client.complete_session(session_id) => r,
            };
            match result {
                Ok(confirmation) => {
                    debug!(session = %confirmation.session_id, "session completed");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < budget => {
                    self.backoff(attempt, &e, "complete session", cancel).await?;
                }
                Err(e) => return Err(e),
            }
            attempt += 1;
        }
    }

    async fn backoff(
        &self,
        attempt: u32,
        error: &UploadError,
        op: &str,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        let delay = self.config.retry.delay_for_attempt(attempt);
        warn!(
            op,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "request failed, retrying"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Best-effort remote abort; called exactly once per aborted session.
    async fn abort_remote(&self, session: &UploadSession, cause: &UploadError) {
        if let Err(e) = self.client.abort_session(session.id()).await {
            warn!(session = %session.id(), error = %e, "failed to abort session on server");
        }
        let _ = session.apply(Transition::Finalize);
        debug!(session = %session.id(), cause = %cause, "session aborted");
        self.events.emit(UploadEvent::Aborted {
            session_id: session.id(),
            error: cause.to_string(),
        });
    }
}

fn spawn_deadline(cancel: CancellationToken, deadline: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(deadline) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "upload deadline reached");
                cancel.cancel();
            }
        }
    });
}

/// Uploads `path` to `base_url` with a fresh HTTP client.
///
/// Signed arguments mirror the binding boundary: `chunk_size <= 0` is
/// rejected, `parallel <= 0` means one.
pub async fn upload_file(base_url: &str, path: &str, chunk_size: i64, parallel: i64) -> UploadResult {
    let config = UploadConfig {
        chunk_size: validate_chunk_size(chunk_size)?,
        parallel: normalize_parallel(parallel),
        ..UploadConfig::default()
    };
    let client = HttpProtocolClient::new(base_url, config.request_timeout())?;
    UploadCoordinator::new(Arc::new(client), config)
        .upload(path)
        .await
}
