//! Bounded worker pool that drains a session's pending chunks.
//!
//! At most `parallel` uploads run at once in a [`JoinSet`]. Failed attempts
//! that are worth retrying go to a delayed list and come back after the
//! backoff from [`RetryPolicy`]. The session decides whether an outcome is a
//! retry or a permanent failure; the pool only schedules.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chua_protocol::checksum::{checksum_bytes, checksums_match};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::UploadError;
use crate::chunked::ChunkReader;
use crate::client::{ChunkAck, ChunkPayload, ProtocolClient};
use crate::config::RetryPolicy;
use crate::events::{EventSink, UploadEvent};
use crate::planner::ChunkDescriptor;
use crate::session::{Outcome, SessionState, Transition, UploadSession};

type TaskResult = (usize, Result<(), UploadError>);

/// Runs chunk uploads for one session with bounded parallelism.
pub struct WorkerPool {
    client: Arc<dyn ProtocolClient>,
    reader: Arc<ChunkReader>,
    parallel: usize,
    retry: RetryPolicy,
    cancel_grace: Duration,
    events: EventSink,
}

/// Scheduling state local to one [`WorkerPool::run`] call.
#[derive(Default)]
struct Queue {
    ready: VecDeque<usize>,
    delayed: Vec<(Instant, usize)>,
}

impl Queue {
    fn promote_due(&mut self, now: Instant) {
        let ready = &mut self.ready;
        self.delayed.retain(|(at, index)| {
            if *at <= now {
                ready.push_back(*index);
                false
            } else {
                true
            }
        });
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }

    fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty()
    }

    fn clear(&mut self) {
        self.ready.clear();
        self.delayed.clear();
    }
}

impl WorkerPool {
    /// Creates a pool. A `parallel` of zero is treated as one.
    pub fn new(client: Arc<dyn ProtocolClient>, reader: Arc<ChunkReader>, parallel: usize) -> Self {
        Self {
            client,
            reader,
            parallel: parallel.max(1),
            retry: RetryPolicy::default(),
            cancel_grace: Duration::from_secs(30),
            events: EventSink::disabled(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// How long in-flight uploads may keep running after cancellation.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn parallel(&self) -> usize {
        self.parallel
    }

    /// Uploads every pending chunk of `session`.
    ///
    /// Returns once no upload is in flight and nothing more will be
    /// scheduled: either every chunk succeeded (`Completing`) or the session
    /// is `Aborting` with its cause recorded. Cancellation moves the session
    /// to `Aborting`, lets in-flight uploads finish for the grace period and
    /// then aborts whatever is left.
    pub async fn run(&self, session: &UploadSession, cancel: &CancellationToken) -> SessionState {
        let chunks = session.chunks();
        let mut queue = Queue {
            ready: session.pending_indices().into(),
            delayed: Vec::new(),
        };
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut grace_deadline: Option<Instant> = None;

        debug!(
            session = %session.id(),
            chunks = chunks.len(),
            parallel = self.parallel,
            "worker pool started"
        );

        loop {
            // A token cancelled before or between iterations must win over dispatch.
            if grace_deadline.is_none() && cancel.is_cancelled() {
                grace_deadline = Some(self.begin_drain(session, &mut queue, tasks.len()));
            }
            let scheduling = grace_deadline.is_none() && session.state() == SessionState::Open;
            if scheduling {
                queue.promote_due(Instant::now());
                while tasks.len() < self.parallel {
                    let Some(index) = queue.ready.pop_front() else {
                        break;
                    };
                    self.dispatch(session, &chunks, index, &mut tasks);
                }
            }

            if tasks.is_empty() && (!scheduling || queue.is_empty()) {
                break;
            }

            let next_retry = queue.next_due().filter(|_| scheduling);
            tokio::select! {
                biased;

                _ = cancel.cancelled(), if grace_deadline.is_none() => {
                    grace_deadline = Some(self.begin_drain(session, &mut queue, tasks.len()));
                }

                _ = sleep_until(grace_deadline.unwrap_or_else(Instant::now)), if grace_deadline.is_some() => {
                    warn!(
                        session = %session.id(),
                        stragglers = tasks.len(),
                        "cancel grace expired, aborting in-flight chunks"
                    );
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next().await {
                        if let Ok(result) = joined {
                            self.handle_result(session, &chunks, result, &mut queue);
                        }
                    }
                    break;
                }

                Some(joined) = tasks.join_next() => {
                    match joined {
                        Ok(result) => self.handle_result(session, &chunks, result, &mut queue),
                        Err(e) => handle_join_error(session, e),
                    }
                }

                _ = sleep_until(next_retry.unwrap_or_else(Instant::now)), if next_retry.is_some() => {}

                else => break,
            }
        }

        let state = session.state();
        debug!(session = %session.id(), ?state, "worker pool finished");
        state
    }

    /// Moves the session to `Aborting` and returns the grace deadline.
    fn begin_drain(&self, session: &UploadSession, queue: &mut Queue, in_flight: usize) -> Instant {
        info!(
            session = %session.id(),
            in_flight,
            "upload cancelled, draining in-flight chunks"
        );
        let _ = session.apply(Transition::Abort(UploadError::Cancelled));
        queue.clear();
        Instant::now() + self.cancel_grace
    }

    fn dispatch(
        &self,
        session: &UploadSession,
        chunks: &[ChunkDescriptor],
        index: usize,
        tasks: &mut JoinSet<TaskResult>,
    ) {
        let attempt = match session.apply(Transition::Dispatch(index)) {
            Ok(Outcome::Dispatched { attempt }) => attempt,
            Ok(_) => return,
            Err(e) => {
                warn!(session = %session.id(), index, error = %e, "dispatch rejected");
                return;
            }
        };
        let Some(chunk) = chunks.get(index).copied() else {
            return;
        };

        debug!(session = %session.id(), index, attempt, "uploading chunk");
        self.events.emit(UploadEvent::ChunkStarted { index, attempt });

        let client = Arc::clone(&self.client);
        let reader = Arc::clone(&self.reader);
        let session_id = session.id();
        tasks.spawn(async move {
            let result = upload_one(&*client, reader, session_id, chunk).await;
            (index, result)
        });
    }

    fn handle_result(
        &self,
        session: &UploadSession,
        chunks: &[ChunkDescriptor],
        (index, outcome): TaskResult,
        queue: &mut Queue,
    ) {
        let error_text = outcome.as_ref().err().map(ToString::to_string);
        match session.apply(Transition::Report { index, outcome }) {
            Ok(Outcome::Succeeded { all_done }) => {
                let bytes = chunks.get(index).map_or(0, |c| c.length);
                debug!(session = %session.id(), index, bytes, all_done, "chunk uploaded");
                self.events.emit(UploadEvent::ChunkUploaded {
                    index,
                    bytes,
                    uploaded_bytes: session.uploaded_bytes(),
                    total_bytes: session.total_bytes(),
                });
            }
            Ok(Outcome::Retry { attempt }) => {
                let delay = self.retry.delay_for_attempt(attempt);
                let error = error_text.unwrap_or_default();
                warn!(
                    session = %session.id(),
                    index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "chunk failed, retrying"
                );
                self.events.emit(UploadEvent::ChunkRetrying {
                    index,
                    attempt,
                    delay,
                    error,
                });
                if session.state() == SessionState::Open {
                    queue.delayed.push((Instant::now() + delay, index));
                }
            }
            Ok(Outcome::Failed) => {
                warn!(
                    session = %session.id(),
                    index,
                    error = %error_text.unwrap_or_default(),
                    "chunk permanently failed, aborting session"
                );
                queue.clear();
            }
            Ok(_) => {}
            Err(e) => warn!(session = %session.id(), index, error = %e, "report rejected"),
        }
    }
}

fn handle_join_error(session: &UploadSession, e: JoinError) {
    if e.is_cancelled() {
        return;
    }
    warn!(session = %session.id(), error = %e, "upload task panicked");
    let _ = session.apply(Transition::Abort(UploadError::FatalProtocol(format!(
        "upload task panicked: {e}"
    ))));
}

/// One attempt at one chunk: read, checksum, send, verify.
async fn upload_one(
    client: &dyn ProtocolClient,
    reader: Arc<ChunkReader>,
    session_id: Uuid,
    chunk: ChunkDescriptor,
) -> Result<(), UploadError> {
    let data = tokio::task::spawn_blocking(move || reader.read(&chunk))
        .await
        .map_err(|e| UploadError::Io(std::io::Error::other(e)))??;
    let checksum = checksum_bytes(&data);

    let ack = client
        .upload_chunk(
            session_id,
            chunk,
            ChunkPayload {
                data,
                checksum: checksum.clone(),
            },
        )
        .await?;
    verify_ack(&chunk, &checksum, &ack)
}

/// Checks a server acknowledgement against what was sent.
fn verify_ack(chunk: &ChunkDescriptor, local_checksum: &str, ack: &ChunkAck) -> Result<(), UploadError> {
    if ack.index != chunk.index {
        return Err(UploadError::FatalProtocol(format!(
            "ack for chunk {} names chunk {}",
            chunk.index, ack.index
        )));
    }
    if !ack.accepted {
        return Err(UploadError::ChunkRejected { index: chunk.index });
    }
    if !checksums_match(local_checksum, &ack.server_checksum) {
        return Err(UploadError::ChecksumMismatch { index: chunk.index });
    }
    Ok(())
}
