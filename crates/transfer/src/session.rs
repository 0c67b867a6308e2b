use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use uuid::Uuid;

use crate::UploadError;
use crate::planner::ChunkDescriptor;

/// Status of one chunk within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Waiting to be dispatched. `retries` counts failed attempts so far.
    Pending { retries: u32 },
    /// An upload attempt is running.
    InFlight { retries: u32 },
    /// Server acknowledged the chunk. Terminal.
    Succeeded,
    /// Retry budget exhausted or fatal error. Terminal.
    PermanentlyFailed { retries: u32 },
}

impl ChunkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PermanentlyFailed { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "pending",
            Self::InFlight { .. } => "in-flight",
            Self::Succeeded => "succeeded",
            Self::PermanentlyFailed { .. } => "permanently-failed",
        }
    }
}

/// Session-level lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// Every chunk succeeded; completion request pending.
    Completing,
    Completed,
    /// A session-fatal error occurred; remote abort pending.
    Aborting,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// A requested state change. The only way to mutate a session.
#[derive(Debug)]
pub enum Transition {
    /// Pending → InFlight.
    Dispatch(usize),
    /// Outcome of an in-flight attempt.
    Report {
        index: usize,
        outcome: Result<(), UploadError>,
    },
    /// Open/Completing → Aborting. The first cause wins.
    Abort(UploadError),
    /// Completing → Completed, or Aborting → Aborted.
    Finalize,
}

/// What a successful [`Transition`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Chunk is now in flight; `attempt` is 1-based.
    Dispatched { attempt: u32 },
    /// Chunk succeeded; `all_done` is set when this was the last one.
    Succeeded { all_done: bool },
    /// Attempt `attempt` failed and the chunk went back to Pending.
    Retry { attempt: u32 },
    /// Chunk is permanently failed and the session is aborting.
    Failed,
    /// Session is aborting (newly or already).
    Aborting,
    /// Session reached a terminal state.
    Finalized(SessionState),
}

/// Rejected transition. State is left untouched.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("chunk {0} is not part of this session")]
    UnknownChunk(usize),

    #[error("chunk {index} cannot go from {from} to {to}")]
    IllegalChunk {
        index: usize,
        from: &'static str,
        to: &'static str,
    },

    #[error("session is {0:?}")]
    SessionState(SessionState),
}

/// Mutable state of one upload attempt (thread-safe).
///
/// Every mutation goes through [`apply`](Self::apply), which holds the status
/// lock for the whole transition.
#[derive(Debug)]
pub struct UploadSession {
    id: Uuid,
    base_url: String,
    chunks: Arc<[ChunkDescriptor]>,
    created_at: Instant,
    max_attempts: u32,
    inner: Mutex<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    status: Vec<ChunkStatus>,
    state: SessionState,
    succeeded: usize,
    uploaded_bytes: u64,
    cause: Option<UploadError>,
    finalized: bool,
}

impl UploadSession {
    /// Creates an open session. `max_attempts` below one is treated as one.
    pub fn new(
        id: Uuid,
        base_url: impl Into<String>,
        chunks: Vec<ChunkDescriptor>,
        max_attempts: u32,
    ) -> Self {
        let state = if chunks.is_empty() {
            SessionState::Completing
        } else {
            SessionState::Open
        };
        Self {
            id,
            base_url: base_url.into(),
            inner: Mutex::new(SessionInner {
                status: vec![ChunkStatus::Pending { retries: 0 }; chunks.len()],
                state,
                succeeded: 0,
                uploaded_bytes: 0,
                cause: None,
                finalized: false,
            }),
            chunks: chunks.into(),
            created_at: Instant::now(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Applies one transition atomically.
    pub fn apply(&self, transition: Transition) -> Result<Outcome, TransitionError> {
        let mut s = self.lock();
        match transition {
            Transition::Dispatch(index) => s.dispatch(index),
            Transition::Report { index, outcome } => {
                let length = self
                    .chunks
                    .get(index)
                    .map(|c| c.length)
                    .ok_or(TransitionError::UnknownChunk(index))?;
                s.report(index, length, outcome, self.max_attempts)
            }
            Transition::Abort(cause) => s.abort(cause),
            Transition::Finalize => s.finalize(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the session ID.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Shared, immutable view of the plan.
    pub fn chunks(&self) -> Arc<[ChunkDescriptor]> {
        Arc::clone(&self.chunks)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the current session state.
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Returns the status of one chunk.
    pub fn status(&self, index: usize) -> Option<ChunkStatus> {
        self.lock().status.get(index).copied()
    }

    /// Snapshot of the whole status table.
    pub fn statuses(&self) -> Vec<ChunkStatus> {
        self.lock().status.clone()
    }

    /// Indices currently Pending, in plan order.
    pub fn pending_indices(&self) -> Vec<usize> {
        self.lock()
            .status
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, ChunkStatus::Pending { .. }))
            .map(|(i, _)| i)
            .collect()
    }

    /// Bytes acknowledged by the server so far.
    pub fn uploaded_bytes(&self) -> u64 {
        self.lock().uploaded_bytes
    }

    /// Total bytes to upload.
    pub fn total_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.length).sum()
    }

    pub fn is_finalized(&self) -> bool {
        self.lock().finalized
    }

    /// Takes the recorded failure cause, if any.
    pub fn take_cause(&self) -> Option<UploadError> {
        self.lock().cause.take()
    }
}

impl SessionInner {
    fn require_open(&self) -> Result<(), TransitionError> {
        if self.state == SessionState::Open {
            Ok(())
        } else {
            Err(TransitionError::SessionState(self.state))
        }
    }

    fn slot(&mut self, index: usize) -> Result<&mut ChunkStatus, TransitionError> {
        self.status
            .get_mut(index)
            .ok_or(TransitionError::UnknownChunk(index))
    }

    fn dispatch(&mut self, index: usize) -> Result<Outcome, TransitionError> {
        self.require_open()?;
        let slot = self.slot(index)?;
        match *slot {
            ChunkStatus::Pending { retries } => {
                *slot = ChunkStatus::InFlight { retries };
                Ok(Outcome::Dispatched {
                    attempt: retries + 1,
                })
            }
            other => Err(TransitionError::IllegalChunk {
                index,
                from: other.label(),
                to: "in-flight",
            }),
        }
    }

    fn report(
        &mut self,
        index: usize,
        length: u64,
        outcome: Result<(), UploadError>,
        max_attempts: u32,
    ) -> Result<Outcome, TransitionError> {
        let slot = self.slot(index)?;
        let ChunkStatus::InFlight { retries } = *slot else {
            return Err(TransitionError::IllegalChunk {
                index,
                from: slot.label(),
                to: if outcome.is_ok() { "succeeded" } else { "failed" },
            });
        };

        let error = match outcome {
            Ok(()) => {
                *slot = ChunkStatus::Succeeded;
                self.succeeded += 1;
                self.uploaded_bytes += length;
                let all_done = self.succeeded == self.status.len();
                if all_done && self.state == SessionState::Open {
                    self.state = SessionState::Completing;
                }
                return Ok(Outcome::Succeeded { all_done });
            }
            Err(e) => e,
        };

        let attempts = retries + 1;
        if error.is_retryable() && attempts < max_attempts {
            *slot = ChunkStatus::Pending { retries: attempts };
            return Ok(Outcome::Retry { attempt: attempts });
        }

        *slot = ChunkStatus::PermanentlyFailed { retries: attempts };
        let cause = if error.is_retryable() {
            UploadError::RetriesExhausted {
                index,
                attempts,
                source: Box::new(error),
            }
        } else {
            UploadError::ChunkFailed {
                index,
                source: Box::new(error),
            }
        };
        self.begin_abort(cause);
        Ok(Outcome::Failed)
    }

    fn abort(&mut self, cause: UploadError) -> Result<Outcome, TransitionError> {
        match self.state {
            SessionState::Open | SessionState::Completing | SessionState::Aborting => {
                self.begin_abort(cause);
                Ok(Outcome::Aborting)
            }
            state => Err(TransitionError::SessionState(state)),
        }
    }

    fn begin_abort(&mut self, cause: UploadError) {
        if matches!(self.state, SessionState::Open | SessionState::Completing) {
            self.state = SessionState::Aborting;
        }
        if self.cause.is_none() {
            self.cause = Some(cause);
        }
    }

    fn finalize(&mut self) -> Result<Outcome, TransitionError> {
        if self.finalized {
            return Err(TransitionError::SessionState(self.state));
        }
        self.state = match self.state {
            SessionState::Completing => SessionState::Completed,
            SessionState::Aborting => SessionState::Aborted,
            state => return Err(TransitionError::SessionState(state)),
        };
        self.finalized = true;
        Ok(Outcome::Finalized(self.state))
    }
}
