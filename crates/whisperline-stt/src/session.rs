use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::error::SttError;
use crate::next_session_id;
use crate::types::TranscriptionChunk;
use crate::wire::ServerEvent;

/// How long a caller will block waiting for the backend to acknowledge
/// `session.update` before giving up.
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Confirmed,
    Streaming,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// What the receive loop should do with a server event it just fed in.
#[derive(Debug)]
pub enum EventOutcome {
    /// Bookkeeping only, nothing to forward.
    None,
    /// Forward this chunk downstream.
    Chunk(TranscriptionChunk),
    /// The session has failed; stop reading.
    Failed(SttError),
}

/// One realtime connection's worth of state.
///
/// Created right after the socket handshake succeeds, destroyed when the
/// connection closes, fails, or is replaced by a reconnect. At most one
/// session is live per recording.
///
/// The confirmation waiter is a single oneshot sender parked behind a
/// mutex. Confirmation may arrive before anyone subscribes, so both
/// sides check the `confirmed` flag around the waiter lock; the sender
/// is taken out of the slot before resuming, which makes a double
/// resume structurally impossible.
pub struct RealtimeSession {
    id: u64,
    state: RwLock<SessionState>,
    confirmed: AtomicBool,
    waiter: Mutex<Option<oneshot::Sender<Result<(), SttError>>>>,
    partial: Mutex<String>,
    final_transcript: Mutex<String>,
    finalized_items: Mutex<HashSet<String>>,
    started_at: Instant,
    confirmed_at: Mutex<Option<Instant>>,
}

impl RealtimeSession {
    pub fn new() -> Self {
        let id = next_session_id();
        debug!(target: "session", id, "realtime session created");
        Self {
            id,
            state: RwLock::new(SessionState::Connecting),
            confirmed: AtomicBool::new(false),
            waiter: Mutex::new(None),
            partial: Mutex::new(String::new()),
            final_transcript: Mutex::new(String::new()),
            finalized_items: Mutex::new(HashSet::new()),
            started_at: Instant::now(),
            confirmed_at: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        !self.state().is_terminal() && !matches!(self.state(), SessionState::Closing)
    }

    /// Time from socket handshake to backend acknowledgment, once known.
    pub fn confirmation_latency(&self) -> Option<Duration> {
        (*self.confirmed_at.lock()).map(|at| at.duration_since(self.started_at))
    }

    /// Everything the backend has finalized on this connection.
    pub fn final_transcript(&self) -> String {
        self.final_transcript.lock().clone()
    }

    /// Mark the session confirmed and resume the waiter if one is
    /// parked. Safe to call more than once; only the first call does
    /// anything.
    pub fn confirm(&self) {
        if self.confirmed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.confirmed_at.lock() = Some(Instant::now());
        {
            let mut state = self.state.write();
            if *state == SessionState::Connecting {
                *state = SessionState::Confirmed;
            }
        }
        info!(
            target: "session",
            id = self.id,
            latency_ms = self.confirmation_latency().map(|d| d.as_millis() as u64),
            "session confirmed"
        );
        if let Some(tx) = self.waiter.lock().take() {
            let _ = tx.send(Ok(()));
        }
    }

    /// Block until the backend confirms the session, bounded by
    /// `timeout`. Resolves immediately if confirmation already arrived.
    /// On timeout the session moves to `Failed`.
    pub async fn await_confirmation(&self, timeout: Duration) -> Result<(), SttError> {
        if self.confirmed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let rx = {
            let mut waiter = self.waiter.lock();
            // Confirmation may have landed between the first check and
            // taking the lock.
            if self.confirmed.load(Ordering::SeqCst) {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            *waiter = Some(tx);
            rx
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SttError::SessionCleanedUp),
            Err(_) => {
                self.waiter.lock().take();
                self.mark_failed();
                warn!(target: "session", id = self.id, ?timeout, "confirmation timed out");
                Err(SttError::ConfirmationTimeout { elapsed: timeout })
            }
        }
    }

    /// First audio append moves a confirmed session into `Streaming`.
    pub fn mark_streaming(&self) {
        let mut state = self.state.write();
        if *state == SessionState::Confirmed {
            *state = SessionState::Streaming;
        }
    }

    /// Feed one server event through the session state machine.
    pub fn handle_event(&self, event: ServerEvent) -> EventOutcome {
        match event {
            ServerEvent::SessionCreated | ServerEvent::SessionUpdated => {
                self.confirm();
                EventOutcome::None
            }
            ServerEvent::InputAudioBufferCommitted => {
                debug!(target: "session", id = self.id, "audio buffer committed");
                EventOutcome::None
            }
            ServerEvent::TranscriptionDelta { item_id, delta, .. } => {
                let mut partial = self.partial.lock();
                partial.push_str(&delta);
                trace!(
                    target: "session",
                    id = self.id,
                    %item_id,
                    partial_len = partial.len(),
                    "transcription delta"
                );
                EventOutcome::Chunk(TranscriptionChunk::partial(partial.clone()))
            }
            ServerEvent::TranscriptionCompleted {
                item_id,
                transcript,
                ..
            } => {
                if !self.finalized_items.lock().insert(item_id.clone()) {
                    debug!(
                        target: "session",
                        id = self.id,
                        %item_id,
                        "duplicate final for item, suppressed"
                    );
                    return EventOutcome::None;
                }
                self.partial.lock().clear();
                {
                    let mut record = self.final_transcript.lock();
                    let trimmed = transcript.trim();
                    if !record.is_empty() && !trimmed.is_empty() {
                        record.push(' ');
                    }
                    record.push_str(trimmed);
                }
                info!(
                    target: "session",
                    id = self.id,
                    %item_id,
                    chars = transcript.len(),
                    "transcription completed"
                );
                EventOutcome::Chunk(TranscriptionChunk::final_result(transcript))
            }
            ServerEvent::Error { error } => {
                warn!(target: "session", id = self.id, %error, "backend error event");
                let retryable = error.is_retryable();
                EventOutcome::Failed(self.fail(error.to_string(), retryable))
            }
            ServerEvent::Unknown => {
                trace!(target: "session", id = self.id, "ignoring unrecognized event");
                EventOutcome::None
            }
        }
    }

    /// Move to `Failed` and resume any pending waiter with the error,
    /// exactly once. Returns the error for the caller to propagate.
    pub fn fail(&self, message: impl Into<String>, retryable: bool) -> SttError {
        let message = message.into();
        self.mark_failed();
        if let Some(tx) = self.waiter.lock().take() {
            let _ = tx.send(Err(SttError::Transcription {
                message: message.clone(),
                retryable,
            }));
        }
        SttError::Transcription { message, retryable }
    }

    fn mark_failed(&self) {
        let mut state = self.state.write();
        if *state != SessionState::Closed {
            *state = SessionState::Failed;
        }
    }

    /// Intentional teardown: finalize the state machine and release any
    /// waiter still parked on confirmation. Idempotent.
    pub fn cleanup(&self) {
        {
            let mut state = self.state.write();
            if !state.is_terminal() {
                *state = SessionState::Closing;
                debug!(target: "session", id = self.id, "closing session");
                *state = SessionState::Closed;
            }
        }
        if let Some(tx) = self.waiter.lock().take() {
            let _ = tx.send(Err(SttError::SessionCleanedUp));
        }
    }
}

impl Default for RealtimeSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        // Unblocks a forgotten waiter even if cleanup was skipped.
        if let Some(tx) = self.waiter.get_mut().take() {
            let _ = tx.send(Err(SttError::SessionCleanedUp));
        }
    }
}
