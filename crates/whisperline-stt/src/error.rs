use std::time::Duration;
use thiserror::Error;
use whisperline_foundation::AudioError;

#[derive(Debug, Error)]
pub enum SttError {
    /// Config validation: key is empty or blank. Surfaced before any I/O.
    #[error("Invalid API key")]
    InvalidApiKey,

    /// Config validation: model is not in the provider's supported set.
    #[error("Invalid model: {model}")]
    InvalidModel { model: String },

    #[error("Audio processing error: {0}")]
    Audio(#[from] AudioError),

    /// Transport or backend failure while transcribing.
    #[error("Transcription failed: {message}")]
    Transcription { message: String, retryable: bool },

    /// The realtime handshake was never acknowledged.
    #[error("Session confirmation timed out after {elapsed:?}")]
    ConfirmationTimeout { elapsed: Duration },

    /// Raised to unblock a waiter when a session is torn down intentionally.
    #[error("Session cleaned up")]
    SessionCleanedUp,

    #[error("Retry window expired ({age:?} since failure)")]
    RetryWindowExpired { age: Duration },

    #[error("WebSocket error: {0}")]
    Socket(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SttError {
    /// Whether the failure is worth handing to the retry orchestrator.
    ///
    /// Transient network conditions, timeouts, and rate limits are
    /// retryable; auth failures, malformed config, and intentional
    /// teardown are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SttError::InvalidApiKey
            | SttError::InvalidModel { .. }
            | SttError::Audio(_)
            | SttError::SessionCleanedUp
            | SttError::RetryWindowExpired { .. } => false,
            SttError::Transcription { retryable, .. } => *retryable,
            SttError::ConfirmationTimeout { .. } | SttError::Socket(_) => true,
            SttError::Http(e) => !e.is_builder(),
        }
    }

    /// Whether an HTTP status should be treated as transient.
    pub fn status_is_retryable(status: u16) -> bool {
        status == 408 || status == 429 || (500..600).contains(&status)
    }
}
