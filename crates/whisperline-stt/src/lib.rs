//! Speech-to-text provider layer for Whisperline
//!
//! This crate holds the transcription side of the pipeline: provider
//! configuration and validation, the batch and realtime provider families,
//! the realtime session state machine, the partial/final aggregator, and
//! the window-bounded retry orchestrator.

use std::sync::atomic::{AtomicU64, Ordering};

pub mod aggregator;
pub mod config;
pub mod error;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod session;
pub mod types;
pub mod wire;

pub use aggregator::TranscriptionAggregator;
pub use config::ProviderConfig;
pub use error::SttError;
pub use provider::{create_provider, SttProvider};
pub use retry::{RetryContext, RetryOrchestrator, RETRY_WINDOW};
pub use session::{RealtimeSession, SessionState, DEFAULT_CONFIRMATION_TIMEOUT};
pub use types::{AudioFrame, ProviderType, TranscriptionChunk};

/// Generates unique realtime session IDs
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique session ID
pub fn next_session_id() -> u64 {
    SESSION_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}
