use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};
use whisperline_foundation::{real_clock, SharedClock};

use crate::config::ProviderConfig;
use crate::error::SttError;
use crate::provider::{create_provider, SttProvider};
use crate::types::{AudioFrame, ProviderType, TranscriptionChunk, FRAME_SAMPLES};

/// How long a failed attempt's audio stays eligible for resubmission.
pub const RETRY_WINDOW: Duration = Duration::from_secs(300);

/// Immutable snapshot of a failed attempt: the audio that was being
/// transcribed, the config and provider it ran against, and the error
/// that ended it. Consumed by exactly one retry attempt.
pub struct RetryContext {
    pub audio: Arc<[i16]>,
    pub config: ProviderConfig,
    pub provider: ProviderType,
    pub error: String,
    created_at: Instant,
}

impl RetryContext {
    pub fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.created_at)
    }

    pub fn is_valid(&self, now: Instant) -> bool {
        self.age(now) < RETRY_WINDOW
    }
}

type ProviderFactory =
    dyn Fn(ProviderType, &ProviderConfig) -> Result<Box<dyn SttProvider>, SttError> + Send + Sync;

/// Resubmits a failed attempt's audio, same provider first, then any
/// fallback that can serve the same model. One pass per context; the
/// caller decides whether to mint a fresh context and chain another.
pub struct RetryOrchestrator {
    clock: SharedClock,
    factory: Box<ProviderFactory>,
}

impl RetryOrchestrator {
    pub fn new() -> Self {
        Self::with_clock(real_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            factory: Box::new(create_provider),
        }
    }

    /// Swap the provider factory; tests inject scripted providers here.
    pub fn with_factory<F>(clock: SharedClock, factory: F) -> Self
    where
        F: Fn(ProviderType, &ProviderConfig) -> Result<Box<dyn SttProvider>, SttError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            clock,
            factory: Box::new(factory),
        }
    }

    /// Snapshot a failed attempt for a later retry. Stamped with the
    /// orchestrator's clock so validity is measured consistently.
    pub fn build_context(
        &self,
        audio: Arc<[i16]>,
        config: ProviderConfig,
        provider: ProviderType,
        error: &SttError,
    ) -> RetryContext {
        RetryContext {
            audio,
            config,
            provider,
            error: error.to_string(),
            created_at: self.clock.now(),
        }
    }

    fn candidates(provider: ProviderType, model: &str) -> Vec<ProviderType> {
        let mut list = vec![provider];
        for fallback in ProviderType::FALLBACK_ORDER {
            if fallback != provider && fallback.supports_model(model) {
                list.push(fallback);
            }
        }
        list
    }

    /// Consume the context and resubmit its audio. The validity window
    /// is re-checked first; an expired context is rejected before any
    /// provider is even constructed. Non-retryable failures surface
    /// immediately, retryable ones move on to the next candidate.
    pub async fn attempt_retry(
        &self,
        context: RetryContext,
    ) -> Result<Vec<TranscriptionChunk>, SttError> {
        let age = context.age(self.clock.now());
        if age >= RETRY_WINDOW {
            warn!(target: "stt", ?age, "retry context expired, refusing to resubmit");
            return Err(SttError::RetryWindowExpired { age });
        }

        let candidates = Self::candidates(context.provider, &context.config.model);
        let mut last_error: Option<SttError> = None;
        for candidate in candidates {
            info!(
                target: "stt",
                provider = %candidate,
                samples = context.audio.len(),
                cause = %context.error,
                "resubmitting audio"
            );
            let provider = (self.factory)(candidate, &context.config)?;
            match run_provider(provider.as_ref(), &context).await {
                Ok(chunks) => return Ok(chunks),
                Err(err) if err.is_retryable() => {
                    warn!(
                        target: "stt",
                        provider = %candidate,
                        error = %err,
                        "retry attempt failed"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| SttError::Transcription {
            message: context.error,
            retryable: false,
        }))
    }
}

impl Default for RetryOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-feed the snapshot through a provider as 100 ms frames and collect
/// everything it produces.
async fn run_provider(
    provider: &dyn SttProvider,
    context: &RetryContext,
) -> Result<Vec<TranscriptionChunk>, SttError> {
    let (audio_tx, audio_rx) = mpsc::channel(32);
    let (chunk_tx, mut chunk_rx) = mpsc::channel(32);

    let audio = context.audio.clone();
    let feeder = tokio::spawn(async move {
        for (index, window) in audio.chunks(FRAME_SAMPLES).enumerate() {
            let frame = AudioFrame {
                samples: window.into(),
                timestamp_ms: index as u64 * 100,
            };
            if audio_tx.send(frame).await.is_err() {
                break;
            }
        }
    });
    let collector = tokio::spawn(async move {
        let mut chunks = Vec::new();
        while let Some(chunk) = chunk_rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    });

    let result = provider
        .transcribe(audio_rx, chunk_tx, &context.config)
        .await;
    let _ = feeder.await;
    let chunks = collector.await.unwrap_or_default();
    result.map(|()| chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use whisperline_foundation::{Clock, TestClock};

    fn snapshot(samples: usize) -> Arc<[i16]> {
        Arc::from(vec![200i16; samples])
    }

    fn sample_config() -> ProviderConfig {
        ProviderConfig::new("sk-test", "whisper-1")
    }

    #[test]
    fn context_valid_until_window_elapses() {
        let clock = Arc::new(TestClock::new());
        let orchestrator = RetryOrchestrator::with_clock(clock.clone());
        let context = orchestrator.build_context(
            snapshot(16_000),
            sample_config(),
            ProviderType::OpenAi,
            &SttError::Socket("connection reset".into()),
        );

        assert!(context.is_valid(clock.now()));
        clock.advance(Duration::from_secs(299));
        assert!(context.is_valid(clock.now()));
        clock.advance(Duration::from_secs(1));
        // Exactly 300 s old: no longer valid.
        assert!(!context.is_valid(clock.now()));
    }

    #[test]
    fn candidate_list_respects_catalog() {
        // Model catalogs are disjoint, so no fallback can serve another
        // provider's model and the list collapses to the failing provider.
        assert_eq!(
            RetryOrchestrator::candidates(ProviderType::OpenAi, "whisper-1"),
            vec![ProviderType::OpenAi]
        );
        assert_eq!(
            RetryOrchestrator::candidates(ProviderType::Groq, "whisper-large-v3"),
            vec![ProviderType::Groq]
        );
        assert_eq!(
            RetryOrchestrator::candidates(ProviderType::Deepgram, "nova-2"),
            vec![ProviderType::Deepgram]
        );
    }

    #[tokio::test]
    async fn expired_context_rejected_before_any_attempt() {
        let clock = Arc::new(TestClock::new());
        let factory_calls = Arc::new(AtomicUsize::new(0));
        let calls = factory_calls.clone();
        let orchestrator = RetryOrchestrator::with_factory(clock.clone(), move |provider, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockProvider::new(provider)) as Box<dyn SttProvider>)
        });
        let context = orchestrator.build_context(
            snapshot(16_000),
            sample_config(),
            ProviderType::OpenAi,
            &SttError::Socket("connection reset".into()),
        );
        clock.advance(RETRY_WINDOW);

        let err = orchestrator.attempt_retry(context).await.unwrap_err();
        assert!(matches!(err, SttError::RetryWindowExpired { .. }));
        assert_eq!(factory_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resubmission_returns_provider_chunks() {
        let clock = Arc::new(TestClock::new());
        let factory_calls = Arc::new(AtomicUsize::new(0));
        let calls = factory_calls.clone();
        let orchestrator = RetryOrchestrator::with_factory(clock, move |provider, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(
                MockProvider::new(provider).with_script(vec![("resubmitted text", true)]),
            ) as Box<dyn SttProvider>)
        });
        let context = orchestrator.build_context(
            snapshot(32_000),
            sample_config(),
            ProviderType::OpenAi,
            &SttError::Socket("connection reset".into()),
        );

        let chunks = orchestrator.attempt_retry(context).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final);
        assert_eq!(chunks[0].text, "resubmitted text");
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_retryable_failure_surfaces_immediately() {
        let clock = Arc::new(TestClock::new());
        let orchestrator = RetryOrchestrator::with_factory(clock, |provider, _| {
            Ok(Box::new(MockProvider::new(provider).fail_after(0, false)) as Box<dyn SttProvider>)
        });
        let context = orchestrator.build_context(
            snapshot(16_000),
            sample_config(),
            ProviderType::OpenAi,
            &SttError::Socket("connection reset".into()),
        );

        let err = orchestrator.attempt_retry(context).await.unwrap_err();
        assert!(matches!(
            err,
            SttError::Transcription {
                retryable: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn retryable_failure_reported_after_candidates_exhausted() {
        let clock = Arc::new(TestClock::new());
        let factory_calls = Arc::new(AtomicUsize::new(0));
        let calls = factory_calls.clone();
        let orchestrator = RetryOrchestrator::with_factory(clock, move |provider, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockProvider::new(provider).fail_after(0, true)) as Box<dyn SttProvider>)
        });
        let context = orchestrator.build_context(
            snapshot(16_000),
            sample_config(),
            ProviderType::OpenAi,
            &SttError::Socket("connection reset".into()),
        );

        let err = orchestrator.attempt_retry(context).await.unwrap_err();
        assert!(err.is_retryable());
        // whisper-1 is served by exactly one provider, so one attempt.
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshot_is_refed_as_frames() {
        let mock = MockProvider::new(ProviderType::OpenAi).with_script(vec![("ok", true)]);
        let frames = mock.frame_counter();
        let context = RetryContext {
            audio: snapshot(4_000),
            config: sample_config(),
            provider: ProviderType::OpenAi,
            error: "connection reset".to_string(),
            created_at: Instant::now(),
        };

        let chunks = run_provider(&mock, &context).await.unwrap();
        assert_eq!(chunks.len(), 1);
        // 4,000 samples = two full frames plus an 800-sample remainder.
        assert_eq!(frames.load(Ordering::SeqCst), 3);
    }
}
