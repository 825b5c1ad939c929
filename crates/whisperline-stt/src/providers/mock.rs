//! Scripted provider for pipeline tests and offline runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::SttError;
use crate::provider::SttProvider;
use crate::types::{AudioFrame, ProviderType, TranscriptionChunk};

/// Drains the audio stream, then plays back a script of chunks.
/// Failure injection and shared counters make provider-level behavior
/// observable from pipeline tests.
pub struct MockProvider {
    provider: ProviderType,
    script: Vec<(String, bool)>,
    fail_after: Option<(usize, bool)>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    frames_seen: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new(provider: ProviderType) -> Self {
        Self {
            provider,
            script: Vec::new(),
            fail_after: None,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            frames_seen: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Chunks to emit once the audio stream ends, as `(text, is_final)`.
    pub fn with_script(mut self, script: Vec<(&str, bool)>) -> Self {
        self.script = script
            .into_iter()
            .map(|(text, is_final)| (text.to_string(), is_final))
            .collect();
        self
    }

    /// Fail after emitting exactly `chunks` entries of the script.
    pub fn fail_after(mut self, chunks: usize, retryable: bool) -> Self {
        self.fail_after = Some((chunks, retryable));
        self
    }

    /// Pause between emitted chunks.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of times `transcribe` has been invoked.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Number of audio frames drained across all invocations.
    pub fn frame_counter(&self) -> Arc<AtomicUsize> {
        self.frames_seen.clone()
    }

    fn failure(retryable: bool) -> SttError {
        SttError::Transcription {
            message: "scripted mock failure".to_string(),
            retryable,
        }
    }
}

#[async_trait]
impl SttProvider for MockProvider {
    fn provider_type(&self) -> ProviderType {
        self.provider
    }

    // Accepts any config so tests can exercise the pipeline without a
    // catalog-exact setup.
    fn validate(&self, _config: &ProviderConfig) -> Result<(), SttError> {
        Ok(())
    }

    async fn transcribe(
        &self,
        mut audio: mpsc::Receiver<AudioFrame>,
        chunks: mpsc::Sender<TranscriptionChunk>,
        _config: &ProviderConfig,
    ) -> Result<(), SttError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut frames = 0usize;
        while audio.recv().await.is_some() {
            frames += 1;
        }
        self.frames_seen.fetch_add(frames, Ordering::SeqCst);
        debug!(target: "stt", frames, "mock audio stream ended, playing script");

        for (emitted, (text, is_final)) in self.script.iter().enumerate() {
            if let Some((after, retryable)) = self.fail_after {
                if emitted == after {
                    return Err(Self::failure(retryable));
                }
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let chunk = if *is_final {
                TranscriptionChunk::final_result(text.clone())
            } else {
                TranscriptionChunk::partial(text.clone())
            };
            if chunks.send(chunk).await.is_err() {
                return Ok(());
            }
        }
        if let Some((after, retryable)) = self.fail_after {
            if after >= self.script.len() {
                return Err(Self::failure(retryable));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FRAME_SAMPLES;

    fn frame() -> AudioFrame {
        AudioFrame {
            samples: Arc::from(vec![0i16; FRAME_SAMPLES]),
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn plays_script_after_audio_ends() {
        let provider = MockProvider::new(ProviderType::OpenAi)
            .with_script(vec![("Hello", false), ("Hello world", true)]);
        let frames = provider.frame_counter();
        let config = ProviderConfig::default();

        let (audio_tx, audio_rx) = mpsc::channel(4);
        let (chunk_tx, mut chunk_rx) = mpsc::channel(4);
        audio_tx.send(frame()).await.unwrap();
        audio_tx.send(frame()).await.unwrap();
        drop(audio_tx);

        provider
            .transcribe(audio_rx, chunk_tx, &config)
            .await
            .unwrap();

        let first = chunk_rx.recv().await.unwrap();
        assert!(!first.is_final);
        assert_eq!(first.text, "Hello");
        let second = chunk_rx.recv().await.unwrap();
        assert!(second.is_final);
        assert_eq!(second.text, "Hello world");
        assert!(chunk_rx.recv().await.is_none());
        assert_eq!(frames.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fails_mid_script() {
        let provider = MockProvider::new(ProviderType::OpenAi)
            .with_script(vec![("partial", false), ("never sent", true)])
            .fail_after(1, true);
        let config = ProviderConfig::default();

        let (audio_tx, audio_rx) = mpsc::channel::<AudioFrame>(1);
        let (chunk_tx, mut chunk_rx) = mpsc::channel(4);
        drop(audio_tx);

        let err = provider
            .transcribe(audio_rx, chunk_tx, &config)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(chunk_rx.recv().await.unwrap().text, "partial");
        assert!(chunk_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn fails_before_emitting_when_scripted() {
        let provider = MockProvider::new(ProviderType::Groq).fail_after(0, false);
        let calls = provider.call_counter();
        let config = ProviderConfig::default();

        let (audio_tx, audio_rx) = mpsc::channel::<AudioFrame>(1);
        let (chunk_tx, _chunk_rx) = mpsc::channel(4);
        drop(audio_tx);

        let err = provider
            .transcribe(audio_rx, chunk_tx, &config)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
