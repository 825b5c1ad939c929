use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use whisperline_audio::{
    AudioChunker, AudioRingBuffer, CaptureThread, ChunkerConfig, DeviceInfo, DeviceManager,
    LevelMeter,
};
use whisperline_foundation::{AppError, AudioError, PipelineState, StateManager};
use whisperline_stt::{
    create_provider, ProviderConfig, ProviderType, RetryOrchestrator, SttError, SttProvider,
    TranscriptionAggregator, TranscriptionChunk,
};

use crate::settings::Settings;

/// Ring buffer sized for several seconds of device-rate audio, so a busy
/// runtime never backs up into the capture callback.
const RING_BUFFER_SAMPLES: usize = 16_384 * 4;

/// Fan-out depth for 100 ms frames before slow subscribers start lagging.
const FRAME_CHANNEL_CAPACITY: usize = 200;

/// Depth of the per-recording audio and chunk channels.
const PIPELINE_CHANNEL_CAPACITY: usize = 64;

/// How long `stop` waits for the provider to deliver the final transcript.
/// Covers a full batch request plus one retry round.
const STOP_GRACE: Duration = Duration::from_secs(120);

/// Owns one microphone-to-transcript pipeline.
///
/// `start` wires capture thread -> chunker -> provider task and returns
/// immediately; transcription results accumulate in the shared aggregator
/// as the backend produces them. `stop` tears the chain down from the
/// capture side and waits for the final transcript.
pub struct TranscriptionPipeline {
    state: StateManager,
    aggregator: Arc<Mutex<TranscriptionAggregator>>,
    level: Arc<LevelMeter>,
    retry: Arc<RetryOrchestrator>,
    last_error: Arc<Mutex<Option<String>>>,
    provider: ProviderType,
    config: ProviderConfig,
    device: Option<String>,
    active: Option<ActiveRecording>,
}

/// Task handles for the recording in flight.
struct ActiveRecording {
    capture: CaptureThread,
    chunker: JoinHandle<()>,
    feeder: JoinHandle<()>,
    supervisor: JoinHandle<()>,
}

/// Shared handles the supervisor task publishes results through.
struct FlowContext {
    state: StateManager,
    aggregator: Arc<Mutex<TranscriptionAggregator>>,
    last_error: Arc<Mutex<Option<String>>>,
    retry: Arc<RetryOrchestrator>,
    provider_type: ProviderType,
    config: ProviderConfig,
    snapshot: Arc<Mutex<Vec<i16>>>,
}

impl TranscriptionPipeline {
    pub fn new(
        provider: ProviderType,
        config: ProviderConfig,
        device: Option<String>,
        partial_results: bool,
    ) -> Self {
        Self {
            state: StateManager::new(),
            aggregator: Arc::new(Mutex::new(TranscriptionAggregator::new(partial_results))),
            level: Arc::new(LevelMeter::new()),
            retry: Arc::new(RetryOrchestrator::new()),
            last_error: Arc::new(Mutex::new(None)),
            provider,
            config,
            device,
            active: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.provider_type(),
            settings.provider_config(),
            settings.device.clone(),
            settings.partial_results,
        )
    }

    /// Start a recording. Validates the provider configuration before any
    /// device is touched, so a bad key or model fails fast and leaves the
    /// pipeline idle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), AppError> {
        if self.active.is_some() {
            return Err(AppError::Audio(AudioError::AlreadyRecording));
        }

        let provider = create_provider(self.provider, &self.config)
            .map_err(|e| AppError::Config(e.to_string()))?;
        self.start_with(provider)
    }

    /// Start with a caller-supplied provider, skipping config validation.
    /// Used by offline runs and tests that script the backend.
    pub fn start_with(&mut self, provider: Box<dyn SttProvider>) -> Result<(), AppError> {
        if self.active.is_some() {
            return Err(AppError::Audio(AudioError::AlreadyRecording));
        }

        self.state.transition(PipelineState::Starting)?;
        self.level.reset();
        *self.last_error.lock() = None;

        let (producer, consumer) = AudioRingBuffer::new(RING_BUFFER_SAMPLES).split();

        let (capture, device_config, _stats) =
            match CaptureThread::spawn(producer, self.level.clone(), self.device.clone()) {
                Ok(parts) => parts,
                Err(e) => {
                    let err = AppError::from(e);
                    self.abort_start(&err);
                    return Err(err);
                }
            };

        info!(
            target: "session",
            sample_rate = device_config.sample_rate,
            channels = device_config.channels,
            "capture stream open"
        );

        let (frame_tx, frames_rx) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let chunker =
            match AudioChunker::new(consumer, device_config, frame_tx, ChunkerConfig::default()) {
                Ok(chunker) => chunker,
                Err(e) => {
                    capture.stop();
                    let err = AppError::from(e);
                    self.abort_start(&err);
                    return Err(err);
                }
            };
        let chunker_handle = chunker.spawn();

        self.aggregator.lock().begin();

        let (audio_tx, audio_rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        let snapshot: Arc<Mutex<Vec<i16>>> = Arc::new(Mutex::new(Vec::new()));
        let feeder = spawn_frame_feeder(frames_rx, audio_tx, snapshot.clone());

        let ctx = FlowContext {
            state: self.state.clone(),
            aggregator: self.aggregator.clone(),
            last_error: self.last_error.clone(),
            retry: self.retry.clone(),
            provider_type: self.provider,
            config: self.config.clone(),
            snapshot,
        };
        let supervisor = tokio::spawn(run_transcription(provider, audio_rx, ctx));

        self.active = Some(ActiveRecording {
            capture,
            chunker: chunker_handle,
            feeder,
            supervisor,
        });
        self.state.transition(PipelineState::Recording)?;

        info!(
            target: "session",
            provider = %self.provider,
            model = %self.config.model,
            "recording started"
        );
        Ok(())
    }

    /// Stop the recording in flight and wait for the final transcript.
    /// A stop with no active recording is a no-op.
    pub async fn stop(&mut self) -> Result<(), AppError> {
        let Some(active) = self.active.take() else {
            debug!(target: "session", "stop requested while idle");
            return Ok(());
        };

        if self.state.is_recording() {
            self.state.transition(PipelineState::Stopping)?;
        }

        // Tear down from the capture side. Dropping the ring-buffer
        // producer cascades: the chunker drains and exits, the frame
        // fan-out closes, and the provider sees end-of-audio and
        // finalizes whatever it has.
        active.capture.stop();
        let _ = active.chunker.await;
        let _ = active.feeder.await;

        let mut supervisor = active.supervisor;
        match tokio::time::timeout(STOP_GRACE, &mut supervisor).await {
            Ok(_) => {}
            Err(_) => {
                warn!(
                    target: "session",
                    grace = ?STOP_GRACE,
                    "provider did not finish in time, abandoning the attempt"
                );
                supervisor.abort();
                let mut aggregator = self.aggregator.lock();
                if aggregator.is_transcribing() {
                    aggregator.stop();
                }
            }
        }

        if matches!(self.state.current(), PipelineState::Stopping) {
            self.state.transition(PipelineState::Idle)?;
        }

        info!(target: "session", "recording stopped");
        Ok(())
    }

    fn abort_start(&self, err: &AppError) {
        let message = err.to_string();
        *self.last_error.lock() = Some(message.clone());
        let _ = self.state.transition(PipelineState::Error { message });
    }

    // ─── Observation ────────────────────────────────────────────────────

    /// The display transcript: confirmed text plus any visible partials.
    pub fn transcript(&self) -> String {
        self.aggregator.lock().current_text()
    }

    pub fn is_transcribing(&self) -> bool {
        self.aggregator.lock().is_transcribing()
    }

    /// Live input level in [0.0, 1.0].
    pub fn audio_level(&self) -> f32 {
        self.level.level()
    }

    pub fn state(&self) -> PipelineState {
        self.state.current()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn provider(&self) -> ProviderType {
        self.provider
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>, AppError> {
        Ok(DeviceManager::new()?.enumerate_devices())
    }

    // ─── Reconfiguration (rejected while a recording is live) ───────────

    /// Switch backends. If the current model does not exist on the new
    /// backend, the backend's default model is selected alongside.
    pub fn set_provider(&mut self, provider: ProviderType) -> Result<(), AppError> {
        self.ensure_idle()?;
        self.provider = provider;
        if !provider.supports_model(&self.config.model) {
            let fallback = provider.default_model();
            info!(target: "session", model = fallback, "switched to the provider's default model");
            self.config.model = fallback.to_string();
        }
        Ok(())
    }

    /// Replace the whole provider configuration at once.
    pub fn set_config(&mut self, config: ProviderConfig) -> Result<(), AppError> {
        self.ensure_idle()?;
        self.config = config;
        Ok(())
    }

    pub fn set_model(&mut self, model: &str) -> Result<(), AppError> {
        self.ensure_idle()?;
        if !self.provider.supports_model(model) {
            return Err(AppError::Config(format!(
                "model '{}' is not available on {}",
                model, self.provider
            )));
        }
        self.config.model = model.to_string();
        Ok(())
    }

    pub fn set_api_key(&mut self, key: &str) -> Result<(), AppError> {
        self.ensure_idle()?;
        self.config.api_key = key.to_string();
        Ok(())
    }

    pub fn set_language(&mut self, language: Option<String>) -> Result<(), AppError> {
        self.ensure_idle()?;
        self.config.language = language;
        Ok(())
    }

    pub fn set_device(&mut self, device: Option<String>) -> Result<(), AppError> {
        self.ensure_idle()?;
        self.device = device;
        Ok(())
    }

    pub fn set_partial_results(&mut self, enabled: bool) -> Result<(), AppError> {
        self.ensure_idle()?;
        self.aggregator.lock().set_partials_enabled(enabled);
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), AppError> {
        if self.active.is_some() {
            return Err(AppError::Audio(AudioError::AlreadyRecording));
        }
        Ok(())
    }
}

/// Bridge the broadcast fan-out into the provider's audio channel while
/// accumulating the retry snapshot.
fn spawn_frame_feeder(
    mut frames: broadcast::Receiver<whisperline_audio::AudioFrame>,
    audio_tx: mpsc::Sender<whisperline_stt::AudioFrame>,
    snapshot: Arc<Mutex<Vec<i16>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    // Snapshot before forwarding. The consume side trims
                    // it at each confirmed final, so after a mid-stream
                    // failure it holds only audio with no merged text.
                    snapshot.lock().extend_from_slice(&frame.samples);
                    let out = whisperline_stt::AudioFrame {
                        samples: frame.samples.clone(),
                        timestamp_ms: frame.timestamp_ms,
                    };
                    if audio_tx.send(out).await.is_err() {
                        debug!(target: "stt", "provider dropped its audio input, feeder exiting");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(target: "stt", missed, "frame fan-out lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Supervise one transcription attempt: run the provider to completion,
/// then either finish cleanly, resubmit the captured audio through the
/// retry orchestrator, or report the failure.
async fn run_transcription(
    provider: Box<dyn SttProvider>,
    audio_rx: mpsc::Receiver<whisperline_stt::AudioFrame>,
    ctx: FlowContext,
) {
    let (chunk_tx, chunk_rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);

    // Single consumer owns every merge into the aggregator.
    let consumer = tokio::spawn(consume_chunks(
        chunk_rx,
        ctx.aggregator.clone(),
        ctx.snapshot.clone(),
    ));

    let result = provider.transcribe(audio_rx, chunk_tx, &ctx.config).await;

    // transcribe dropped its sender, so the consumer drains and exits.
    let _ = consumer.await;

    match result {
        Ok(()) => {
            ctx.aggregator.lock().stop();
            info!(target: "stt", "transcription finished");
        }
        Err(err) if err.is_retryable() => {
            let audio: Arc<[i16]> = {
                let snapshot = ctx.snapshot.lock();
                Arc::from(snapshot.as_slice())
            };
            warn!(
                target: "stt",
                error = %err,
                samples = audio.len(),
                "transcription failed, resubmitting captured audio"
            );
            let retry_ctx =
                ctx.retry
                    .build_context(audio, ctx.config.clone(), ctx.provider_type, &err);
            match ctx.retry.attempt_retry(retry_ctx).await {
                Ok(chunks) => {
                    let mut aggregator = ctx.aggregator.lock();
                    for chunk in &chunks {
                        aggregator.apply(chunk);
                    }
                    aggregator.stop();
                    info!(target: "stt", chunks = chunks.len(), "retry recovered the transcript");
                }
                Err(retry_err) => report_failure(&ctx, retry_err),
            }
        }
        Err(err) => report_failure(&ctx, err),
    }
}

fn report_failure(ctx: &FlowContext, err: SttError) {
    let message = err.to_string();
    error!(target: "stt", error = %message, "transcription failed");
    *ctx.last_error.lock() = Some(message.clone());
    ctx.aggregator.lock().fail(message.clone());
    if ctx.state.is_recording() {
        let _ = ctx.state.transition(PipelineState::Error { message });
    }
}

async fn consume_chunks(
    mut chunks: mpsc::Receiver<TranscriptionChunk>,
    aggregator: Arc<Mutex<TranscriptionAggregator>>,
    snapshot: Arc<Mutex<Vec<i16>>>,
) {
    while let Some(chunk) = chunks.recv().await {
        debug!(
            target: "stt",
            is_final = chunk.is_final,
            chars = chunk.text.len(),
            "chunk received"
        );
        aggregator.lock().apply(&chunk);
        if chunk.is_final {
            // Audio covered by a confirmed final must never be
            // resubmitted, or a retry would append its text twice.
            snapshot.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use whisperline_foundation::RealClock;
    use whisperline_stt::providers::MockProvider;

    fn test_config() -> ProviderConfig {
        ProviderConfig::new("sk-test", "whisper-1")
    }

    /// A context whose state machine has been walked into `Recording`.
    fn recording_ctx() -> FlowContext {
        let state = StateManager::new();
        state.transition(PipelineState::Starting).unwrap();
        state.transition(PipelineState::Recording).unwrap();
        FlowContext {
            state,
            aggregator: Arc::new(Mutex::new(TranscriptionAggregator::new(true))),
            last_error: Arc::new(Mutex::new(None)),
            retry: Arc::new(RetryOrchestrator::new()),
            provider_type: ProviderType::OpenAi,
            config: test_config(),
            snapshot: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn feed_frames(count: usize) -> mpsc::Receiver<whisperline_stt::AudioFrame> {
        let (tx, rx) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        for i in 0..count {
            let frame = whisperline_stt::AudioFrame {
                samples: vec![100i16; 1600].into(),
                timestamp_ms: (i as u64) * 100,
            };
            tx.send(frame).await.unwrap();
        }
        rx
    }

    // ─── Supervisor flow ────────────────────────────────────────────────

    #[tokio::test]
    async fn provider_chunks_reach_the_aggregator() {
        let ctx = recording_ctx();
        ctx.aggregator.lock().begin();
        let provider = MockProvider::new(ProviderType::OpenAi)
            .with_script(vec![("Hello", false), ("Hello world", true)]);
        let audio_rx = feed_frames(3).await;

        run_transcription(Box::new(provider), audio_rx, recycle(&ctx)).await;

        let aggregator = ctx.aggregator.lock();
        assert_eq!(aggregator.current_text(), "Hello world");
        assert!(!aggregator.is_transcribing());
        assert!(aggregator.last_error().is_none());
    }

    #[tokio::test]
    async fn retryable_failure_resubmits_the_snapshot() {
        let ctx = recording_ctx();
        ctx.aggregator.lock().begin();
        ctx.snapshot.lock().extend_from_slice(&[250i16; 3200]);

        let provider = MockProvider::new(ProviderType::OpenAi).fail_after(0, true);
        let retry = RetryOrchestrator::with_factory(Arc::new(RealClock), |provider, _| {
            Ok(Box::new(
                MockProvider::new(provider).with_script(vec![("recovered", true)]),
            ) as Box<dyn SttProvider>)
        });
        let ctx = FlowContext {
            retry: Arc::new(retry),
            ..recycle(&ctx)
        };

        let audio_rx = feed_frames(2).await;
        run_transcription(Box::new(provider), audio_rx, recycle(&ctx)).await;

        let aggregator = ctx.aggregator.lock();
        assert_eq!(aggregator.current_text(), "recovered");
        assert!(!aggregator.is_transcribing());
        assert!(aggregator.last_error().is_none());
        assert!(ctx.last_error.lock().is_none());
        // Retry recovery does not disturb the lifecycle.
        assert!(ctx.state.is_recording());
    }

    #[tokio::test]
    async fn merged_final_is_excluded_from_the_resubmission() {
        let ctx = recording_ctx();
        ctx.aggregator.lock().begin();
        ctx.snapshot.lock().extend_from_slice(&[250i16; 3200]);

        // Confirms one utterance, then fails with a retryable cause.
        let provider = MockProvider::new(ProviderType::OpenAi)
            .with_script(vec![("First part.", true)])
            .fail_after(1, true);
        let retry = RetryOrchestrator::with_factory(Arc::new(RealClock), |provider, _| {
            Ok(Box::new(
                MockProvider::new(provider).with_script(vec![("and the tail", true)]),
            ) as Box<dyn SttProvider>)
        });
        let ctx = FlowContext {
            retry: Arc::new(retry),
            ..recycle(&ctx)
        };

        let audio_rx = feed_frames(1).await;
        run_transcription(Box::new(provider), audio_rx, recycle(&ctx)).await;

        // The confirmed utterance's audio was dropped before the retry,
        // and its text appears exactly once.
        assert!(ctx.snapshot.lock().is_empty());
        let aggregator = ctx.aggregator.lock();
        assert_eq!(aggregator.current_text(), "First part. and the tail");
        assert!(aggregator.last_error().is_none());
    }

    #[tokio::test]
    async fn unrecovered_failure_preserves_text_and_reports() {
        let ctx = recording_ctx();
        ctx.aggregator.lock().begin();

        // Emits one final chunk, then fails without a retryable cause.
        let provider = MockProvider::new(ProviderType::OpenAi)
            .with_script(vec![("Kept text.", true)])
            .fail_after(1, false);
        let audio_rx = feed_frames(2).await;

        run_transcription(Box::new(provider), audio_rx, recycle(&ctx)).await;

        let aggregator = ctx.aggregator.lock();
        assert_eq!(aggregator.current_text(), "Kept text.");
        assert!(!aggregator.is_transcribing());
        assert!(aggregator.last_error().unwrap().contains("scripted mock failure"));
        drop(aggregator);
        assert!(ctx.last_error.lock().as_deref().unwrap().contains("scripted mock failure"));
        assert!(matches!(ctx.state.current(), PipelineState::Error { .. }));
    }

    #[tokio::test]
    async fn failed_retry_surfaces_the_final_error() {
        let ctx = recording_ctx();
        ctx.aggregator.lock().begin();
        ctx.snapshot.lock().extend_from_slice(&[250i16; 1600]);

        let provider = MockProvider::new(ProviderType::OpenAi).fail_after(0, true);
        let retry = RetryOrchestrator::with_factory(Arc::new(RealClock), |provider, _| {
            Ok(Box::new(MockProvider::new(provider).fail_after(0, false)) as Box<dyn SttProvider>)
        });
        let ctx = FlowContext {
            retry: Arc::new(retry),
            ..recycle(&ctx)
        };

        let audio_rx = feed_frames(1).await;
        run_transcription(Box::new(provider), audio_rx, recycle(&ctx)).await;

        assert!(ctx.last_error.lock().is_some());
        assert!(matches!(ctx.state.current(), PipelineState::Error { .. }));
    }

    // ─── Pipeline surface (headless) ────────────────────────────────────

    #[tokio::test]
    async fn stop_while_idle_is_a_noop() {
        let mut pipeline =
            TranscriptionPipeline::new(ProviderType::OpenAi, test_config(), None, true);

        pipeline.stop().await.unwrap();

        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert!(!pipeline.is_recording());
    }

    #[tokio::test]
    async fn start_with_invalid_config_fails_before_device_access() {
        let config = ProviderConfig::new("", "whisper-1");
        let mut pipeline = TranscriptionPipeline::new(ProviderType::OpenAi, config, None, true);

        let err = pipeline.start().unwrap_err();

        assert!(matches!(err, AppError::Config(_)));
        assert!(err.to_string().contains("Invalid API key"));
        // Validation failures leave the lifecycle untouched.
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert!(!pipeline.is_recording());
    }

    #[tokio::test]
    async fn start_with_unknown_model_fails_before_device_access() {
        let config = ProviderConfig::new("sk-test", "nova-2");
        let mut pipeline = TranscriptionPipeline::new(ProviderType::OpenAi, config, None, true);

        let err = pipeline.start().unwrap_err();

        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn provider_switch_carries_the_default_model() {
        let mut pipeline = TranscriptionPipeline::new(
            ProviderType::OpenAi,
            ProviderConfig::new("key", "gpt-4o-transcribe"),
            None,
            true,
        );

        pipeline.set_provider(ProviderType::Deepgram).unwrap();

        assert_eq!(pipeline.provider(), ProviderType::Deepgram);
        assert_eq!(pipeline.config().model, ProviderType::Deepgram.default_model());
    }

    #[test]
    fn set_model_rejects_models_from_other_catalogs() {
        let mut pipeline =
            TranscriptionPipeline::new(ProviderType::OpenAi, test_config(), None, true);

        let err = pipeline.set_model("nova-3").unwrap_err();
        assert!(matches!(err, AppError::Config(_)));

        pipeline.set_model("gpt-4o-transcribe").unwrap();
        assert_eq!(pipeline.config().model, "gpt-4o-transcribe");
    }

    /// Clone-by-hand for the test contexts; the runtime itself never
    /// needs two copies.
    fn recycle(ctx: &FlowContext) -> FlowContext {
        FlowContext {
            state: ctx.state.clone(),
            aggregator: ctx.aggregator.clone(),
            last_error: ctx.last_error.clone(),
            retry: ctx.retry.clone(),
            provider_type: ctx.provider_type,
            config: ctx.config.clone(),
            snapshot: ctx.snapshot.clone(),
        }
    }
}
