use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ProviderConfig;
use crate::error::SttError;
use crate::providers::{BatchProvider, RealtimeProvider};
use crate::types::{AudioFrame, ProviderType, TranscriptionChunk};

/// Capability surface shared by the batch and realtime families.
///
/// Callers depend on this trait only; which concrete shape they get is
/// decided by the model catalog, not by them.
#[async_trait]
pub trait SttProvider: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    /// Fail fast on bad config. Runs before any network call.
    fn validate(&self, config: &ProviderConfig) -> Result<(), SttError> {
        config.validate(self.provider_type())
    }

    /// Consume `audio` to completion and emit transcription chunks on
    /// `chunks` as they become available. Returns once the audio stream
    /// has ended and every chunk the backend will produce has been
    /// forwarded.
    async fn transcribe(
        &self,
        audio: mpsc::Receiver<AudioFrame>,
        chunks: mpsc::Sender<TranscriptionChunk>,
        config: &ProviderConfig,
    ) -> Result<(), SttError>;
}

/// Validate the config and build the matching provider. Realtime models
/// get the socket-backed provider, everything else goes over batch HTTP.
pub fn create_provider(
    provider: ProviderType,
    config: &ProviderConfig,
) -> Result<Box<dyn SttProvider>, SttError> {
    config.validate(provider)?;
    if provider.is_realtime_model(&config.model) {
        Ok(Box::new(RealtimeProvider::new(provider)))
    } else {
        Ok(Box::new(BatchProvider::new(provider)))
    }
}
