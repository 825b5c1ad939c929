use serde::{Deserialize, Serialize};

use crate::error::SttError;
use crate::types::ProviderType;

/// Per-provider transcription settings.
///
/// One of these travels with every session; providers read the fields
/// they understand and ignore the rest (batch providers have no use for
/// `keywords` outside Deepgram, realtime ignores `temperature`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

impl ProviderConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            prompt: None,
            language: None,
            temperature: None,
            keywords: Vec::new(),
        }
    }

    /// Check the config against a provider's catalog before any network
    /// traffic. Key check runs first so a blank key is reported even
    /// when the model is also wrong.
    pub fn validate(&self, provider: ProviderType) -> Result<(), SttError> {
        if self.api_key.trim().is_empty() {
            return Err(SttError::InvalidApiKey);
        }
        if !provider.supports_model(&self.model) {
            return Err(SttError::InvalidModel {
                model: self.model.clone(),
            });
        }
        Ok(())
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::new("", "whisper-1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_config_passes() {
        let cfg = ProviderConfig::new("sk-test", "whisper-1");
        assert!(cfg.validate(ProviderType::OpenAi).is_ok());
    }

    #[test]
    fn empty_key_rejected() {
        let cfg = ProviderConfig::new("", "whisper-1");
        assert!(matches!(
            cfg.validate(ProviderType::OpenAi),
            Err(SttError::InvalidApiKey)
        ));
    }

    #[test]
    fn whitespace_key_rejected() {
        let cfg = ProviderConfig::new("   ", "whisper-1");
        assert!(matches!(
            cfg.validate(ProviderType::OpenAi),
            Err(SttError::InvalidApiKey)
        ));
    }

    #[test]
    fn unknown_model_rejected() {
        let cfg = ProviderConfig::new("sk-test", "whisper-99");
        match cfg.validate(ProviderType::OpenAi) {
            Err(SttError::InvalidModel { model }) => assert_eq!(model, "whisper-99"),
            other => panic!("expected InvalidModel, got {other:?}"),
        }
    }

    #[test]
    fn model_from_another_provider_rejected() {
        // nova-2 is Deepgram's; Groq must refuse it.
        let cfg = ProviderConfig::new("gsk-test", "nova-2");
        assert!(matches!(
            cfg.validate(ProviderType::Groq),
            Err(SttError::InvalidModel { .. })
        ));
    }

    #[test]
    fn key_check_wins_when_both_invalid() {
        let cfg = ProviderConfig::new("", "whisper-99");
        assert!(matches!(
            cfg.validate(ProviderType::OpenAi),
            Err(SttError::InvalidApiKey)
        ));
    }
}
