use std::path::Path;
use std::str::FromStr;

use config::{Config, Environment, File};
use serde::Deserialize;

use whisperline_stt::{ProviderConfig, ProviderType};

/// Application settings, loaded from `whisperline.toml` plus
/// `WHISPERLINE_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Input device name. `None` selects the system default.
    pub device: Option<String>,
    /// Transcription backend: "openai", "groq" or "deepgram".
    pub provider: String,
    /// Model identifier; must belong to the selected backend.
    pub model: String,
    /// API key for the selected backend. Can also be set at runtime.
    pub api_key: String,
    /// ISO-639-1 language hint passed through to the backend.
    pub language: Option<String>,
    /// Vocabulary/context prompt for Whisper-style backends.
    pub prompt: Option<String>,
    /// Sampling temperature in [0.0, 1.0].
    pub temperature: Option<f32>,
    /// Keyword boosts (Deepgram only).
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Stream partial hypotheses into the live transcript (realtime models).
    pub partial_results: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            device: None,
            provider: "openai".to_string(),
            model: "whisper-1".to_string(),
            api_key: String::new(),
            language: None,
            prompt: None,
            temperature: None,
            keywords: Vec::new(),
            partial_results: true,
        }
    }
}

impl Settings {
    /// Load settings from a specific config file path (for tests)
    pub fn from_path(config_path: impl AsRef<Path>) -> Result<Self, String> {
        let mut builder = Self::builder_with_defaults();

        builder = builder.add_source(File::from(config_path.as_ref()).required(true));

        // Environment variables override the file's settings.
        builder = builder.add_source(
            Environment::with_prefix("WHISPERLINE")
                .separator("__")
                .list_separator(" "),
        );

        let config = builder
            .build()
            .map_err(|e| format!("Failed to build config: {}", e))?;

        let mut settings: Settings = config
            .try_deserialize()
            .map_err(|e| format!("Failed to deserialize settings: {}", e))?;

        settings.validate()?;

        Ok(settings)
    }

    pub fn new() -> Result<Self, String> {
        let mut builder = Self::builder_with_defaults();

        let config_path = Path::new("whisperline.toml");
        if config_path.exists() {
            tracing::info!("Loading configuration from: {}", config_path.display());
            builder = builder.add_source(File::from(config_path).required(true));
        } else {
            tracing::info!(
                "No configuration file at 'whisperline.toml'. Using defaults and environment variables."
            );
        }

        // Environment variables override the file's settings.
        builder = builder.add_source(
            Environment::with_prefix("WHISPERLINE")
                .separator("__")
                .list_separator(" "),
        );

        let config = builder
            .build()
            .map_err(|e| format!("Failed to build config: {}", e))?;

        let mut settings: Settings = config
            .try_deserialize()
            .map_err(|e| format!("Failed to deserialize settings: {}", e))?;

        settings.validate()?;

        Ok(settings)
    }

    fn builder_with_defaults() -> config::builder::ConfigBuilder<config::builder::DefaultState> {
        // Defaults for required fields so deserialization succeeds without a file.
        Config::builder()
            .set_default("provider", "openai").unwrap()
            .set_default("model", "whisper-1").unwrap()
            .set_default("api_key", "").unwrap()
            .set_default("partial_results", true).unwrap()
            .set_default("keywords", Vec::<String>::new()).unwrap()
    }

    pub fn validate(&mut self) -> Result<(), String> {
        // Validate provider
        if ProviderType::from_str(&self.provider).is_err() {
            tracing::warn!("Invalid provider '{}'. Defaulting to 'openai'.", self.provider);
            self.provider = "openai".to_string();
        }

        // Validate model against the provider's catalog
        let provider = self.provider_type();
        if !provider.supports_model(&self.model) {
            let fallback = provider.default_model();
            tracing::warn!(
                "Model '{}' is not available on {}. Defaulting to '{}'.",
                self.model,
                provider,
                fallback
            );
            self.model = fallback.to_string();
        }

        // Clamp temperature into the range the backends accept
        if let Some(t) = self.temperature {
            if !(0.0..=1.0).contains(&t) {
                let clamped = t.clamp(0.0, 1.0);
                tracing::warn!("Temperature {} out of range. Clamping to {}.", t, clamped);
                self.temperature = Some(clamped);
            }
        }

        if self.api_key.trim().is_empty() {
            tracing::warn!("No API key configured. Set it in whisperline.toml, WHISPERLINE_API_KEY or with the 'key' command.");
        }

        Ok(())
    }

    /// The selected backend. `validate` guarantees the string parses.
    pub fn provider_type(&self) -> ProviderType {
        ProviderType::from_str(&self.provider).unwrap_or(ProviderType::OpenAi)
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            prompt: self.prompt.clone(),
            language: self.language.clone(),
            temperature: self.temperature,
            keywords: self.keywords.clone(),
        }
    }
}
