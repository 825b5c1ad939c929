//! Core types for the transcription pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Pipeline sample rate; every provider consumes this format.
pub const SAMPLE_RATE_HZ: u32 = 16_000;

/// 100 ms of pipeline audio.
pub const FRAME_SAMPLES: usize = 1_600;

/// One fixed chunk of pipeline audio: 16 kHz, mono, S16LE.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Arc<[i16]>,
    pub timestamp_ms: u64,
}

/// One unit of transcription output from a provider.
///
/// Final chunks are authoritative and irreversible once merged; partial
/// chunks are provisional and superseded by later chunks of the same
/// utterance. Never mutated after production.
#[derive(Debug, Clone)]
pub struct TranscriptionChunk {
    pub text: String,
    pub is_final: bool,
    pub timestamp: Instant,
}

impl TranscriptionChunk {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            timestamp: Instant::now(),
        }
    }

    pub fn final_result(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            timestamp: Instant::now(),
        }
    }
}

/// Supported transcription backends.
///
/// Each provider exposes disjoint sets of batch-capable and
/// realtime-capable model names; the catalog is static configuration
/// data, and the transport family is chosen by which set contains the
/// configured model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    OpenAi,
    Groq,
    Deepgram,
}

impl ProviderType {
    /// Static preference order used when a retry falls back to another
    /// provider.
    pub const FALLBACK_ORDER: [ProviderType; 3] =
        [ProviderType::OpenAi, ProviderType::Groq, ProviderType::Deepgram];

    pub fn batch_models(&self) -> &'static [&'static str] {
        match self {
            ProviderType::OpenAi => &["whisper-1"],
            ProviderType::Groq => &[
                "whisper-large-v3",
                "whisper-large-v3-turbo",
                "distil-whisper-large-v3-en",
            ],
            ProviderType::Deepgram => &["nova-2", "nova-3"],
        }
    }

    pub fn realtime_models(&self) -> &'static [&'static str] {
        match self {
            ProviderType::OpenAi => &["gpt-4o-transcribe", "gpt-4o-mini-transcribe"],
            ProviderType::Groq | ProviderType::Deepgram => &[],
        }
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.batch_models().contains(&model) || self.realtime_models().contains(&model)
    }

    /// The model picked when switching to this provider without choosing one.
    pub fn default_model(&self) -> &'static str {
        self.batch_models()[0]
    }

    pub fn is_realtime_model(&self, model: &str) -> bool {
        self.realtime_models().contains(&model)
    }

    pub fn batch_url(&self) -> &'static str {
        match self {
            ProviderType::OpenAi => "https://api.openai.com/v1/audio/transcriptions",
            ProviderType::Groq => "https://api.groq.com/openai/v1/audio/transcriptions",
            ProviderType::Deepgram => "https://api.deepgram.com/v1/listen",
        }
    }

    pub fn realtime_url(&self) -> Option<&'static str> {
        match self {
            ProviderType::OpenAi => Some("wss://api.openai.com/v1/realtime?intent=transcription"),
            ProviderType::Groq | ProviderType::Deepgram => None,
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderType::OpenAi => "openai",
            ProviderType::Groq => "groq",
            ProviderType::Deepgram => "deepgram",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderType::OpenAi),
            "groq" => Ok(ProviderType::Groq),
            "deepgram" => Ok(ProviderType::Deepgram),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}
