//! JSON frame types for the realtime transcription socket.
//!
//! Client events are internally tagged on `type` with the dotted names
//! the backend expects. Server events the session does not recognize
//! deserialize to [`ServerEvent::Unknown`] and are ignored rather than
//! treated as protocol errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ProviderConfig;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdate },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
    /// Sent defensively before commit; this pipeline wants
    /// transcription only, never a generated response.
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

/// Session configuration envelope for `session.update`.
///
/// `turn_detection` is always serialized, as literal `null` when unset:
/// omitting the field would leave the backend's server-side VAD enabled.
#[derive(Debug, Clone, Serialize)]
pub struct SessionUpdate {
    pub input_audio_format: String,
    pub input_audio_transcription: TranscriptionSettings,
    pub turn_detection: Option<Value>,
    pub input_audio_noise_reduction: NoiseReduction,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionSettings {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NoiseReduction {
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionUpdate {
    /// Transcription-only session: PCM16 input, near-field noise
    /// reduction, turn detection disabled.
    pub fn transcription_only(config: &ProviderConfig) -> Self {
        Self {
            input_audio_format: "pcm16".to_string(),
            input_audio_transcription: TranscriptionSettings {
                model: config.model.clone(),
                prompt: config.prompt.clone(),
                language: config.language.clone(),
            },
            turn_detection: None,
            input_audio_noise_reduction: NoiseReduction {
                kind: "near_field".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted,
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta {
        #[serde(default)]
        event_id: Option<String>,
        item_id: String,
        #[serde(default)]
        content_index: Option<u32>,
        delta: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        event_id: Option<String>,
        item_id: String,
        #[serde(default)]
        content_index: Option<u32>,
        transcript: String,
    },
    #[serde(rename = "error")]
    Error { error: ErrorDetail },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub param: Option<String>,
}

impl ErrorDetail {
    /// Rate limits and backend-side failures are transient; everything
    /// else (auth, malformed request) is not.
    pub fn is_retryable(&self) -> bool {
        if let Some(code) = &self.code {
            if code.contains("rate_limit") {
                return true;
            }
        }
        self.kind == "server_error"
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code {code})")?;
        }
        Ok(())
    }
}
