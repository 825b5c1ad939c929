//! One-shot HTTP transcription over accumulated audio.
//!
//! OpenAI and Groq share the Whisper multipart endpoint shape; Deepgram
//! takes the raw WAV body with query-string options. All three map one
//! response to at most one final chunk.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::multipart;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::error::SttError;
use crate::provider::SttProvider;
use crate::types::{AudioFrame, ProviderType, TranscriptionChunk, SAMPLE_RATE_HZ};

/// ~1 second of 16 kHz mono audio. Anything shorter yields an empty
/// result instead of a request the backend would reject.
pub const MIN_BATCH_SAMPLES: usize = 16_000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct BatchProvider {
    provider: ProviderType,
    client: reqwest::Client,
}

impl BatchProvider {
    pub fn new(provider: ProviderType) -> Self {
        Self {
            provider,
            client: reqwest::Client::new(),
        }
    }

    /// Whisper-compatible endpoints (OpenAI, Groq): multipart form with
    /// the WAV as a file part and config fields as text parts.
    async fn request_whisper(
        &self,
        wav: Vec<u8>,
        config: &ProviderConfig,
    ) -> Result<String, SttError> {
        let part = multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let mut form = multipart::Form::new()
            .part("file", part)
            .text("model", config.model.clone())
            .text("response_format", "json");
        if let Some(prompt) = &config.prompt {
            form = form.text("prompt", prompt.clone());
        }
        if let Some(language) = &config.language {
            form = form.text("language", language.clone());
        }
        if let Some(temperature) = config.temperature {
            form = form.text("temperature", temperature.to_string());
        }

        let response = self
            .client
            .post(self.provider.batch_url())
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&config.api_key)
            .multipart(form)
            .send()
            .await?;
        let response = check_status(self.provider, response).await?;
        let parsed: WhisperResponse = response.json().await?;
        Ok(parsed.text)
    }

    /// Deepgram: raw WAV body, options in the query string, `Token`
    /// auth scheme.
    async fn request_deepgram(
        &self,
        wav: Vec<u8>,
        config: &ProviderConfig,
    ) -> Result<String, SttError> {
        let mut request = self
            .client
            .post(self.provider.batch_url())
            .timeout(REQUEST_TIMEOUT)
            .header(AUTHORIZATION, format!("Token {}", config.api_key))
            .header(CONTENT_TYPE, "audio/wav")
            .query(&[("model", config.model.as_str())]);
        if let Some(language) = &config.language {
            request = request.query(&[("language", language.as_str())]);
        }
        for keyword in &config.keywords {
            request = request.query(&[("keywords", keyword.as_str())]);
        }

        let response = request.body(wav).send().await?;
        let response = check_status(self.provider, response).await?;
        let parsed: DeepgramResponse = response.json().await?;
        Ok(parsed
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|channel| channel.alternatives.into_iter().next())
            .map(|alt| alt.transcript)
            .unwrap_or_default())
    }
}

#[async_trait]
impl SttProvider for BatchProvider {
    fn provider_type(&self) -> ProviderType {
        self.provider
    }

    async fn transcribe(
        &self,
        mut audio: mpsc::Receiver<AudioFrame>,
        chunks: mpsc::Sender<TranscriptionChunk>,
        config: &ProviderConfig,
    ) -> Result<(), SttError> {
        let mut samples: Vec<i16> = Vec::new();
        while let Some(frame) = audio.recv().await {
            samples.extend_from_slice(&frame.samples);
        }

        if samples.len() < MIN_BATCH_SAMPLES {
            info!(
                target: "stt",
                provider = %self.provider,
                samples = samples.len(),
                "below batch threshold, yielding empty result"
            );
            return Ok(());
        }

        debug!(
            target: "stt",
            provider = %self.provider,
            samples = samples.len(),
            "submitting batch transcription request"
        );
        let wav = encode_wav(&samples)?;
        let text = match self.provider {
            ProviderType::Deepgram => self.request_deepgram(wav, config).await?,
            _ => self.request_whisper(wav, config).await?,
        };

        if !text.trim().is_empty() {
            let _ = chunks.send(TranscriptionChunk::final_result(text)).await;
        }
        Ok(())
    }
}

async fn check_status(
    provider: ProviderType,
    response: reqwest::Response,
) -> Result<reqwest::Response, SttError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(target: "stt", provider = %provider, %status, "batch request rejected");
    Err(SttError::Transcription {
        message: format!("{provider} returned {status}: {}", snippet(&body)),
        retryable: SttError::status_is_retryable(status.as_u16()),
    })
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// 16 kHz mono S16LE WAV, encoded in memory.
fn encode_wav(samples: &[i16]) -> Result<Vec<u8>, SttError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE_HZ,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(wav_error)?;
    for &sample in samples {
        writer.write_sample(sample).map_err(wav_error)?;
    }
    writer.finalize().map_err(wav_error)?;
    Ok(cursor.into_inner())
}

fn wav_error(err: hound::Error) -> SttError {
    SttError::Transcription {
        message: format!("wav encoding failed: {err}"),
        retryable: false,
    }
}

#[derive(Debug, Deserialize)]
struct WhisperResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(Debug, Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::types::FRAME_SAMPLES;

    fn frame_of(samples: usize) -> AudioFrame {
        AudioFrame {
            samples: Arc::from(vec![100i16; samples]),
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn sub_threshold_audio_yields_empty_result() {
        let provider = BatchProvider::new(ProviderType::OpenAi);
        let config = ProviderConfig::new("sk-test", "whisper-1");
        let (audio_tx, audio_rx) = mpsc::channel(8);
        let (chunk_tx, mut chunk_rx) = mpsc::channel(8);

        // Two frames = 3,200 samples, well under the one-second floor.
        audio_tx.send(frame_of(FRAME_SAMPLES)).await.unwrap();
        audio_tx.send(frame_of(FRAME_SAMPLES)).await.unwrap();
        drop(audio_tx);

        provider
            .transcribe(audio_rx, chunk_tx, &config)
            .await
            .unwrap();
        assert!(chunk_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_audio_at_all_is_not_an_error() {
        let provider = BatchProvider::new(ProviderType::Groq);
        let config = ProviderConfig::new("gsk-test", "whisper-large-v3");
        let (audio_tx, audio_rx) = mpsc::channel::<AudioFrame>(1);
        let (chunk_tx, mut chunk_rx) = mpsc::channel(1);
        drop(audio_tx);

        provider
            .transcribe(audio_rx, chunk_tx, &config)
            .await
            .unwrap();
        assert!(chunk_rx.try_recv().is_err());
    }

    #[test]
    fn wav_header_is_pcm16_mono_16k() {
        let samples = vec![0i16; MIN_BATCH_SAMPLES];
        let wav = encode_wav(&samples).unwrap();

        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // 44-byte canonical header followed by two bytes per sample.
        assert_eq!(wav.len(), 44 + samples.len() * 2);
        let sample_rate = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        assert_eq!(sample_rate, SAMPLE_RATE_HZ);
        let channels = u16::from_le_bytes([wav[22], wav[23]]);
        assert_eq!(channels, 1);
        let data_len = u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]);
        assert_eq!(data_len as usize, samples.len() * 2);
    }

    #[test]
    fn parses_whisper_response() {
        let parsed: WhisperResponse =
            serde_json::from_str(r#"{"text": "Hello world."}"#).unwrap();
        assert_eq!(parsed.text, "Hello world.");
    }

    #[test]
    fn parses_deepgram_response() {
        let raw = r#"{
            "metadata": {"request_id": "abc"},
            "results": {
                "channels": [
                    {"alternatives": [
                        {"transcript": "Hello world.", "confidence": 0.99}
                    ]}
                ]
            }
        }"#;
        let parsed: DeepgramResponse = serde_json::from_str(raw).unwrap();
        let transcript = parsed
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next())
            .map(|a| a.transcript)
            .unwrap_or_default();
        assert_eq!(transcript, "Hello world.");
    }

    #[test]
    fn empty_deepgram_channels_map_to_empty_transcript() {
        let parsed: DeepgramResponse =
            serde_json::from_str(r#"{"results": {"channels": []}}"#).unwrap();
        let transcript = parsed
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next())
            .map(|a| a.transcript)
            .unwrap_or_default();
        assert_eq!(transcript, "");
    }
}
