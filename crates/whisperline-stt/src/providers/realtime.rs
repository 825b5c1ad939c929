//! Socket-backed streaming transcription.
//!
//! One recording maps to one connection: configure the session, wait
//! for the backend acknowledgment, stream PCM16 appends, then commit
//! and collect the final transcript. A recoverable drop mid-stream is
//! retried once with a replacement session; audio buffered between the
//! drop and the replacement is lost, already-final text is not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::error::SttError;
use crate::provider::SttProvider;
use crate::session::{EventOutcome, RealtimeSession, DEFAULT_CONFIRMATION_TIMEOUT};
use crate::types::{AudioFrame, ProviderType, TranscriptionChunk};
use crate::wire::{ClientEvent, ServerEvent, SessionUpdate};

/// How long to keep listening for the final transcript after commit.
const COMMIT_GRACE: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub struct RealtimeProvider {
    provider: ProviderType,
    endpoint: Option<String>,
}

impl RealtimeProvider {
    pub fn new(provider: ProviderType) -> Self {
        Self {
            provider,
            endpoint: None,
        }
    }

    /// Point the session at a non-default gateway, e.g. a compatible
    /// proxy.
    pub fn with_endpoint(provider: ProviderType, endpoint: impl Into<String>) -> Self {
        Self {
            provider,
            endpoint: Some(endpoint.into()),
        }
    }

    fn endpoint(&self, config: &ProviderConfig) -> Result<String, SttError> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.clone());
        }
        self.provider
            .realtime_url()
            .map(str::to_string)
            .ok_or_else(|| SttError::InvalidModel {
                model: config.model.clone(),
            })
    }

    async fn connect(&self, config: &ProviderConfig) -> Result<(WsSink, WsStream), SttError> {
        let endpoint = self.endpoint(config)?;
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| SttError::Socket(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|_| SttError::InvalidApiKey)?;
        request.headers_mut().insert(AUTHORIZATION, auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws, _response) = connect_async(request).await.map_err(socket_error)?;
        debug!(target: "stt", provider = %self.provider, "realtime socket connected");
        Ok(ws.split())
    }

    /// Drive one session over one connection from handshake to final
    /// transcript.
    async fn run_session(
        &self,
        audio: &mut mpsc::Receiver<AudioFrame>,
        chunks: &mpsc::Sender<TranscriptionChunk>,
        config: &ProviderConfig,
    ) -> Result<(), SttError> {
        let (mut sink, stream) = self.connect(config).await?;
        let session = Arc::new(RealtimeSession::new());
        let committed = Arc::new(AtomicBool::new(false));
        let mut reader = tokio::spawn(reader_loop(
            stream,
            session.clone(),
            chunks.clone(),
            committed.clone(),
        ));

        let update = ClientEvent::SessionUpdate {
            session: SessionUpdate::transcription_only(config),
        };
        if let Err(err) = send_event(&mut sink, &update).await {
            session.cleanup();
            reader.abort();
            return Err(err);
        }

        tokio::select! {
            result = session.await_confirmation(DEFAULT_CONFIRMATION_TIMEOUT) => {
                if let Err(err) = result {
                    session.cleanup();
                    reader.abort();
                    return Err(err);
                }
            }
            result = &mut reader => {
                session.cleanup();
                return Err(finish_reader(result));
            }
        }

        // Forward audio until the upstream channel closes.
        let mut sent_any = false;
        let forward: Result<(), SttError> = loop {
            tokio::select! {
                frame = audio.recv() => match frame {
                    Some(frame) => {
                        if !sent_any {
                            session.mark_streaming();
                            sent_any = true;
                        }
                        let payload = BASE64.encode(pcm16_bytes(&frame.samples));
                        let append = ClientEvent::InputAudioBufferAppend { audio: payload };
                        if let Err(err) = send_event(&mut sink, &append).await {
                            break Err(err);
                        }
                    }
                    None => break Ok(()),
                },
                result = &mut reader => {
                    session.cleanup();
                    return Err(finish_reader(result));
                }
            }
        };
        if let Err(err) = forward {
            session.cleanup();
            reader.abort();
            return Err(err);
        }

        if !sent_any {
            // Committing an empty buffer is a protocol error; there is
            // nothing to transcribe anyway.
            debug!(target: "stt", session_id = session.id(), "no audio sent, skipping commit");
            let _ = sink.send(Message::Close(None)).await;
            session.cleanup();
            reader.abort();
            return Ok(());
        }

        let commit = async {
            send_event(&mut sink, &ClientEvent::ResponseCancel).await?;
            send_event(&mut sink, &ClientEvent::InputAudioBufferCommit).await
        }
        .await;
        if let Err(err) = commit {
            session.cleanup();
            reader.abort();
            return Err(err);
        }
        committed.store(true, Ordering::SeqCst);
        info!(target: "stt", session_id = session.id(), "audio committed, awaiting final transcript");

        let result = match tokio::time::timeout(COMMIT_GRACE, &mut reader).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(join)) => Err(SttError::Transcription {
                message: format!("receive loop panicked: {join}"),
                retryable: false,
            }),
            Err(_) => {
                warn!(
                    target: "stt",
                    session_id = session.id(),
                    "no final transcript within grace period"
                );
                reader.abort();
                Ok(())
            }
        };

        let _ = sink.send(Message::Close(None)).await;
        session.cleanup();
        result
    }
}

#[async_trait]
impl SttProvider for RealtimeProvider {
    fn provider_type(&self) -> ProviderType {
        self.provider
    }

    async fn transcribe(
        &self,
        mut audio: mpsc::Receiver<AudioFrame>,
        chunks: mpsc::Sender<TranscriptionChunk>,
        config: &ProviderConfig,
    ) -> Result<(), SttError> {
        match self.run_session(&mut audio, &chunks, config).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() => {
                warn!(
                    target: "stt",
                    error = %err,
                    "realtime session dropped, reconnecting with a replacement session"
                );
                self.run_session(&mut audio, &chunks, config).await
            }
            Err(err) => Err(err),
        }
    }
}

/// Pull server frames, feed them through the session state machine, and
/// forward resulting chunks. Returns once the post-commit final lands,
/// the server closes, or the session fails.
async fn reader_loop(
    mut stream: WsStream,
    session: Arc<RealtimeSession>,
    chunks: mpsc::Sender<TranscriptionChunk>,
    committed: Arc<AtomicBool>,
) -> Result<(), SttError> {
    while let Some(message) = stream.next().await {
        let message = message.map_err(socket_error)?;
        match message {
            Message::Text(text) => {
                let event: ServerEvent = match serde_json::from_str(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(
                            target: "stt",
                            session_id = session.id(),
                            error = %e,
                            "unparseable server frame, skipping"
                        );
                        continue;
                    }
                };
                match session.handle_event(event) {
                    EventOutcome::None => {}
                    EventOutcome::Chunk(chunk) => {
                        let is_final = chunk.is_final;
                        if chunks.send(chunk).await.is_err() {
                            // Downstream hung up; nothing left to do.
                            return Ok(());
                        }
                        if is_final && committed.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                    }
                    EventOutcome::Failed(err) => return Err(err),
                }
            }
            Message::Close(_) => {
                return if committed.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(SttError::Socket("connection closed by server".to_string()))
                };
            }
            // Pings are answered by the protocol layer; binary frames
            // are not part of this protocol.
            _ => {}
        }
    }
    if committed.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(SttError::Socket("connection ended unexpectedly".to_string()))
    }
}

async fn send_event(sink: &mut WsSink, event: &ClientEvent) -> Result<(), SttError> {
    let json = serde_json::to_string(event).map_err(|e| SttError::Transcription {
        message: format!("event serialization failed: {e}"),
        retryable: false,
    })?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(socket_error)
}

fn finish_reader(result: Result<Result<(), SttError>, tokio::task::JoinError>) -> SttError {
    match result {
        Ok(Ok(())) => SttError::Socket("connection ended before audio finished".to_string()),
        Ok(Err(err)) => err,
        Err(join) => SttError::Transcription {
            message: format!("receive loop panicked: {join}"),
            retryable: false,
        },
    }
}

fn socket_error(err: tokio_tungstenite::tungstenite::Error) -> SttError {
    use tokio_tungstenite::tungstenite::Error;
    match &err {
        // A rejected handshake is an auth/config problem, not a
        // transient network condition.
        Error::Http(response)
            if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
        {
            SttError::Transcription {
                message: format!("realtime handshake rejected: {}", response.status()),
                retryable: false,
            }
        }
        _ => SttError::Socket(err.to_string()),
    }
}

fn pcm16_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_bytes_are_little_endian() {
        let bytes = pcm16_bytes(&[0x0102, -2]);
        assert_eq!(bytes, vec![0x02, 0x01, 0xFE, 0xFF]);
    }

    #[test]
    fn handshake_rejection_is_not_retryable() {
        let response = tokio_tungstenite::tungstenite::http::Response::builder()
            .status(401)
            .body(None)
            .unwrap();
        let err = socket_error(tokio_tungstenite::tungstenite::Error::Http(response));
        assert!(!err.is_retryable());
    }

    #[test]
    fn dropped_connection_is_retryable() {
        let err = socket_error(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
        assert!(matches!(err, SttError::Socket(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn default_endpoint_requires_realtime_support() {
        let provider = RealtimeProvider::new(ProviderType::Groq);
        let config = ProviderConfig::new("gsk-test", "whisper-large-v3");
        assert!(matches!(
            provider.endpoint(&config),
            Err(SttError::InvalidModel { .. })
        ));

        let provider = RealtimeProvider::new(ProviderType::OpenAi);
        let config = ProviderConfig::new("sk-test", "gpt-4o-transcribe");
        assert!(provider.endpoint(&config).unwrap().starts_with("wss://"));
    }
}
