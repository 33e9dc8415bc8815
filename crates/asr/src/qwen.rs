//! Qwen realtime transcription (DashScope realtime endpoint)
//!
//! OpenAI-realtime-shaped protocol: JSON control events over a websocket,
//! audio as base64 `input_audio_buffer.append` frames. Server-side VAD is
//! enabled so sustained silence produces a `completed` transcription event,
//! which the pipeline treats as a segment final and reconnects around.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;
use vhisper_core::TranscriptAccumulator;

use crate::traits::{RecognizerEvent, Session, SessionControl, StreamingRecognizer, CHANNEL_CAPACITY};
use crate::AsrError;

/// Qwen realtime recognizer
pub struct QwenRecognizer {
    api_key: String,
    model: String,
    language: String,
}

impl QwenRecognizer {
    pub fn new(api_key: String, model: String, language: String) -> Self {
        Self {
            api_key,
            model,
            language,
        }
    }
}

fn event_id() -> String {
    format!("event_{}", &Uuid::new_v4().simple().to_string()[..20])
}

#[derive(Serialize)]
struct SessionUpdateEvent {
    event_id: String,
    #[serde(rename = "type")]
    event_type: String,
    session: SessionConfig,
}

#[derive(Serialize)]
struct SessionConfig {
    modalities: Vec<String>,
    input_audio_format: String,
    sample_rate: u32,
    input_audio_transcription: TranscriptionConfig,
    turn_detection: Option<TurnDetection>,
}

#[derive(Serialize)]
struct TranscriptionConfig {
    language: String,
}

#[derive(Serialize)]
struct TurnDetection {
    #[serde(rename = "type")]
    detection_type: String,
    threshold: f32,
    silence_duration_ms: u32,
}

#[derive(Serialize)]
struct AudioAppendEvent {
    event_id: String,
    #[serde(rename = "type")]
    event_type: String,
    /// base64 encoded PCM
    audio: String,
}

#[derive(Serialize)]
struct AudioCommitEvent {
    event_id: String,
    #[serde(rename = "type")]
    event_type: String,
}

#[derive(Deserialize, Debug)]
struct ResponseEvent {
    #[serde(rename = "type")]
    event_type: String,
    transcript: Option<String>,
    error: Option<ErrorInfo>,
}

#[derive(Deserialize, Debug)]
struct ErrorInfo {
    message: String,
}

#[async_trait]
impl StreamingRecognizer for QwenRecognizer {
    async fn connect(&self) -> Result<Session, AsrError> {
        let url = format!(
            "wss://dashscope.aliyuncs.com/api-ws/v1/realtime?model={}",
            self.model
        );

        let request = http::Request::builder()
            .uri(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("OpenAI-Beta", "realtime=v1")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("Sec-WebSocket-Version", "13")
            .header("Host", "dashscope.aliyuncs.com")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .map_err(|e| AsrError::Network(e.to_string()))?;

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| AsrError::Network(format!("websocket connect failed: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        let session_update = SessionUpdateEvent {
            event_id: event_id(),
            event_type: "session.update".to_string(),
            session: SessionConfig {
                modalities: vec!["text".to_string()],
                input_audio_format: "pcm".to_string(),
                sample_rate: 16_000,
                input_audio_transcription: TranscriptionConfig {
                    language: self.language.clone(),
                },
                // Server VAD on: long held-key utterances get segment finals
                turn_detection: Some(TurnDetection {
                    detection_type: "server_vad".to_string(),
                    threshold: 0.5,
                    silence_duration_ms: 800,
                }),
            },
        };
        let payload = serde_json::to_string(&session_update)
            .map_err(|e| AsrError::Encoding(e.to_string()))?;
        write
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| AsrError::Network(e.to_string()))?;

        // Handshake: the server must acknowledge the session before audio
        loop {
            let msg = read
                .next()
                .await
                .ok_or_else(|| AsrError::Network("connection closed during handshake".into()))?;
            match msg {
                Ok(Message::Text(text)) => {
                    let response: ResponseEvent = serde_json::from_str(&text)
                        .map_err(|e| AsrError::Protocol(format!("bad handshake frame: {e}")))?;
                    if let Some(error) = response.error {
                        return Err(classify_server_error(error.message));
                    }
                    if response.event_type == "session.created"
                        || response.event_type == "session.updated"
                    {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    return Err(AsrError::Network("connection closed during handshake".into()));
                }
                Err(e) => return Err(AsrError::Network(e.to_string())),
                _ => {}
            }
        }

        let (control_tx, mut control_rx) = mpsc::channel::<SessionControl>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<RecognizerEvent>(CHANNEL_CAPACITY);
        let session_id = Uuid::new_v4().simple().to_string();
        let worker_id = session_id.clone();

        tokio::spawn(async move {
            let mut transcript = TranscriptAccumulator::new();
            loop {
                tokio::select! {
                    cmd = control_rx.recv() => match cmd {
                        Some(SessionControl::Audio(pcm)) => {
                            let append = AudioAppendEvent {
                                event_id: event_id(),
                                event_type: "input_audio_buffer.append".to_string(),
                                audio: BASE64.encode(&pcm),
                            };
                            let Ok(payload) = serde_json::to_string(&append) else { continue };
                            if write.send(Message::Text(payload.into())).await.is_err() {
                                let _ = event_tx
                                    .send(RecognizerEvent::Error {
                                        message: "audio send failed".into(),
                                    })
                                    .await;
                                break;
                            }
                        }
                        Some(SessionControl::Eos) => {
                            let commit = AudioCommitEvent {
                                event_id: event_id(),
                                event_type: "input_audio_buffer.commit".to_string(),
                            };
                            if let Ok(payload) = serde_json::to_string(&commit) {
                                let _ = write.send(Message::Text(payload.into())).await;
                            }
                        }
                        Some(SessionControl::Cancel) | None => break,
                    },
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            let Ok(response) = serde_json::from_str::<ResponseEvent>(&text) else {
                                tracing::debug!(session = %worker_id, "ignoring unparseable frame");
                                continue;
                            };
                            if let Some(error) = response.error {
                                let _ = event_tx
                                    .send(RecognizerEvent::Error { message: error.message })
                                    .await;
                                break;
                            }
                            match response.event_type.as_str() {
                                "conversation.item.input_audio_transcription.text" => {
                                    if let Some(stash) = response.transcript {
                                        transcript.set_stash(stash);
                                        let (confirmed, stash) = transcript.snapshot();
                                        if event_tx
                                            .send(RecognizerEvent::Partial { confirmed, stash })
                                            .await
                                            .is_err()
                                        {
                                            break;
                                        }
                                    }
                                }
                                "conversation.item.input_audio_transcription.completed" => {
                                    let text = response
                                        .transcript
                                        .unwrap_or_else(|| transcript.finalize());
                                    let _ = event_tx.send(RecognizerEvent::Final { text }).await;
                                    break;
                                }
                                // Heartbeats and non-transcription frames
                                _ => {}
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            let _ = event_tx
                                .send(RecognizerEvent::Error { message: e.to_string() })
                                .await;
                            break;
                        }
                        Some(Ok(_)) => {}
                    },
                }
            }
            let _ = write.send(Message::Close(None)).await;
            tracing::debug!(session = %worker_id, "qwen session worker finished");
        });

        Ok(Session::new(session_id, control_tx, event_rx))
    }
}

fn classify_server_error(message: String) -> AsrError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("auth") || lower.contains("api key") || lower.contains("401") {
        AsrError::Auth(message)
    } else {
        AsrError::Protocol(message)
    }
}

/// Check whether an API key is accepted by DashScope.
pub async fn probe(api_key: &str) -> Result<String, AsrError> {
    let client = reqwest::Client::new();
    let response = client
        .get("https://dashscope.aliyuncs.com/api/v1/models")
        .header("Authorization", format!("Bearer {api_key}"))
        .send()
        .await
        .map_err(|e| AsrError::Network(e.to_string()))?;

    if response.status().is_success() {
        Ok("API key accepted".to_string())
    } else {
        Err(AsrError::Auth(format!(
            "API key rejected: HTTP {}",
            response.status()
        )))
    }
}
