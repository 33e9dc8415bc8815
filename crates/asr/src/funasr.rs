//! Self-hosted FunASR two-pass recognition
//!
//! FunASR's websocket protocol: a JSON start frame describing the chunking,
//! binary PCM frames, and a `{"is_speaking": false}` frame for EOS. In
//! `2pass` mode the server streams incremental `2pass-online` hypotheses and
//! rewrites each segment with a `2pass-offline` pass once it detects the end
//! of speech. Deployments default to SSL with self-signed certificates, so
//! the TLS connector accepts them.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use vhisper_core::TranscriptAccumulator;

use crate::traits::{RecognizerEvent, Session, SessionControl, StreamingRecognizer, CHANNEL_CAPACITY};
use crate::AsrError;

/// FunASR streaming recognizer
pub struct FunAsrRecognizer {
    endpoint: String,
}

impl FunAsrRecognizer {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint: to_wss(&endpoint),
        }
    }
}

// FunASR serves wss even behind http-looking endpoints
fn to_wss(endpoint: &str) -> String {
    endpoint
        .replace("http://", "wss://")
        .replace("https://", "wss://")
        .replace("ws://", "wss://")
}

fn tls_connector() -> Result<tokio_tungstenite::Connector, AsrError> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| AsrError::Network(format!("TLS setup failed: {e}")))?;
    Ok(tokio_tungstenite::Connector::NativeTls(connector))
}

#[derive(Serialize)]
struct StartFrame {
    chunk_size: Vec<i32>,
    chunk_interval: i32,
    wav_name: String,
    wav_format: String,
    audio_fs: u32,
    mode: String,
    itn: bool,
    is_speaking: bool,
}

#[derive(Serialize)]
struct EndFrame {
    is_speaking: bool,
}

#[derive(Deserialize, Debug)]
struct ResultFrame {
    text: Option<String>,
    #[serde(default)]
    is_final: bool,
    mode: Option<String>,
}

#[async_trait]
impl StreamingRecognizer for FunAsrRecognizer {
    async fn connect(&self) -> Result<Session, AsrError> {
        let connector = tls_connector()?;
        let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(
            &self.endpoint,
            None,
            false,
            Some(connector),
        )
        .await
        .map_err(|e| AsrError::Network(format!("websocket connect failed: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        let start = StartFrame {
            chunk_size: vec![5, 10, 5],
            chunk_interval: 10,
            wav_name: "vhisper".to_string(),
            wav_format: "pcm".to_string(),
            audio_fs: 16_000,
            mode: "2pass".to_string(),
            itn: true,
            is_speaking: true,
        };
        let payload =
            serde_json::to_string(&start).map_err(|e| AsrError::Encoding(e.to_string()))?;
        write
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| AsrError::Network(e.to_string()))?;

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
                            if write.send(Message::Binary(pcm.into())).await.is_err() {
                                let _ = event_tx
                                    .send(RecognizerEvent::Error {
                                        message: "audio send failed".into(),
                                    })
                                    .await;
                                break;
                            }
                        }
                        Some(SessionControl::Eos) => {
                            if let Ok(payload) =
                                serde_json::to_string(&EndFrame { is_speaking: false })
                            {
                                let _ = write.send(Message::Text(payload.into())).await;
                            }
                        }
                        Some(SessionControl::Cancel) | None => break,
                    },
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            let Ok(frame) = serde_json::from_str::<ResultFrame>(&text) else {
                                continue;
                            };
                            if let Some(text) = frame.text {
                                match frame.mode.as_deref() {
                                    Some("2pass-offline") | Some("offline") => {
                                        transcript.commit(&text);
                                    }
                                    _ => transcript.set_stash(text),
                                }
                            }
                            if frame.is_final {
                                let _ = event_tx
                                    .send(RecognizerEvent::Final {
                                        text: transcript.finalize(),
                                    })
                                    .await;
                                break;
                            }
                            let (confirmed, stash) = transcript.snapshot();
                            if event_tx
                                .send(RecognizerEvent::Partial { confirmed, stash })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            // Server closed without a terminal frame; whatever
                            // accumulated is still the best final we have
                            if !transcript.is_empty() {
                                let _ = event_tx
                                    .send(RecognizerEvent::Final {
                                        text: transcript.finalize(),
                                    })
                                    .await;
                            }
                            break;
                        }
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
            tracing::debug!(session = %worker_id, "funasr session worker finished");
        });

        Ok(Session::new(session_id, control_tx, event_rx))
    }
}

/// Check that a FunASR deployment is reachable.
pub async fn probe(endpoint: &str) -> Result<String, AsrError> {
    let endpoint = to_wss(endpoint);
    let connector = tls_connector()?;
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        tokio_tungstenite::connect_async_tls_with_config(&endpoint, None, false, Some(connector)),
    )
    .await;

    match result {
        Ok(Ok(_)) => Ok("FunASR endpoint reachable".to_string()),
        Ok(Err(e)) => Err(AsrError::Network(format!("websocket connect failed: {e}"))),
        Err(_) => Err(AsrError::Timeout("connect timed out".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalization() {
        assert_eq!(to_wss("http://localhost:10096"), "wss://localhost:10096");
        assert_eq!(to_wss("https://funasr.lan"), "wss://funasr.lan");
        assert_eq!(to_wss("ws://funasr.lan"), "wss://funasr.lan");
    }

    #[test]
    fn test_result_frame_parsing() {
        let frame: ResultFrame =
            serde_json::from_str(r#"{ "text": "hello", "mode": "2pass-online" }"#).unwrap();
        assert_eq!(frame.text.as_deref(), Some("hello"));
        assert!(!frame.is_final);

        let frame: ResultFrame =
            serde_json::from_str(r#"{ "text": "done", "is_final": true, "mode": "2pass-offline" }"#)
                .unwrap();
        assert!(frame.is_final);
        assert_eq!(frame.mode.as_deref(), Some("2pass-offline"));
    }
}
