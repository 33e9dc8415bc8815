//! DashScope Paraformer streaming recognition
//!
//! Task-oriented protocol on the DashScope inference websocket: a `run-task`
//! action opens the duplex stream, binary frames carry raw PCM, sentences
//! arrive in `result-generated` events with a `sentence_end` marker that
//! promotes them from stash to confirmed text.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;
use vhisper_core::TranscriptAccumulator;

use crate::traits::{RecognizerEvent, Session, SessionControl, StreamingRecognizer, CHANNEL_CAPACITY};
use crate::AsrError;

const INFERENCE_URL: &str = "wss://dashscope.aliyuncs.com/api-ws/v1/inference";

/// Paraformer streaming recognizer
pub struct ParaformerRecognizer {
    api_key: String,
    model: String,
}

impl ParaformerRecognizer {
    pub fn new(api_key: String, model: String) -> Self {
        Self { api_key, model }
    }
}

#[derive(Serialize)]
struct WsRequest {
    header: WsHeader,
    payload: WsPayload,
}

#[derive(Serialize)]
struct WsHeader {
    action: String,
    task_id: String,
    streaming: String,
}

#[derive(Serialize)]
struct WsPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    task_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<WsParameters>,
    input: serde_json::Value,
}

#[derive(Serialize)]
struct WsParameters {
    format: String,
    sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    language_hints: Option<Vec<String>>,
}

#[derive(Deserialize, Debug)]
struct WsResponse {
    header: WsResponseHeader,
    payload: Option<WsResponsePayload>,
}

#[derive(Deserialize, Debug)]
struct WsResponseHeader {
    event: String,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WsResponsePayload {
    output: Option<WsOutput>,
}

#[derive(Deserialize, Debug)]
struct WsOutput {
    sentence: Option<WsSentence>,
}

#[derive(Deserialize, Debug)]
struct WsSentence {
    text: Option<String>,
    #[serde(default)]
    sentence_end: bool,
}

fn finish_task_request(task_id: &str) -> WsRequest {
    WsRequest {
        header: WsHeader {
            action: "finish-task".to_string(),
            task_id: task_id.to_string(),
            streaming: "duplex".to_string(),
        },
        payload: WsPayload {
            task_group: None,
            task: None,
            function: None,
            model: None,
            parameters: None,
            input: serde_json::json!({}),
        },
    }
}

#[async_trait]
impl StreamingRecognizer for ParaformerRecognizer {
    async fn connect(&self) -> Result<Session, AsrError> {
        let task_id = Uuid::new_v4().simple().to_string();

        let request = http::Request::builder()
            .uri(INFERENCE_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
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

        let run_task = WsRequest {
            header: WsHeader {
                action: "run-task".to_string(),
                task_id: task_id.clone(),
                streaming: "duplex".to_string(),
            },
            payload: WsPayload {
                task_group: Some("audio".to_string()),
                task: Some("asr".to_string()),
                function: Some("recognition".to_string()),
                model: Some(self.model.clone()),
                parameters: Some(WsParameters {
                    format: "pcm".to_string(),
                    sample_rate: 16_000,
                    language_hints: Some(vec!["zh".to_string(), "en".to_string()]),
                }),
                input: serde_json::json!({}),
            },
        };
        let payload =
            serde_json::to_string(&run_task).map_err(|e| AsrError::Encoding(e.to_string()))?;
        write
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| AsrError::Network(e.to_string()))?;

        // Audio may only flow after task-started
        loop {
            let msg = read
                .next()
                .await
                .ok_or_else(|| AsrError::Network("connection closed during handshake".into()))?;
            match msg {
                Ok(Message::Text(text)) => {
                    let response: WsResponse = serde_json::from_str(&text)
                        .map_err(|e| AsrError::Protocol(format!("bad handshake frame: {e}")))?;
                    if let Some(code) = &response.header.error_code {
                        return Err(classify_task_error(
                            code,
                            response.header.error_message.unwrap_or_default(),
                        ));
                    }
                    if response.header.event == "task-started" {
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
        let worker_task_id = task_id.clone();

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
                                serde_json::to_string(&finish_task_request(&worker_task_id))
                            {
                                let _ = write.send(Message::Text(payload.into())).await;
                            }
                        }
                        Some(SessionControl::Cancel) | None => break,
                    },
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            let Ok(response) = serde_json::from_str::<WsResponse>(&text) else {
                                continue;
                            };
                            if let Some(code) = &response.header.error_code {
                                let message = format!(
                                    "{code}: {}",
                                    response.header.error_message.unwrap_or_default()
                                );
                                let _ = event_tx
                                    .send(RecognizerEvent::Error { message })
                                    .await;
                                break;
                            }
                            match response.header.event.as_str() {
                                "result-generated" => {
                                    let sentence = response
                                        .payload
                                        .and_then(|p| p.output)
                                        .and_then(|o| o.sentence);
                                    let Some(sentence) = sentence else { continue };
                                    let Some(text) = sentence.text else { continue };
                                    if sentence.sentence_end {
                                        transcript.commit(&text);
                                    } else {
                                        transcript.set_stash(text);
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
                                "task-finished" => {
                                    let _ = event_tx
                                        .send(RecognizerEvent::Final {
                                            text: transcript.finalize(),
                                        })
                                        .await;
                                    break;
                                }
                                "task-failed" => {
                                    let _ = event_tx
                                        .send(RecognizerEvent::Error {
                                            message: "task failed".into(),
                                        })
                                        .await;
                                    break;
                                }
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
            tracing::debug!(task = %worker_task_id, "paraformer session worker finished");
        });

        Ok(Session::new(task_id, control_tx, event_rx))
    }
}

fn classify_task_error(code: &str, message: String) -> AsrError {
    if code.eq_ignore_ascii_case("invalidapikey") || code.contains("401") {
        AsrError::Auth(format!("{code}: {message}"))
    } else {
        AsrError::Protocol(format!("{code}: {message}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentence_parsing() {
        let frame = r#"{
            "header": { "task_id": "t1", "event": "result-generated" },
            "payload": { "output": { "sentence": { "text": "你好", "sentence_end": false } } }
        }"#;
        let response: WsResponse = serde_json::from_str(frame).unwrap();
        assert_eq!(response.header.event, "result-generated");
        let sentence = response.payload.unwrap().output.unwrap().sentence.unwrap();
        assert_eq!(sentence.text.as_deref(), Some("你好"));
        assert!(!sentence.sentence_end);
    }

    #[test]
    fn test_error_header_parsing() {
        let frame = r#"{
            "header": {
                "task_id": "t1",
                "event": "task-failed",
                "error_code": "InvalidApiKey",
                "error_message": "key rejected"
            }
        }"#;
        let response: WsResponse = serde_json::from_str(frame).unwrap();
        let err = classify_task_error(
            response.header.error_code.as_deref().unwrap(),
            response.header.error_message.unwrap(),
        );
        assert!(matches!(err, AsrError::Auth(_)));
    }

    #[test]
    fn test_run_task_serialization() {
        let request = finish_task_request("abc");
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("finish-task"));
        // None payload fields must be omitted entirely
        assert!(!json.contains("task_group"));
    }
}
