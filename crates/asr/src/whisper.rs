//! OpenAI Whisper one-shot transcription
//!
//! Whisper has no streaming endpoint, so this session buffers the whole
//! utterance and uploads it as a WAV once EOS arrives. No partials are ever
//! emitted; the host sees a single final per session.

use std::io::Cursor;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;
use vhisper_core::audio::STREAM_SAMPLE_RATE;

use crate::traits::{RecognizerEvent, Session, SessionControl, StreamingRecognizer, CHANNEL_CAPACITY};
use crate::AsrError;

const TRANSCRIPTION_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Whisper one-shot recognizer
pub struct WhisperRecognizer {
    api_key: String,
    model: String,
    language: String,
}

impl WhisperRecognizer {
    pub fn new(api_key: String, model: String, language: String) -> Self {
        Self {
            api_key,
            model,
            language,
        }
    }
}

/// Wrap raw s16le PCM in a WAV container.
fn encode_wav(pcm: &[u8]) -> Result<Vec<u8>, AsrError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: STREAM_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| AsrError::Encoding(e.to_string()))?;
        for sample in pcm.chunks_exact(2) {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            writer
                .write_sample(value)
                .map_err(|e| AsrError::Encoding(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| AsrError::Encoding(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

async fn transcribe(
    client: &reqwest::Client,
    api_key: &str,
    model: &str,
    language: &str,
    wav: Vec<u8>,
) -> Result<String, AsrError> {
    let part = reqwest::multipart::Part::bytes(wav)
        .file_name("utterance.wav")
        .mime_str("audio/wav")
        .map_err(|e| AsrError::Encoding(e.to_string()))?;
    let form = reqwest::multipart::Form::new()
        .part("file", part)
        .text("model", model.to_string())
        .text("language", language.to_string());

    let response = client
        .post(TRANSCRIPTION_URL)
        .bearer_auth(api_key)
        .multipart(form)
        .send()
        .await
        .map_err(|e| AsrError::Network(e.to_string()))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| AsrError::Network(e.to_string()))?;

    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(AsrError::Auth(format!("HTTP 401: {body}")));
    }
    if !status.is_success() {
        return Err(AsrError::Protocol(format!("HTTP {status}: {body}")));
    }

    #[derive(serde::Deserialize)]
    struct TranscriptionResponse {
        text: String,
    }
    let parsed: TranscriptionResponse =
        serde_json::from_str(&body).map_err(|e| AsrError::Protocol(e.to_string()))?;
    Ok(parsed.text)
}

#[async_trait]
impl StreamingRecognizer for WhisperRecognizer {
    async fn connect(&self) -> Result<Session, AsrError> {
        let (control_tx, mut control_rx) = mpsc::channel::<SessionControl>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<RecognizerEvent>(CHANNEL_CAPACITY);
        let session_id = Uuid::new_v4().simple().to_string();

        let client = reqwest::Client::new();
        let api_key = self.api_key.clone();
        let model = self.model.clone();
        let language = self.language.clone();

        tokio::spawn(async move {
            let mut buffered: Vec<u8> = Vec::new();
            while let Some(cmd) = control_rx.recv().await {
                match cmd {
                    SessionControl::Audio(pcm) => buffered.extend_from_slice(&pcm),
                    SessionControl::Eos => {
                        if buffered.is_empty() {
                            let _ = event_tx
                                .send(RecognizerEvent::Final {
                                    text: String::new(),
                                })
                                .await;
                            return;
                        }
                        let event = match encode_wav(&buffered) {
                            Ok(wav) => {
                                match transcribe(&client, &api_key, &model, &language, wav).await
                                {
                                    Ok(text) => RecognizerEvent::Final { text },
                                    Err(e) => RecognizerEvent::Error {
                                        message: e.to_string(),
                                    },
                                }
                            }
                            Err(e) => RecognizerEvent::Error {
                                message: e.to_string(),
                            },
                        };
                        let _ = event_tx.send(event).await;
                        return;
                    }
                    SessionControl::Cancel => return,
                }
            }
        });

        Ok(Session::new(session_id, control_tx, event_rx))
    }
}

/// Check whether an API key is accepted by OpenAI.
pub async fn probe(api_key: &str) -> Result<String, AsrError> {
    let client = reqwest::Client::new();
    let response = client
        .get("https://api.openai.com/v1/models")
        .bearer_auth(api_key)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header() {
        let pcm: Vec<u8> = vec![0, 0, 255, 127, 0, 128];
        let wav = encode_wav(&pcm).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // 3 samples of 16-bit mono payload
        assert_eq!(wav.len(), 44 + 6);
    }

    #[tokio::test]
    async fn test_empty_utterance_yields_empty_final() {
        let recognizer = WhisperRecognizer::new("sk-test".into(), "whisper-1".into(), "en".into());
        let mut session = recognizer.connect().await.unwrap();
        session.send_eos().await.unwrap();
        match session.next_event().await {
            Some(RecognizerEvent::Final { text }) => assert!(text.is_empty()),
            other => panic!("expected empty final, got {other:?}"),
        }
    }
}
