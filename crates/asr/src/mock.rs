//! Scripted recognizer for tests
//!
//! Plays pre-programmed sessions so the pipeline can be driven end-to-end
//! without a network. Each `connect` consumes the next [`MockScript`];
//! received audio and EOS signals are recorded for assertions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::traits::{RecognizerEvent, Session, SessionControl, StreamingRecognizer, CHANNEL_CAPACITY};
use crate::AsrError;

/// One step of a scripted session.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit a partial hypothesis
    Partial { confirmed: String, stash: String },
    /// Sleep before the next step
    Delay(u64),
    /// Emit a server-initiated final (VAD segment end) and close the session
    ServerFinal(String),
    /// Wait for client EOS, then emit the terminal final and close
    FinalOnEos(String),
    /// Close the event stream without any final
    End,
}

impl ScriptStep {
    pub fn partial(confirmed: &str, stash: &str) -> Self {
        ScriptStep::Partial {
            confirmed: confirmed.to_string(),
            stash: stash.to_string(),
        }
    }
}

/// A scripted session: either a connect failure or a list of steps.
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    pub connect_error: Option<AsrError>,
    pub steps: Vec<ScriptStep>,
}

impl MockScript {
    pub fn ok(steps: Vec<ScriptStep>) -> Self {
        Self {
            connect_error: None,
            steps,
        }
    }

    pub fn failing(error: AsrError) -> Self {
        Self {
            connect_error: Some(error),
            steps: Vec::new(),
        }
    }
}

/// Recognizer that replays scripted sessions.
pub struct MockRecognizer {
    scripts: Mutex<VecDeque<MockScript>>,
    connects: AtomicUsize,
    eos_signals: Arc<AtomicUsize>,
    audio: Arc<Mutex<Vec<u8>>>,
}

impl MockRecognizer {
    pub fn new(scripts: Vec<MockScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            connects: AtomicUsize::new(0),
            eos_signals: Arc::new(AtomicUsize::new(0)),
            audio: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of `connect` calls observed
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }

    /// Number of EOS signals observed across all sessions
    pub fn eos_count(&self) -> usize {
        self.eos_signals.load(Ordering::Relaxed)
    }

    /// All PCM bytes received across all sessions
    pub fn audio_received(&self) -> Vec<u8> {
        self.audio.lock().clone()
    }
}

#[async_trait]
impl StreamingRecognizer for MockRecognizer {
    async fn connect(&self) -> Result<Session, AsrError> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        let script = self
            .scripts
            .lock()
            .pop_front()
            .ok_or_else(|| AsrError::Network("no scripted session left".into()))?;
        if let Some(error) = script.connect_error {
            return Err(error);
        }

        let (control_tx, mut control_rx) = mpsc::channel::<SessionControl>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<RecognizerEvent>(CHANNEL_CAPACITY);
        let session_id = Uuid::new_v4().simple().to_string();

        let audio = self.audio.clone();
        let eos_signals = self.eos_signals.clone();
        let (eos_tx, eos_rx) = oneshot::channel::<()>();

        // Control reader: records audio, raises the EOS latch, dies on cancel
        let reader = tokio::spawn(async move {
            let mut eos_tx = Some(eos_tx);
            while let Some(cmd) = control_rx.recv().await {
                match cmd {
                    SessionControl::Audio(pcm) => audio.lock().extend_from_slice(&pcm),
                    SessionControl::Eos => {
                        eos_signals.fetch_add(1, Ordering::Relaxed);
                        if let Some(tx) = eos_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    SessionControl::Cancel => break,
                }
            }
        });

        let steps = script.steps;
        tokio::spawn(async move {
            let mut eos_rx = Some(eos_rx);
            for step in steps {
                match step {
                    ScriptStep::Partial { confirmed, stash } => {
                        if event_tx
                            .send(RecognizerEvent::Partial { confirmed, stash })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    ScriptStep::Delay(ms) => {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    ScriptStep::ServerFinal(text) => {
                        let _ = event_tx.send(RecognizerEvent::Final { text }).await;
                        break;
                    }
                    ScriptStep::FinalOnEos(text) => {
                        match eos_rx.take() {
                            // Cancel drops the latch sender; end without a final
                            Some(rx) => {
                                if rx.await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                        let _ = event_tx.send(RecognizerEvent::Final { text }).await;
                        break;
                    }
                    ScriptStep::End => break,
                }
            }
            drop(event_tx);
            reader.abort();
        });

        Ok(Session::new(session_id, control_tx, event_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_session_plays_in_order() {
        let recognizer = MockRecognizer::new(vec![MockScript::ok(vec![
            ScriptStep::partial("", "he"),
            ScriptStep::partial("he", "llo"),
            ScriptStep::FinalOnEos("hello".into()),
        ])]);

        let mut session = recognizer.connect().await.unwrap();
        session.send_audio(vec![1, 2, 3]).await.unwrap();
        session.send_eos().await.unwrap();

        assert_eq!(
            session.next_event().await,
            Some(RecognizerEvent::Partial {
                confirmed: "".into(),
                stash: "he".into()
            })
        );
        assert_eq!(
            session.next_event().await,
            Some(RecognizerEvent::Partial {
                confirmed: "he".into(),
                stash: "llo".into()
            })
        );
        assert_eq!(
            session.next_event().await,
            Some(RecognizerEvent::Final {
                text: "hello".into()
            })
        );
        assert_eq!(session.next_event().await, None);
        assert_eq!(recognizer.audio_received(), vec![1, 2, 3]);
        assert_eq!(recognizer.eos_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let recognizer =
            MockRecognizer::new(vec![MockScript::failing(AsrError::Auth("bad key".into()))]);
        assert!(matches!(
            recognizer.connect().await,
            Err(AsrError::Auth(_))
        ));
        assert_eq!(recognizer.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_suppresses_final() {
        let recognizer = MockRecognizer::new(vec![MockScript::ok(vec![ScriptStep::FinalOnEos(
            "never".into(),
        )])]);
        let mut session = recognizer.connect().await.unwrap();
        session.close();
        assert_eq!(session.next_event().await, None);
    }

    #[tokio::test]
    async fn test_scripts_exhausted() {
        let recognizer = MockRecognizer::new(vec![]);
        assert!(matches!(
            recognizer.connect().await,
            Err(AsrError::Network(_))
        ));
    }
}
