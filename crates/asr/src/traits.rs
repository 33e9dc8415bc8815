//! Session contract shared by every recognizer
//!
//! A [`Session`] is one live connection: a bounded control channel into the
//! provider worker and a bounded event channel out of it. Dropping the
//! session (or sending [`SessionControl::Cancel`]) tears the worker down,
//! which in turn ends the event stream; that is the cancellation path the
//! pipeline relies on.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::AsrError;

/// Capacity of the control and event channels. Roughly six seconds of audio
/// at 100 ms chunks; a worker that falls further behind than this has lost
/// the connection anyway.
pub(crate) const CHANNEL_CAPACITY: usize = 64;

/// Commands accepted by a session worker.
#[derive(Debug)]
pub enum SessionControl {
    /// One chunk of s16le PCM
    Audio(Vec<u8>),
    /// End of utterance; the server should answer with one final
    Eos,
    /// Tear down immediately, discarding unsent audio
    Cancel,
}

/// Events emitted by a session worker, already normalized across providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// Hypothesis update: `confirmed` is stable, `stash` may still change
    Partial { confirmed: String, stash: String },
    /// Terminal hypothesis; the event stream ends shortly after
    Final { text: String },
    /// Connection-level failure; the event stream ends shortly after
    Error { message: String },
}

/// The send half of a session: control channel plus id.
pub struct SessionHandle {
    id: String,
    control: mpsc::Sender<SessionControl>,
}

impl SessionHandle {
    /// Provider-issued task id, or a locally minted one.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Enqueue one audio chunk toward the server.
    ///
    /// Suspends while the worker's bounded queue is full; the pipeline wraps
    /// this in its send timeout and recycles the session on a stall.
    pub async fn send_audio(&self, pcm: Vec<u8>) -> Result<(), AsrError> {
        self.control
            .send(SessionControl::Audio(pcm))
            .await
            .map_err(|_| AsrError::Network("session closed".into()))
    }

    /// Signal end of utterance.
    pub async fn send_eos(&self) -> Result<(), AsrError> {
        self.control
            .send(SessionControl::Eos)
            .await
            .map_err(|_| AsrError::Network("session closed".into()))
    }

    /// Tear down immediately. Idempotent; unread events are discarded by the
    /// worker once it observes the cancel.
    pub fn close(&self) {
        let _ = self.control.try_send(SessionControl::Cancel);
    }
}

/// One live recognizer connection.
pub struct Session {
    handle: SessionHandle,
    events: mpsc::Receiver<RecognizerEvent>,
}

impl Session {
    pub fn new(
        id: String,
        control: mpsc::Sender<SessionControl>,
        events: mpsc::Receiver<RecognizerEvent>,
    ) -> Self {
        Self {
            handle: SessionHandle { id, control },
            events,
        }
    }

    /// Provider-issued task id, or a locally minted one.
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// See [`SessionHandle::send_audio`].
    pub async fn send_audio(&self, pcm: Vec<u8>) -> Result<(), AsrError> {
        self.handle.send_audio(pcm).await
    }

    /// See [`SessionHandle::send_eos`].
    pub async fn send_eos(&self) -> Result<(), AsrError> {
        self.handle.send_eos().await
    }

    /// See [`SessionHandle::close`].
    pub fn close(&self) {
        self.handle.close()
    }

    /// Next event, or `None` once the worker has finished.
    pub async fn next_event(&mut self) -> Option<RecognizerEvent> {
        self.events.recv().await
    }

    /// Split into the send half and the event stream so a coordinator can
    /// poll events while audio keeps flowing.
    pub fn split(self) -> (SessionHandle, mpsc::Receiver<RecognizerEvent>) {
        (self.handle, self.events)
    }
}

/// A provider that can open streaming sessions.
#[async_trait]
pub trait StreamingRecognizer: Send + Sync {
    /// Open a duplex channel and perform the provider handshake. Returns
    /// once the server has acknowledged readiness.
    async fn connect(&self) -> Result<Session, AsrError>;
}
