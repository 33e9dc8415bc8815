//! Voice pipeline orchestrator
//!
//! Coordinates microphone capture, the recognizer session and text
//! enhancement for one push-to-talk utterance at a time.
//!
//! State machine: `Idle -> Recording -> Processing -> Idle`, with
//! `cancel_streaming` as an escape from any state. While `Recording`, a
//! server-side VAD final does not end the utterance: the final is forwarded
//! to the host and a fresh session is connected underneath, seeded from the
//! pre-roll ring, so long dictation survives the server's segmenting.
//!
//! All public operations return quickly; results arrive on the installed
//! callback from a supervisor task. The callback is invoked under the slot
//! lock so that `cancel_streaming` can guarantee no callback fires after it
//! returns; callbacks must return promptly and must not call back into the
//! pipeline.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use vhisper_asr::{
    create_recognizer, AsrError, RecognizerEvent, SessionHandle, StreamingRecognizer,
};
use vhisper_audio::{AudioError, AudioSource, CaptureConfig, ChunkQueue, MicSource};
use vhisper_config::{EngineTunables, Settings};
use vhisper_core::{PipelineEvent, PipelineState};
use vhisper_llm::{create_refiner, Enhancer};

use crate::PipelineError;

/// Host event callback
pub type EventCallback = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

/// Opens an audio source; swapped out in tests.
pub type SourceFactory =
    Arc<dyn Fn(CaptureConfig) -> Result<Box<dyn AudioSource>, AudioError> + Send + Sync>;

/// Callback storage for one start-session. Emptied on the first terminal
/// event and on cancel; dispatch happens under the lock.
type CallbackSlot = Mutex<Option<EventCallback>>;

/// Guarded state with an atomic mirror for lock-free reads.
struct StateCell {
    guarded: Mutex<PipelineState>,
    mirror: AtomicI32,
}

impl StateCell {
    fn new() -> Self {
        Self {
            guarded: Mutex::new(PipelineState::Idle),
            mirror: AtomicI32::new(PipelineState::Idle.as_i32()),
        }
    }

    /// Write `next` while the guarded lock is already held, keeping the
    /// mirror in step. Callers that need check-and-set or epoch bumps do
    /// them under the same guard.
    fn write(&self, state: &mut PipelineState, next: PipelineState) {
        *state = next;
        self.mirror.store(next.as_i32(), Ordering::Release);
    }

    fn read(&self) -> PipelineState {
        match self.mirror.load(Ordering::Acquire) {
            1 => PipelineState::Recording,
            2 => PipelineState::Processing,
            _ => PipelineState::Idle,
        }
    }
}

/// Commands from the host API into the supervisor task.
enum Command {
    Stop,
    Cancel,
}

/// The push-to-talk coordinator.
pub struct VoicePipeline {
    settings: RwLock<Settings>,
    state: Arc<StateCell>,
    /// Callback slot of the current (or most recent) start-session
    slot: Mutex<Arc<CallbackSlot>>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on every start and cancel; a supervisor whose epoch is stale
    /// must not touch shared state (it belongs to a superseded run)
    epoch: Arc<AtomicU64>,
    recognizer_override: Option<Arc<dyn StreamingRecognizer>>,
    source_factory: SourceFactory,
    runtime: tokio::runtime::Handle,
}

impl VoicePipeline {
    /// Create a pipeline with the real microphone and the provider selected
    /// by the settings. Must be called within a tokio runtime context.
    pub fn new(settings: Settings) -> Result<Self, PipelineError> {
        let factory: SourceFactory = Arc::new(|config| {
            MicSource::open(config).map(|source| Box::new(source) as Box<dyn AudioSource>)
        });
        Self::build(settings, None, factory)
    }

    /// Create a pipeline with injected components (tests, benchmarks).
    pub fn with_components(
        settings: Settings,
        recognizer: Arc<dyn StreamingRecognizer>,
        source_factory: SourceFactory,
    ) -> Result<Self, PipelineError> {
        Self::build(settings, Some(recognizer), source_factory)
    }

    fn build(
        settings: Settings,
        recognizer_override: Option<Arc<dyn StreamingRecognizer>>,
        source_factory: SourceFactory,
    ) -> Result<Self, PipelineError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            PipelineError::Internal("pipeline must be created within a tokio runtime".into())
        })?;
        Ok(Self {
            settings: RwLock::new(settings),
            state: Arc::new(StateCell::new()),
            slot: Mutex::new(Arc::new(Mutex::new(None))),
            commands: Mutex::new(None),
            supervisor: Mutex::new(None),
            epoch: Arc::new(AtomicU64::new(0)),
            recognizer_override,
            source_factory,
            runtime,
        })
    }

    /// Current state, lock-free.
    pub fn state(&self) -> PipelineState {
        self.state.read()
    }

    /// True while a start-session is in flight.
    pub fn is_streaming(&self) -> bool {
        self.state.read().is_streaming()
    }

    /// Begin capturing and recognizing. Returns `Busy` unless `Idle`;
    /// bring-up failures (device, auth, network) surface asynchronously as a
    /// single `Error` event followed by a return to `Idle`.
    pub fn start_streaming(&self, callback: EventCallback) -> Result<(), PipelineError> {
        // Epoch is bumped under the state lock so a superseded supervisor
        // can never observe itself as current
        let run_epoch = {
            let mut state = self.state.guarded.lock();
            if *state != PipelineState::Idle {
                return Err(PipelineError::Busy);
            }
            self.state.write(&mut state, PipelineState::Recording);
            self.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };

        let slot: Arc<CallbackSlot> = Arc::new(Mutex::new(Some(callback)));
        *self.slot.lock() = slot.clone();

        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        *self.commands.lock() = Some(cmd_tx);

        let run = SessionRun {
            state: self.state.clone(),
            slot,
            settings: self.settings.read().clone(),
            epoch: self.epoch.clone(),
            run_epoch,
            recognizer_override: self.recognizer_override.clone(),
            source_factory: self.source_factory.clone(),
        };
        let handle = self.runtime.spawn(run.execute(cmd_rx));
        *self.supervisor.lock() = Some(handle);
        Ok(())
    }

    /// End the utterance: EOS to the recognizer, then exactly one terminal
    /// `Final` (possibly empty) once the server answers or the watchdog
    /// expires. A no-op unless `Recording`.
    pub fn stop_streaming(&self) {
        {
            let mut state = self.state.guarded.lock();
            if *state != PipelineState::Recording {
                return;
            }
            self.state.write(&mut state, PipelineState::Processing);
        }
        if let Some(tx) = self.commands.lock().as_ref() {
            let _ = tx.try_send(Command::Stop);
        }
    }

    /// Abort from any state. No callback fires after this returns; worker
    /// teardown completes asynchronously (see [`shutdown`]). Idempotent.
    ///
    /// [`shutdown`]: VoicePipeline::shutdown
    pub fn cancel_streaming(&self) {
        // Empty the slot first: dispatch runs under this lock, so once we
        // have taken the callback no further event can reach the host.
        let slot = self.slot.lock().clone();
        slot.lock().take();

        {
            let mut state = self.state.guarded.lock();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.state.write(&mut state, PipelineState::Idle);
        }

        if let Some(tx) = self.commands.lock().take() {
            let _ = tx.try_send(Command::Cancel);
        }
    }

    /// Replace the configuration. Only permitted while `Idle`.
    pub fn update_config(&self, settings: Settings) -> Result<(), PipelineError> {
        let state = self.state.guarded.lock();
        if *state != PipelineState::Idle {
            return Err(PipelineError::Busy);
        }
        settings.validate()?;
        *self.settings.write() = settings;
        Ok(())
    }

    /// Cancel and wait for the supervisor task to finish. Used by `destroy`.
    pub async fn shutdown(&self) {
        self.cancel_streaming();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if timeout(Duration::from_secs(2), handle).await.is_err() {
                tracing::warn!("supervisor did not finish within shutdown grace period");
            }
        }
    }
}

/// Outcome of a session replacement attempt.
enum Replace {
    Session(SessionHandle, mpsc::Receiver<RecognizerEvent>),
    Stop,
    Cancelled,
    GaveUp,
}

/// One start-session: bring-up, the forwarding loop, and teardown.
struct SessionRun {
    state: Arc<StateCell>,
    slot: Arc<CallbackSlot>,
    settings: Settings,
    epoch: Arc<AtomicU64>,
    run_epoch: u64,
    recognizer_override: Option<Arc<dyn StreamingRecognizer>>,
    source_factory: SourceFactory,
}

impl SessionRun {
    async fn execute(self, mut commands: mpsc::Receiver<Command>) {
        let tunables = self.settings.engine.clone();

        let recognizer = match &self.recognizer_override {
            Some(recognizer) => recognizer.clone(),
            None => match create_recognizer(&self.settings.asr) {
                Ok(recognizer) => recognizer,
                Err(e) => return self.fail(format!("recognizer setup failed: {e}")),
            },
        };

        // Device bring-up blocks on the OS; keep it off the runtime threads
        let capture = CaptureConfig {
            chunk_ms: tunables.chunk_ms,
            preroll_ms: tunables.preroll_ms,
            queue_capacity: tunables.queue_capacity_chunks(),
            device: None,
        };
        let factory = self.source_factory.clone();
        let mut source = match tokio::task::spawn_blocking(move || factory(capture)).await {
            Ok(Ok(source)) => source,
            Ok(Err(e)) => return self.fail(format!("audio start failed: {e}")),
            Err(e) => return self.fail(format!("audio start failed: {e}")),
        };

        let enhancer = match create_refiner(&self.settings.llm) {
            Ok(Some(refiner)) => Some(Enhancer::new(refiner, tunables.enhancer_timeout())),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("enhancer setup failed, continuing without: {e}");
                None
            }
        };

        // The queue is already buffering from-start audio while we connect,
        // so nothing before the handshake completes is lost.
        let connected = timeout(tunables.connect_timeout(), recognizer.connect()).await;
        let (session, mut events) = match connected {
            Ok(Ok(session)) => {
                tracing::info!(session = session.id(), "recognizer session established");
                session.split()
            }
            Ok(Err(e)) => {
                source.stop();
                return self.fail(describe_connect_error(&e));
            }
            Err(_) => {
                source.stop();
                return self.fail("recognizer connect timed out".into());
            }
        };
        let mut session = session;

        let chunks = source.chunks();
        let mut failures: u32 = 0;
        let mut window_start = Instant::now();

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Stop) => {
                        source.pause();
                        self.flush_backlog(&chunks, &session, &tunables).await;
                        let text = match self.finish(&session, &mut events, &mut commands, &tunables).await {
                            Some(text) => text,
                            None => {
                                // Cancelled while draining
                                session.close();
                                source.stop();
                                return;
                            }
                        };
                        let text = self
                            .gate_and_enhance(text, source.as_ref(), enhancer.as_ref(), &tunables)
                            .await;
                        session.close();
                        source.stop();
                        return self.finish_terminal(PipelineEvent::Final { text });
                    }
                    Some(Command::Cancel) | None => {
                        session.close();
                        source.stop();
                        return;
                    }
                },

                chunk = chunks.recv() => match chunk {
                    Some(chunk) => {
                        let sent = timeout(tunables.send_timeout(), session.send_audio(chunk.pcm)).await;
                        if !matches!(sent, Ok(Ok(()))) {
                            tracing::warn!(session = session.id(), "audio send stalled, recycling session");
                            session.close();
                            source.pause();
                            match self
                                .replace_session(
                                    recognizer.as_ref(),
                                    source.as_ref(),
                                    &mut commands,
                                    &tunables,
                                    true,
                                    &mut failures,
                                    &mut window_start,
                                )
                                .await
                            {
                                Replace::Session(next, next_events) => {
                                    session = next;
                                    events = next_events;
                                }
                                Replace::Stop => {
                                    source.stop();
                                    return self.finish_terminal(PipelineEvent::Final {
                                        text: String::new(),
                                    });
                                }
                                Replace::Cancelled => {
                                    source.stop();
                                    return;
                                }
                                Replace::GaveUp => {
                                    source.stop();
                                    return self.fail("reconnect failed".into());
                                }
                            }
                        }
                    }
                    None => {
                        session.close();
                        source.stop();
                        return self.fail("audio stream ended unexpectedly".into());
                    }
                },

                event = events.recv() => {
                    let (trigger, was_failure) = match event {
                        Some(RecognizerEvent::Partial { confirmed, stash }) => {
                            self.dispatch(PipelineEvent::Partial { confirmed, stash });
                            continue;
                        }
                        Some(RecognizerEvent::Final { text }) => {
                            // Server segment final while the key is still
                            // held: forward it, then keep recording through
                            // a fresh session.
                            self.dispatch(PipelineEvent::Final { text });
                            ("segment final", false)
                        }
                        Some(RecognizerEvent::Error { message }) => {
                            tracing::warn!(session = session.id(), "session error: {message}");
                            ("session error", true)
                        }
                        None => ("session closed", true),
                    };
                    tracing::debug!(session = session.id(), "recycling after {trigger}");
                    session.close();
                    source.pause();
                    match self
                        .replace_session(
                            recognizer.as_ref(),
                            source.as_ref(),
                            &mut commands,
                            &tunables,
                            was_failure,
                            &mut failures,
                            &mut window_start,
                        )
                        .await
                    {
                        Replace::Session(next, next_events) => {
                            session = next;
                            events = next_events;
                        }
                        Replace::Stop => {
                            source.stop();
                            return self.finish_terminal(PipelineEvent::Final {
                                text: String::new(),
                            });
                        }
                        Replace::Cancelled => {
                            source.stop();
                            return;
                        }
                        Replace::GaveUp => {
                            source.stop();
                            return self.fail("reconnect failed".into());
                        }
                    }
                },
            }
        }
    }

    /// Connect a replacement session, seeded from the pre-roll. Failures are
    /// bounded: `reconnect_max_failures` consecutive failures within the
    /// window surface one error to the caller.
    async fn replace_session(
        &self,
        recognizer: &dyn StreamingRecognizer,
        source: &dyn AudioSource,
        commands: &mut mpsc::Receiver<Command>,
        tunables: &EngineTunables,
        counts_as_failure: bool,
        failures: &mut u32,
        window_start: &mut Instant,
    ) -> Replace {
        // A session that died after a clean segment final is a normal
        // replacement; one that errored, stalled or closed silently counts
        // toward the failure budget.
        if counts_as_failure && !note_failure(failures, window_start, tunables) {
            return Replace::GaveUp;
        }
        loop {
            tokio::select! {
                cmd = commands.recv() => return match cmd {
                    Some(Command::Stop) => Replace::Stop,
                    Some(Command::Cancel) | None => Replace::Cancelled,
                },
                connected = timeout(tunables.connect_timeout(), recognizer.connect()) => {
                    match connected {
                        Ok(Ok(session)) => {
                            let (session, events) = session.split();
                            let preroll = source.drain_preroll();
                            if !preroll.is_empty() {
                                let _ = timeout(
                                    tunables.send_timeout(),
                                    session.send_audio(preroll),
                                )
                                .await;
                            }
                            source.resume();
                            tracing::info!(session = session.id(), "reconnected");
                            return Replace::Session(session, events);
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(attempt = *failures, "reconnect failed: {e}");
                        }
                        Err(_) => {
                            tracing::warn!(attempt = *failures, "reconnect timed out");
                        }
                    }
                    if !note_failure(failures, window_start, tunables) {
                        return Replace::GaveUp;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                },
            }
        }
    }

    /// Forward whatever the capture queue still holds before EOS so the tail
    /// of the utterance reaches the server.
    async fn flush_backlog(
        &self,
        chunks: &ChunkQueue,
        session: &SessionHandle,
        tunables: &EngineTunables,
    ) {
        while let Some(chunk) = chunks.try_recv() {
            let sent = timeout(tunables.send_timeout(), session.send_audio(chunk.pcm)).await;
            if !matches!(sent, Ok(Ok(()))) {
                tracing::warn!("backlog flush stalled, discarding remainder");
                break;
            }
        }
    }

    /// Send EOS and drain the terminal result, bounded by the watchdog.
    /// Returns `None` when cancelled mid-drain.
    async fn finish(
        &self,
        session: &SessionHandle,
        events: &mut mpsc::Receiver<RecognizerEvent>,
        commands: &mut mpsc::Receiver<Command>,
        tunables: &EngineTunables,
    ) -> Option<String> {
        if session.send_eos().await.is_err() {
            return Some(String::new());
        }

        let mut best = String::new();
        let watchdog = tokio::time::sleep(tunables.final_wait());
        tokio::pin!(watchdog);

        loop {
            tokio::select! {
                _ = &mut watchdog => {
                    tracing::warn!(
                        wait_ms = tunables.final_wait_ms,
                        "no terminal final before watchdog, emitting empty final"
                    );
                    return Some(String::new());
                }
                cmd = commands.recv() => match cmd {
                    Some(Command::Stop) => {} // already stopping
                    Some(Command::Cancel) | None => return None,
                },
                event = events.recv() => match event {
                    Some(RecognizerEvent::Partial { confirmed, stash }) => {
                        best = merge_hypothesis(&confirmed, &stash);
                        self.dispatch(PipelineEvent::Partial { confirmed, stash });
                    }
                    Some(RecognizerEvent::Final { text }) => return Some(text),
                    Some(RecognizerEvent::Error { message }) => {
                        tracing::warn!("session error while draining final: {message}");
                        return Some(best);
                    }
                    None => return Some(best),
                },
            }
        }
    }

    /// Apply the silence gate and optional enhancement to the terminal text.
    async fn gate_and_enhance(
        &self,
        text: String,
        source: &dyn AudioSource,
        enhancer: Option<&Enhancer>,
        tunables: &EngineTunables,
    ) -> String {
        let dropped = source.dropped_chunks();
        if dropped > 0 {
            tracing::info!(dropped, "audio chunks were dropped during this utterance");
        }

        let peak = source.peak_amplitude();
        if peak < tunables.silence_floor {
            tracing::warn!(
                peak,
                "utterance never rose above the silence floor; check microphone permissions"
            );
            return String::new();
        }

        match (enhancer, text.is_empty()) {
            (Some(enhancer), false) => enhancer.enhance(&text).await,
            _ => text,
        }
    }

    /// Non-terminal dispatch: partials and segment finals.
    fn dispatch(&self, event: PipelineEvent) {
        let guard = self.slot.lock();
        if let Some(callback) = guard.as_ref() {
            callback(event);
        }
    }

    /// Terminal dispatch: deliver the event, drop the callback, go `Idle`.
    /// A run superseded by a cancel leaves the shared state alone, because
    /// it already belongs to a newer run.
    fn finish_terminal(&self, event: PipelineEvent) {
        {
            let mut guard = self.slot.lock();
            if let Some(callback) = guard.take() {
                callback(event);
            }
        }
        let mut state = self.state.guarded.lock();
        if self.epoch.load(Ordering::SeqCst) == self.run_epoch {
            self.state.write(&mut state, PipelineState::Idle);
        }
    }

    fn fail(&self, message: String) {
        tracing::error!("{message}");
        self.finish_terminal(PipelineEvent::Error { message });
    }
}

/// Advance the consecutive-failure counter; false means the budget is spent.
fn note_failure(failures: &mut u32, window_start: &mut Instant, tunables: &EngineTunables) -> bool {
    if window_start.elapsed() > tunables.reconnect_window() {
        *failures = 0;
        *window_start = Instant::now();
    }
    *failures += 1;
    if *failures >= tunables.reconnect_max_failures {
        tracing::error!(failures = *failures, "giving up on session replacement");
        return false;
    }
    true
}

fn merge_hypothesis(confirmed: &str, stash: &str) -> String {
    let stash = stash.trim();
    if stash.is_empty() {
        return confirmed.to_string();
    }
    if confirmed.is_empty() {
        return stash.to_string();
    }
    format!("{confirmed} {stash}")
}

fn describe_connect_error(error: &AsrError) -> String {
    match error {
        AsrError::Auth(message) => format!("auth failed: {message}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_mirror_tracks_guarded() {
        let cell = StateCell::new();
        assert_eq!(cell.read(), PipelineState::Idle);

        let mut guard = cell.guarded.lock();
        cell.write(&mut guard, PipelineState::Recording);
        drop(guard);
        assert_eq!(cell.read(), PipelineState::Recording);
        assert_eq!(*cell.guarded.lock(), PipelineState::Recording);

        let mut guard = cell.guarded.lock();
        cell.write(&mut guard, PipelineState::Processing);
        drop(guard);
        assert_eq!(cell.read(), PipelineState::Processing);
    }

    #[test]
    fn test_merge_hypothesis() {
        assert_eq!(merge_hypothesis("", ""), "");
        assert_eq!(merge_hypothesis("hello", ""), "hello");
        assert_eq!(merge_hypothesis("", "world"), "world");
        assert_eq!(merge_hypothesis("hello", "world"), "hello world");
    }
}
