//! End-to-end pipeline scenarios against the scripted recognizer
//!
//! These tests drive the whole coordinator (capture queue, forwarder,
//! session replacement, terminal stop) with a mock recognizer and an
//! in-memory audio source, asserting the exact event sequences the host
//! contract promises.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use vhisper_asr::{AsrError, MockRecognizer, MockScript, ScriptStep};
use vhisper_audio::{AudioSource, ChunkQueue};
use vhisper_config::Settings;
use vhisper_core::{AudioChunk, PipelineEvent, PipelineState};
use vhisper_pipeline::{EventCallback, SourceFactory, VoicePipeline};

/// In-memory audio source: the test owns the chunk queue.
struct TestSource {
    queue: Arc<ChunkQueue>,
    preroll: Arc<Mutex<Vec<u8>>>,
    peak: f32,
    paused: Arc<AtomicBool>,
}

impl AudioSource for TestSource {
    fn chunks(&self) -> Arc<ChunkQueue> {
        self.queue.clone()
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    fn drain_preroll(&self) -> Vec<u8> {
        std::mem::take(&mut *self.preroll.lock())
    }

    fn peak_amplitude(&self) -> f32 {
        self.peak
    }

    fn dropped_chunks(&self) -> u64 {
        self.queue.dropped()
    }

    fn stop(&mut self) {
        self.queue.close();
    }
}

struct Harness {
    pipeline: VoicePipeline,
    recognizer: Arc<MockRecognizer>,
    queue: Arc<ChunkQueue>,
    preroll: Arc<Mutex<Vec<u8>>>,
    events: mpsc::UnboundedReceiver<PipelineEvent>,
    callback: EventCallback,
}

fn test_settings() -> Settings {
    Settings::from_json(
        r#"{
            "asr": { "provider": "FunAsr", "funasr": {} },
            "engine": { "final_wait_ms": 250 }
        }"#,
    )
    .unwrap()
}

fn harness_with_peak(scripts: Vec<MockScript>, peak: f32) -> Harness {
    let recognizer = Arc::new(MockRecognizer::new(scripts));
    let queue = Arc::new(ChunkQueue::new(10));
    let preroll = Arc::new(Mutex::new(Vec::new()));

    let factory: SourceFactory = {
        let queue = queue.clone();
        let preroll = preroll.clone();
        Arc::new(move |_config| {
            Ok(Box::new(TestSource {
                queue: queue.clone(),
                preroll: preroll.clone(),
                peak,
                paused: Arc::new(AtomicBool::new(false)),
            }) as Box<dyn AudioSource>)
        })
    };

    let pipeline =
        VoicePipeline::with_components(test_settings(), recognizer.clone(), factory).unwrap();

    let (tx, events) = mpsc::unbounded_channel();
    let callback: EventCallback = Arc::new(move |event| {
        let _ = tx.send(event);
    });

    Harness {
        pipeline,
        recognizer,
        queue,
        preroll,
        events,
        callback,
    }
}

fn harness(scripts: Vec<MockScript>) -> Harness {
    harness_with_peak(scripts, 0.5)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<PipelineEvent>) -> PipelineEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn wait_for_state(pipeline: &VoicePipeline, expected: PipelineState) {
    for _ in 0..100 {
        if pipeline.state() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pipeline never reached {expected:?}");
}

fn partial(confirmed: &str, stash: &str) -> PipelineEvent {
    PipelineEvent::Partial {
        confirmed: confirmed.into(),
        stash: stash.into(),
    }
}

#[tokio::test]
async fn test_happy_path() {
    let mut h = harness(vec![MockScript::ok(vec![
        ScriptStep::partial("he", "llo"),
        ScriptStep::partial("hello", ""),
        ScriptStep::FinalOnEos("hello world".into()),
    ])]);

    h.pipeline.start_streaming(h.callback.clone()).unwrap();
    assert_eq!(h.pipeline.state(), PipelineState::Recording);
    assert!(h.pipeline.is_streaming());

    h.queue.push(AudioChunk::new(vec![1, 2, 3, 4], 0));
    h.queue.push(AudioChunk::new(vec![5, 6, 7, 8], 1600));

    assert_eq!(next_event(&mut h.events).await, partial("he", "llo"));
    assert_eq!(next_event(&mut h.events).await, partial("hello", ""));

    h.pipeline.stop_streaming();
    assert_eq!(
        next_event(&mut h.events).await,
        PipelineEvent::Final {
            text: "hello world".into()
        }
    );
    wait_for_state(&h.pipeline, PipelineState::Idle).await;

    // The forwarder must have delivered the captured PCM to the session
    assert_eq!(h.recognizer.audio_received(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(h.recognizer.eos_count(), 1);
}

#[tokio::test]
async fn test_auto_reconnect_spans_sessions() {
    let mut h = harness(vec![
        MockScript::ok(vec![ScriptStep::ServerFinal("first segment".into())]),
        MockScript::ok(vec![
            ScriptStep::partial("", "more"),
            ScriptStep::FinalOnEos("more text".into()),
        ]),
    ]);
    *h.preroll.lock() = vec![9, 9, 9, 9];

    h.pipeline.start_streaming(h.callback.clone()).unwrap();

    // Segment final arrives while the key is still held
    assert_eq!(
        next_event(&mut h.events).await,
        PipelineEvent::Final {
            text: "first segment".into()
        }
    );
    assert_eq!(h.pipeline.state(), PipelineState::Recording);

    // Second session comes up seamlessly and keeps streaming
    assert_eq!(next_event(&mut h.events).await, partial("", "more"));
    assert_eq!(h.pipeline.state(), PipelineState::Recording);

    h.pipeline.stop_streaming();
    assert_eq!(
        next_event(&mut h.events).await,
        PipelineEvent::Final {
            text: "more text".into()
        }
    );
    wait_for_state(&h.pipeline, PipelineState::Idle).await;

    assert_eq!(h.recognizer.connect_count(), 2);
    // The replacement session was seeded from the pre-roll
    assert_eq!(h.recognizer.audio_received(), vec![9, 9, 9, 9]);
}

#[tokio::test]
async fn test_cancel_mid_stream_suppresses_callbacks() {
    let mut h = harness(vec![MockScript::ok(vec![
        ScriptStep::partial("", "hel"),
        ScriptStep::FinalOnEos("never delivered".into()),
    ])]);

    h.pipeline.start_streaming(h.callback.clone()).unwrap();
    assert_eq!(next_event(&mut h.events).await, partial("", "hel"));

    h.pipeline.cancel_streaming();
    // Cancel is observable before return
    assert_eq!(h.pipeline.state(), PipelineState::Idle);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.events.try_recv().is_err(), "no callback may fire after cancel");
}

#[tokio::test]
async fn test_auth_failure_surfaces_one_error() {
    let mut h = harness(vec![MockScript::failing(AsrError::Auth(
        "invalid key".into(),
    ))]);

    h.pipeline.start_streaming(h.callback.clone()).unwrap();

    match next_event(&mut h.events).await {
        PipelineEvent::Error { message } => assert!(message.contains("auth")),
        other => panic!("expected error event, got {other:?}"),
    }
    wait_for_state(&h.pipeline, PipelineState::Idle).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.events.try_recv().is_err(), "exactly one terminal event");
}

#[tokio::test]
async fn test_reconnect_storm_coalesces_into_one_error() {
    let mut h = harness(vec![
        MockScript::ok(vec![ScriptStep::End]),
        MockScript::ok(vec![ScriptStep::End]),
        MockScript::ok(vec![ScriptStep::End]),
    ]);

    h.pipeline.start_streaming(h.callback.clone()).unwrap();

    match next_event(&mut h.events).await {
        PipelineEvent::Error { message } => assert!(message.contains("reconnect failed")),
        other => panic!("expected error event, got {other:?}"),
    }
    wait_for_state(&h.pipeline, PipelineState::Idle).await;
    assert_eq!(h.recognizer.connect_count(), 3);
}

#[tokio::test]
async fn test_stop_with_no_audio_yields_empty_final() {
    let mut h = harness(vec![MockScript::ok(vec![ScriptStep::FinalOnEos(
        String::new(),
    )])]);

    h.pipeline.start_streaming(h.callback.clone()).unwrap();
    h.pipeline.stop_streaming();

    assert_eq!(
        next_event(&mut h.events).await,
        PipelineEvent::Final {
            text: String::new()
        }
    );
    wait_for_state(&h.pipeline, PipelineState::Idle).await;
}

#[tokio::test]
async fn test_watchdog_converts_missing_final_into_empty_final() {
    // Session stays alive but never answers the EOS
    let mut h = harness(vec![MockScript::ok(vec![
        ScriptStep::Delay(10_000),
        ScriptStep::End,
    ])]);

    h.pipeline.start_streaming(h.callback.clone()).unwrap();
    wait_for_state(&h.pipeline, PipelineState::Recording).await;
    h.pipeline.stop_streaming();
    assert_eq!(h.pipeline.state(), PipelineState::Processing);

    assert_eq!(
        next_event(&mut h.events).await,
        PipelineEvent::Final {
            text: String::new()
        }
    );
    wait_for_state(&h.pipeline, PipelineState::Idle).await;
}

#[tokio::test]
async fn test_silence_gate_blanks_terminal_final() {
    let mut h = harness_with_peak(
        vec![MockScript::ok(vec![ScriptStep::FinalOnEos(
            "ghost text".into(),
        )])],
        0.0,
    );

    h.pipeline.start_streaming(h.callback.clone()).unwrap();
    h.pipeline.stop_streaming();

    assert_eq!(
        next_event(&mut h.events).await,
        PipelineEvent::Final {
            text: String::new()
        }
    );
}

#[tokio::test]
async fn test_start_while_streaming_is_busy() {
    let h = harness(vec![MockScript::ok(vec![ScriptStep::FinalOnEos(
        "x".into(),
    )])]);

    h.pipeline.start_streaming(h.callback.clone()).unwrap();
    let second = h.pipeline.start_streaming(h.callback.clone());
    assert!(second.is_err());

    h.pipeline.cancel_streaming();
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let h = harness(vec![MockScript::ok(vec![ScriptStep::FinalOnEos(
        "x".into(),
    )])]);

    h.pipeline.start_streaming(h.callback.clone()).unwrap();
    for _ in 0..5 {
        h.pipeline.cancel_streaming();
        assert_eq!(h.pipeline.state(), PipelineState::Idle);
    }
}

#[tokio::test]
async fn test_stop_from_idle_is_noop() {
    let h = harness(vec![]);
    h.pipeline.stop_streaming();
    assert_eq!(h.pipeline.state(), PipelineState::Idle);
}

#[tokio::test]
async fn test_update_config_rejected_while_streaming() {
    let h = harness(vec![MockScript::ok(vec![ScriptStep::FinalOnEos(
        "x".into(),
    )])]);

    h.pipeline.start_streaming(h.callback.clone()).unwrap();
    assert!(h.pipeline.update_config(test_settings()).is_err());

    h.pipeline.cancel_streaming();
    wait_for_state(&h.pipeline, PipelineState::Idle).await;
    // Supervisor teardown is asynchronous; config replacement only needs Idle
    assert!(h.pipeline.update_config(test_settings()).is_ok());
}

#[tokio::test]
async fn test_shutdown_joins_workers() {
    let h = harness(vec![MockScript::ok(vec![ScriptStep::FinalOnEos(
        "x".into(),
    )])]);

    h.pipeline.start_streaming(h.callback.clone()).unwrap();
    h.pipeline.shutdown().await;
    assert_eq!(h.pipeline.state(), PipelineState::Idle);
}
