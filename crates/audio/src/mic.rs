//! System microphone capture via cpal
//!
//! The hardware callback only converts and forwards device-rate frames into
//! a bounded channel; a dedicated capture thread owns the cpal stream,
//! resamples to 16 kHz, feeds the pre-roll ring, and assembles the fixed
//! chunks the recognizers consume. Stopping is cooperative through an atomic
//! flag, so the callback never blocks and teardown never races the device.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use vhisper_core::audio::STREAM_SAMPLE_RATE;
use vhisper_core::{encode_pcm_s16le, peak_amplitude, AudioChunk};

use crate::preroll::PrerollRing;
use crate::queue::ChunkQueue;
use crate::resample::{downmix_to_mono, resample_to_stream_rate};
use crate::{AudioError, AudioSource};

/// Capture parameters, derived from the engine tunables.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Emitted chunk length in milliseconds
    pub chunk_ms: u64,
    /// Pre-roll ring length in milliseconds
    pub preroll_ms: u64,
    /// Chunk queue capacity in chunks
    pub queue_capacity: usize,
    /// Preferred device name; `None` selects the system default
    pub device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            chunk_ms: 100,
            preroll_ms: 300,
            queue_capacity: 10,
            device: None,
        }
    }
}

/// State shared between the handle and the capture thread.
struct Shared {
    stop: AtomicBool,
    gate_open: AtomicBool,
    /// Peak amplitude since start, stored as f32 bits (non-negative floats
    /// order the same as their bit patterns, so `fetch_max` works)
    peak_bits: AtomicU32,
    preroll: Mutex<PrerollRing>,
}

impl Shared {
    fn update_peak(&self, block: &[f32]) {
        let peak = peak_amplitude(block);
        self.peak_bits.fetch_max(peak.to_bits(), Ordering::Relaxed);
    }
}

/// Microphone-backed [`AudioSource`].
pub struct MicSource {
    shared: Arc<Shared>,
    queue: Arc<ChunkQueue>,
    worker: Option<JoinHandle<()>>,
}

impl MicSource {
    /// List input device names for the host's settings UI.
    pub fn list_devices() -> Result<Vec<String>, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::Stream(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    /// Open the device and begin capture. Returns once the device callback
    /// is confirmed running.
    pub fn open(config: CaptureConfig) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = match &config.device {
            Some(name) => {
                let mut devices = host
                    .input_devices()
                    .map_err(|_| AudioError::DeviceUnavailable)?;
                devices
                    .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                    .ok_or(AudioError::DeviceUnavailable)?
            }
            None => host
                .default_input_device()
                .ok_or(AudioError::DeviceUnavailable)?,
        };

        let default_config = device
            .default_input_config()
            .map_err(|e| AudioError::FormatUnsupported(e.to_string()))?;

        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            gate_open: AtomicBool::new(true),
            peak_bits: AtomicU32::new(0),
            preroll: Mutex::new(PrerollRing::new(config.preroll_ms, STREAM_SAMPLE_RATE)),
        });
        let queue = Arc::new(ChunkQueue::new(config.queue_capacity));

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), AudioError>>();
        let worker = {
            let shared = shared.clone();
            let queue = queue.clone();
            std::thread::Builder::new()
                .name("vhisper-capture".into())
                .spawn(move || {
                    run_capture(device, default_config, config, shared, queue, ready_tx)
                })
                .map_err(|e| AudioError::Stream(e.to_string()))?
        };

        match ready_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(())) => Ok(Self {
                shared,
                queue,
                worker: Some(worker),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => Err(AudioError::Stream("capture thread did not start".into())),
        }
    }
}

impl AudioSource for MicSource {
    fn chunks(&self) -> Arc<ChunkQueue> {
        self.queue.clone()
    }

    fn pause(&self) {
        self.shared.gate_open.store(false, Ordering::Release);
    }

    fn resume(&self) {
        self.shared.gate_open.store(true, Ordering::Release);
    }

    fn drain_preroll(&self) -> Vec<u8> {
        self.shared.preroll.lock().drain_pcm()
    }

    fn peak_amplitude(&self) -> f32 {
        f32::from_bits(self.shared.peak_bits.load(Ordering::Relaxed))
    }

    fn dropped_chunks(&self) -> u64 {
        self.queue.dropped()
    }

    fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("capture thread panicked during stop");
            }
        }
    }
}

impl Drop for MicSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accumulates converted mono samples and forwards fixed device-rate frames.
/// Owned by the cpal callback closure; `try_send` keeps the callback
/// non-blocking when the capture thread falls behind.
struct FramePump {
    frame_samples: usize,
    channels: usize,
    pending: Vec<f32>,
    scratch: Vec<f32>,
    tx: Sender<Vec<f32>>,
}

impl FramePump {
    fn new(frame_samples: usize, channels: usize, tx: Sender<Vec<f32>>) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            channels,
            pending: Vec::with_capacity(frame_samples * 2),
            scratch: Vec::new(),
            tx,
        }
    }

    fn push<T, F>(&mut self, data: &[T], convert: F)
    where
        T: Copy,
        F: FnMut(T) -> f32,
    {
        self.scratch.clear();
        downmix_to_mono(&mut self.scratch, data, self.channels, convert);
        self.pending.extend_from_slice(&self.scratch);

        while self.pending.len() >= self.frame_samples {
            let frame: Vec<f32> = self.pending.drain(..self.frame_samples).collect();
            match self.tx.try_send(frame) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
    }
}

fn run_capture(
    device: cpal::Device,
    default_config: cpal::SupportedStreamConfig,
    config: CaptureConfig,
    shared: Arc<Shared>,
    queue: Arc<ChunkQueue>,
    ready_tx: mpsc::Sender<Result<(), AudioError>>,
) {
    let format = default_config.sample_format();
    let device_config: StreamConfig = default_config.into();
    let device_rate = device_config.sample_rate.0;
    let channels = usize::from(device_config.channels.max(1));

    let device_frame_samples = ((u64::from(device_rate) * config.chunk_ms) / 1000).max(1) as usize;
    let chunk_samples =
        ((u64::from(STREAM_SAMPLE_RATE) * config.chunk_ms) / 1000).max(1) as usize;

    tracing::debug!(
        ?format,
        device_rate,
        channels,
        "opening capture stream"
    );

    // The callback only converts and forwards; everything else happens here.
    let (frame_tx, frame_rx) = bounded::<Vec<f32>>(32);
    let err_fn = |err| tracing::warn!("audio stream error: {err}");

    let stream = match format {
        SampleFormat::F32 => {
            let mut pump = FramePump::new(device_frame_samples, channels, frame_tx);
            device.build_input_stream(
                &device_config,
                move |data: &[f32], _| pump.push(data, |s| s),
                err_fn,
                None,
            )
        }
        SampleFormat::I16 => {
            let mut pump = FramePump::new(device_frame_samples, channels, frame_tx);
            device.build_input_stream(
                &device_config,
                move |data: &[i16], _| pump.push(data, |s| s as f32 / 32_768.0),
                err_fn,
                None,
            )
        }
        SampleFormat::U16 => {
            let mut pump = FramePump::new(device_frame_samples, channels, frame_tx);
            device.build_input_stream(
                &device_config,
                move |data: &[u16], _| pump.push(data, |s| (s as f32 - 32_768.0) / 32_768.0),
                err_fn,
                None,
            )
        }
        other => {
            let _ = ready_tx.send(Err(AudioError::FormatUnsupported(format!("{other:?}"))));
            queue.close();
            return;
        }
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(map_build_error(e)));
            queue.close();
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(AudioError::Stream(e.to_string())));
        queue.close();
        return;
    }
    let _ = ready_tx.send(Ok(()));

    let mut assembly: Vec<f32> = Vec::with_capacity(chunk_samples * 2);
    let mut offset_samples: u64 = 0;
    let wait = Duration::from_millis(config.chunk_ms);

    while !shared.stop.load(Ordering::Acquire) {
        match frame_rx.recv_timeout(wait) {
            Ok(frame) => {
                let resampled = resample_to_stream_rate(&frame, device_rate);
                if resampled.is_empty() {
                    continue;
                }
                shared.update_peak(&resampled);
                shared.preroll.lock().extend(&resampled);

                if shared.gate_open.load(Ordering::Acquire) {
                    assembly.extend_from_slice(&resampled);
                    while assembly.len() >= chunk_samples {
                        let block: Vec<f32> = assembly.drain(..chunk_samples).collect();
                        let chunk = AudioChunk::new(encode_pcm_s16le(&block), offset_samples);
                        offset_samples += chunk_samples as u64;
                        queue.push(chunk);
                    }
                } else if !assembly.is_empty() {
                    // Gated audio stays in the pre-roll only
                    assembly.clear();
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!("audio callback disconnected");
                break;
            }
        }
    }

    if let Err(e) = stream.pause() {
        tracing::debug!("failed to pause audio stream: {e}");
    }
    drop(stream);
    queue.close();
}

fn map_build_error(e: cpal::BuildStreamError) -> AudioError {
    let message = e.to_string();
    if message.to_ascii_lowercase().contains("permission") {
        AudioError::PermissionDenied(message)
    } else {
        match e {
            cpal::BuildStreamError::DeviceNotAvailable => AudioError::DeviceUnavailable,
            cpal::BuildStreamError::StreamConfigNotSupported => {
                AudioError::FormatUnsupported(message)
            }
            _ => AudioError::Stream(message),
        }
    }
}
