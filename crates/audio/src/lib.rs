//! Microphone capture for the Vhisper voice input engine
//!
//! Delivers mono 16 kHz chunks through a bounded drop-oldest queue and keeps
//! a short pre-roll of recent audio so a freshly connected recognizer session
//! does not miss the first syllables. The cpal hardware callback never blocks
//! and never touches the network; format conversion and resampling happen on
//! a dedicated capture thread.

mod mic;
mod preroll;
mod queue;
mod resample;

pub use mic::{CaptureConfig, MicSource};
pub use preroll::PrerollRing;
pub use queue::ChunkQueue;
pub use resample::{downmix_to_mono, resample_to_stream_rate};

use std::sync::Arc;

use thiserror::Error;

/// Audio capture errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No input device available")]
    DeviceUnavailable,

    #[error("Unsupported device format: {0}")]
    FormatUnsupported(String),

    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio stream error: {0}")]
    Stream(String),
}

/// A running capture producing 16 kHz mono chunks.
///
/// The chunk stream is finite and non-restartable: it ends when [`stop`] is
/// called or the device errors out. Pausing closes the gate between the
/// device and the chunk queue while the pre-roll ring keeps filling, which
/// is what the pipeline wants while a recognizer session is being replaced.
///
/// [`stop`]: AudioSource::stop
pub trait AudioSource: Send + Sync {
    /// The bounded queue live chunks are delivered through
    fn chunks(&self) -> Arc<ChunkQueue>;

    /// Stop feeding the chunk queue; capture itself keeps running
    fn pause(&self);

    /// Resume feeding the chunk queue
    fn resume(&self);

    /// Take the buffered pre-roll as one s16le block, clearing the ring
    fn drain_preroll(&self) -> Vec<u8>;

    /// Peak absolute amplitude observed since capture started
    fn peak_amplitude(&self) -> f32;

    /// Chunks discarded because the queue was full
    fn dropped_chunks(&self) -> u64;

    /// Halt capture; idempotent
    fn stop(&mut self);
}
