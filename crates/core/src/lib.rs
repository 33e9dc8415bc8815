//! Core types for the Vhisper voice input engine
//!
//! This crate provides foundational types used across all other crates:
//! - Audio chunk types and PCM encoding helpers
//! - Pipeline states and host-visible events
//! - Transcript accumulation (confirmed text + mutable stash)

pub mod audio;
pub mod event;
pub mod transcript;

pub use audio::{encode_pcm_s16le, peak_amplitude, AudioChunk, STREAM_SAMPLE_RATE};
pub use event::{PipelineEvent, PipelineState};
pub use transcript::TranscriptAccumulator;
