//! Streaming coordinator for the Vhisper voice input engine
//!
//! This crate owns the state machine behind push-to-talk dictation:
//! - wiring microphone chunks into a live recognizer session
//! - seamless session replacement when the server ends a segment
//! - the terminal stop with its post-EOS watchdog
//! - cancellation that is observable before it returns

pub mod orchestrator;

pub use orchestrator::{EventCallback, SourceFactory, VoicePipeline};

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline is busy")]
    Busy,

    #[error("Audio error: {0}")]
    Audio(#[from] vhisper_audio::AudioError),

    #[error("Recognizer error: {0}")]
    Asr(#[from] vhisper_asr::AsrError),

    #[error("Enhancement error: {0}")]
    Llm(#[from] vhisper_llm::LlmError),

    #[error("Config error: {0}")]
    Config(#[from] vhisper_config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}
