//! Streaming speech recognition clients
//!
//! One [`StreamingRecognizer`] implementation per provider, all normalized to
//! the same session contract: a control channel carrying audio and EOS, and
//! an event channel carrying confirmed/stash partials followed by at most one
//! final. Cloud providers speak their vendors' websocket protocols; Whisper
//! buffers the utterance and uploads it once at EOS.

mod funasr;
mod mock;
mod paraformer;
mod qwen;
mod traits;
mod whisper;

pub use funasr::{probe as probe_funasr, FunAsrRecognizer};
pub use mock::{MockRecognizer, MockScript, ScriptStep};
pub use paraformer::ParaformerRecognizer;
pub use qwen::{probe as probe_dashscope, QwenRecognizer};
pub use traits::{RecognizerEvent, Session, SessionControl, SessionHandle, StreamingRecognizer};
pub use whisper::{probe as probe_openai, WhisperRecognizer};

use std::sync::Arc;

use thiserror::Error;
use vhisper_config::{AsrProvider, AsrSettings};

/// Recognizer errors
#[derive(Error, Debug, Clone)]
pub enum AsrError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Audio encoding error: {0}")]
    Encoding(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Build the recognizer selected by the settings tree.
pub fn create_recognizer(
    settings: &AsrSettings,
) -> Result<Arc<dyn StreamingRecognizer>, AsrError> {
    match settings.provider {
        AsrProvider::Qwen => {
            let cfg = settings
                .qwen
                .as_ref()
                .ok_or_else(|| AsrError::Config("asr.qwen section missing".into()))?;
            Ok(Arc::new(QwenRecognizer::new(
                cfg.api_key.clone(),
                cfg.model.clone(),
                cfg.language.clone(),
            )))
        }
        AsrProvider::DashScope => {
            let cfg = settings
                .dashscope
                .as_ref()
                .ok_or_else(|| AsrError::Config("asr.dashscope section missing".into()))?;
            Ok(Arc::new(ParaformerRecognizer::new(
                cfg.api_key.clone(),
                cfg.model.clone(),
            )))
        }
        AsrProvider::OpenAiWhisper => {
            let cfg = settings
                .openai
                .as_ref()
                .ok_or_else(|| AsrError::Config("asr.openai section missing".into()))?;
            Ok(Arc::new(WhisperRecognizer::new(
                cfg.api_key.clone(),
                cfg.model.clone(),
                cfg.language.clone(),
            )))
        }
        AsrProvider::FunAsr => {
            let cfg = settings
                .funasr
                .as_ref()
                .ok_or_else(|| AsrError::Config("asr.funasr section missing".into()))?;
            Ok(Arc::new(FunAsrRecognizer::new(cfg.endpoint.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vhisper_config::Settings;

    #[test]
    fn test_factory_selects_provider() {
        let settings = Settings::from_json(
            r#"{ "asr": { "provider": "FunAsr", "funasr": {} } }"#,
        )
        .unwrap();
        assert!(create_recognizer(&settings.asr).is_ok());
    }

    #[test]
    fn test_factory_rejects_missing_section() {
        let settings = AsrSettings {
            provider: AsrProvider::Qwen,
            ..Default::default()
        };
        assert!(matches!(
            create_recognizer(&settings),
            Err(AsrError::Config(_))
        ));
    }
}
