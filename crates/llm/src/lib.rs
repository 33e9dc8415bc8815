//! Transcript enhancement
//!
//! A single-shot rewrite of the final transcript through a language model:
//! punctuation, homophone fixes, dictation artifacts. Enhancement is strictly
//! best-effort: any failure, timeout or suspicious rewrite falls back to the
//! raw transcript with a logged warning, never an error to the host.

mod chat;
mod ollama;

pub use chat::ChatCompletionRefiner;
pub use ollama::{probe as probe_ollama, OllamaRefiner};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use vhisper_config::{LlmProvider, LlmSettings, OllamaSettings};

/// Enhancement errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// System prompt shared by all providers.
pub(crate) const REFINE_PROMPT: &str = "You clean up dictated text. Fix transcription \
mistakes, punctuation and obvious homophone errors while keeping the meaning and \
language of the input unchanged. Output only the corrected text, nothing else.";

/// A provider that can rewrite one transcript.
#[async_trait]
pub trait TextRefiner: Send + Sync {
    async fn refine(&self, text: &str) -> Result<String, LlmError>;
}

/// Build the refiner selected by the settings, or `None` when enhancement is
/// disabled.
pub fn create_refiner(
    settings: &LlmSettings,
) -> Result<Option<Arc<dyn TextRefiner>>, LlmError> {
    if !settings.enabled {
        return Ok(None);
    }
    let refiner: Arc<dyn TextRefiner> = match settings.provider {
        LlmProvider::DashScope => {
            let cfg = settings
                .dashscope
                .as_ref()
                .ok_or_else(|| LlmError::Config("llm.dashscope section missing".into()))?;
            Arc::new(ChatCompletionRefiner::dashscope(
                cfg.api_key.clone(),
                cfg.model.clone(),
            ))
        }
        LlmProvider::OpenAi => {
            let cfg = settings
                .openai
                .as_ref()
                .ok_or_else(|| LlmError::Config("llm.openai section missing".into()))?;
            Arc::new(ChatCompletionRefiner::openai(
                cfg.api_key.clone(),
                cfg.model.clone(),
                cfg.temperature,
                cfg.max_tokens,
            ))
        }
        LlmProvider::Ollama => {
            let cfg = settings.ollama.clone().unwrap_or_else(OllamaSettings::default);
            Arc::new(OllamaRefiner::new(cfg.endpoint, cfg.model))
        }
    };
    Ok(Some(refiner))
}

/// Timeout-and-fallback wrapper the pipeline applies to final transcripts.
pub struct Enhancer {
    refiner: Arc<dyn TextRefiner>,
    timeout: Duration,
}

impl Enhancer {
    pub fn new(refiner: Arc<dyn TextRefiner>, timeout: Duration) -> Self {
        Self { refiner, timeout }
    }

    /// Rewrite `text`, returning the original on any failure.
    pub async fn enhance(&self, text: &str) -> String {
        // Not worth a round trip for a couple of characters
        if text.trim().len() < 3 {
            return text.to_string();
        }

        let refined = match tokio::time::timeout(self.timeout, self.refiner.refine(text)).await {
            Ok(Ok(refined)) => refined.trim().to_string(),
            Ok(Err(e)) => {
                tracing::warn!("enhancement failed, keeping original: {e}");
                return text.to_string();
            }
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "enhancement timed out, keeping original");
                return text.to_string();
            }
        };

        // A rewrite that changes length wildly is the model going off-script
        let ratio = refined.len() as f32 / text.len() as f32;
        if refined.is_empty() || !(0.5..=2.0).contains(&ratio) {
            tracing::warn!(
                original_len = text.len(),
                refined_len = refined.len(),
                "enhancement length ratio out of bounds, keeping original"
            );
            return text.to_string();
        }
        refined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRefiner(String);

    #[async_trait]
    impl TextRefiner for FixedRefiner {
        async fn refine(&self, _text: &str) -> Result<String, LlmError> {
            Ok(self.0.clone())
        }
    }

    struct FailingRefiner;

    #[async_trait]
    impl TextRefiner for FailingRefiner {
        async fn refine(&self, _text: &str) -> Result<String, LlmError> {
            Err(LlmError::Network("offline".into()))
        }
    }

    struct SlowRefiner;

    #[async_trait]
    impl TextRefiner for SlowRefiner {
        async fn refine(&self, text: &str) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(text.to_string())
        }
    }

    #[tokio::test]
    async fn test_enhance_applies_rewrite() {
        let enhancer = Enhancer::new(
            Arc::new(FixedRefiner("hello, world.".into())),
            Duration::from_secs(1),
        );
        assert_eq!(enhancer.enhance("hello world").await, "hello, world.");
    }

    #[tokio::test]
    async fn test_enhance_falls_back_on_error() {
        let enhancer = Enhancer::new(Arc::new(FailingRefiner), Duration::from_secs(1));
        assert_eq!(enhancer.enhance("hello world").await, "hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn test_enhance_falls_back_on_timeout() {
        let enhancer = Enhancer::new(Arc::new(SlowRefiner), Duration::from_millis(100));
        assert_eq!(enhancer.enhance("hello world").await, "hello world");
    }

    #[tokio::test]
    async fn test_enhance_rejects_runaway_rewrite() {
        let runaway = "Sure! Here is the corrected text with an explanation of every change I made".to_string();
        let enhancer = Enhancer::new(Arc::new(FixedRefiner(runaway)), Duration::from_secs(1));
        assert_eq!(enhancer.enhance("hi there").await, "hi there");
    }

    #[tokio::test]
    async fn test_enhance_skips_tiny_input() {
        let enhancer = Enhancer::new(
            Arc::new(FixedRefiner("anything".into())),
            Duration::from_secs(1),
        );
        assert_eq!(enhancer.enhance("ok").await, "ok");
    }

    #[test]
    fn test_disabled_settings_yield_no_refiner() {
        let settings = LlmSettings::default();
        assert!(create_refiner(&settings).unwrap().is_none());
    }
}
