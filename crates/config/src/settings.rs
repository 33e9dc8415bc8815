//! Main settings tree
//!
//! Shape of the canonical JSON:
//!
//! ```json
//! {
//!   "asr":    { "provider": "Qwen", "qwen": { "api_key": "...", "model": "..." } },
//!   "llm":    { "enabled": true, "provider": "DashScope", "dashscope": { ... } },
//!   "output": { "restore_clipboard": true, "paste_delay_ms": 50 },
//!   "engine": { ... }
//! }
//! ```
//!
//! Unknown keys are ignored; missing optional sections take their defaults.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, EngineTunables};

/// Root settings document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Recognizer selection and credentials
    #[serde(default)]
    pub asr: AsrSettings,

    /// Optional text enhancement
    #[serde(default)]
    pub llm: LlmSettings,

    /// Presentation hints, passed through to the host untouched
    #[serde(default)]
    pub output: OutputSettings,

    /// Engine tunables (timeouts, queue sizes)
    #[serde(default)]
    pub engine: EngineTunables,
}

impl Settings {
    /// Parse a JSON document, then layer `VHISPER_`-prefixed environment
    /// variables on top (`VHISPER_ASR__PROVIDER=FunAsr` and friends).
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(json, FileFormat::Json))
            .add_source(Environment::with_prefix("VHISPER").separator("__"))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate provider selections against their sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.asr.provider {
            AsrProvider::Qwen => {
                let qwen = self
                    .asr
                    .qwen
                    .as_ref()
                    .ok_or_else(|| ConfigError::MissingSection("asr.qwen".into()))?;
                if qwen.api_key.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "asr.qwen.api_key".into(),
                        message: "empty API key".into(),
                    });
                }
            }
            AsrProvider::DashScope => {
                let ds = self
                    .asr
                    .dashscope
                    .as_ref()
                    .ok_or_else(|| ConfigError::MissingSection("asr.dashscope".into()))?;
                if ds.api_key.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "asr.dashscope.api_key".into(),
                        message: "empty API key".into(),
                    });
                }
            }
            AsrProvider::OpenAiWhisper => {
                let openai = self
                    .asr
                    .openai
                    .as_ref()
                    .ok_or_else(|| ConfigError::MissingSection("asr.openai".into()))?;
                if openai.api_key.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "asr.openai.api_key".into(),
                        message: "empty API key".into(),
                    });
                }
            }
            AsrProvider::FunAsr => {
                let funasr = self
                    .asr
                    .funasr
                    .as_ref()
                    .ok_or_else(|| ConfigError::MissingSection("asr.funasr".into()))?;
                if funasr.endpoint.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "asr.funasr.endpoint".into(),
                        message: "empty endpoint".into(),
                    });
                }
            }
        }

        if self.llm.enabled {
            match self.llm.provider {
                LlmProvider::DashScope if self.llm.dashscope.is_none() => {
                    return Err(ConfigError::MissingSection("llm.dashscope".into()));
                }
                LlmProvider::OpenAi if self.llm.openai.is_none() => {
                    return Err(ConfigError::MissingSection("llm.openai".into()));
                }
                LlmProvider::Ollama if self.llm.ollama.is_none() => {
                    // Ollama runs locally; absent section means stock endpoint
                    tracing::debug!("llm.ollama section missing, using local defaults");
                }
                _ => {}
            }
        }

        self.engine.validate()?;
        Ok(())
    }
}

/// Available recognizer providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsrProvider {
    /// Qwen realtime transcription (DashScope realtime endpoint)
    Qwen,
    /// DashScope Paraformer streaming recognition
    DashScope,
    /// OpenAI Whisper, one-shot over HTTP
    #[serde(rename = "OpenAIWhisper")]
    OpenAiWhisper,
    /// Self-hosted FunASR two-pass websocket server
    FunAsr,
}

impl Default for AsrProvider {
    fn default() -> Self {
        AsrProvider::Qwen
    }
}

/// Recognizer settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AsrSettings {
    #[serde(default)]
    pub provider: AsrProvider,
    #[serde(default)]
    pub qwen: Option<QwenAsrSettings>,
    #[serde(default)]
    pub dashscope: Option<DashScopeAsrSettings>,
    #[serde(default)]
    pub openai: Option<OpenAiAsrSettings>,
    #[serde(default)]
    pub funasr: Option<FunAsrSettings>,
}

/// Qwen realtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QwenAsrSettings {
    pub api_key: String,
    #[serde(default = "default_qwen_asr_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_qwen_asr_model() -> String {
    "qwen3-asr-flash-realtime".to_string()
}

fn default_language() -> String {
    "zh".to_string()
}

/// DashScope Paraformer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashScopeAsrSettings {
    pub api_key: String,
    #[serde(default = "default_paraformer_model")]
    pub model: String,
}

fn default_paraformer_model() -> String {
    "paraformer-realtime-v2".to_string()
}

/// OpenAI Whisper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiAsrSettings {
    pub api_key: String,
    #[serde(default = "default_whisper_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_whisper_model() -> String {
    "whisper-1".to_string()
}

/// FunASR settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunAsrSettings {
    #[serde(default = "default_funasr_endpoint")]
    pub endpoint: String,
}

impl Default for FunAsrSettings {
    fn default() -> Self {
        Self {
            endpoint: default_funasr_endpoint(),
        }
    }
}

fn default_funasr_endpoint() -> String {
    "http://localhost:10096".to_string()
}

/// Available enhancement providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LlmProvider {
    DashScope,
    #[serde(rename = "OpenAI")]
    OpenAi,
    Ollama,
}

impl Default for LlmProvider {
    fn default() -> Self {
        LlmProvider::DashScope
    }
}

/// Enhancement settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default)]
    pub dashscope: Option<DashScopeLlmSettings>,
    #[serde(default)]
    pub openai: Option<OpenAiLlmSettings>,
    #[serde(default)]
    pub ollama: Option<OllamaSettings>,
}

/// DashScope chat settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashScopeLlmSettings {
    pub api_key: String,
    #[serde(default = "default_qwen_llm_model")]
    pub model: String,
}

fn default_qwen_llm_model() -> String {
    "qwen-plus".to_string()
}

/// OpenAI chat settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiLlmSettings {
    pub api_key: String,
    #[serde(default = "default_gpt_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_gpt_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    2000
}

/// Ollama settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaSettings {
    #[serde(default = "default_ollama_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            endpoint: default_ollama_endpoint(),
            model: default_ollama_model(),
        }
    }
}

fn default_ollama_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "qwen3:8b".to_string()
}

/// Presentation hints for the host's injector; the core never reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    #[serde(default = "default_true")]
    pub restore_clipboard: bool,
    #[serde(default = "default_paste_delay")]
    pub paste_delay_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_paste_delay() -> u64 {
    50
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            restore_clipboard: true,
            paste_delay_ms: default_paste_delay(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses() {
        let settings = Settings::from_json(
            r#"{ "asr": { "provider": "Qwen", "qwen": { "api_key": "sk-test" } } }"#,
        )
        .unwrap();
        assert_eq!(settings.asr.provider, AsrProvider::Qwen);
        assert_eq!(settings.asr.qwen.unwrap().model, "qwen3-asr-flash-realtime");
        assert!(!settings.llm.enabled);
        assert!(settings.output.restore_clipboard);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let settings = Settings::from_json(
            r#"{
                "asr": { "provider": "FunAsr", "funasr": {}, "future_field": 1 },
                "hotkey": { "binding": "Alt" }
            }"#,
        )
        .unwrap();
        assert_eq!(settings.asr.provider, AsrProvider::FunAsr);
        assert_eq!(
            settings.asr.funasr.unwrap().endpoint,
            "http://localhost:10096"
        );
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let err = Settings::from_json(
            r#"{ "asr": { "provider": "DashScope", "dashscope": { "api_key": "" } } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = Settings::from_json(r#"{ "asr": { "provider": "Qwen" } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection(_)));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = Settings::from_json(r#"{ "asr": { "provider": "Sphinx" } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_llm_section_required_when_enabled() {
        let err = Settings::from_json(
            r#"{
                "asr": { "provider": "FunAsr", "funasr": {} },
                "llm": { "enabled": true, "provider": "OpenAI" }
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection(_)));
    }
}
