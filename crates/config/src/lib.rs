//! Configuration for the Vhisper voice input engine
//!
//! The host hands the core one JSON document at `create` time; this crate
//! parses it into a typed tree, layers `VHISPER_`-prefixed environment
//! overrides on top, and validates that the selected providers actually
//! carry their credentials.

mod settings;
mod tunables;

pub use settings::{
    AsrProvider, AsrSettings, DashScopeAsrSettings, DashScopeLlmSettings, FunAsrSettings,
    LlmProvider, LlmSettings, OllamaSettings, OpenAiAsrSettings, OpenAiLlmSettings,
    OutputSettings, QwenAsrSettings, Settings,
};
pub use tunables::EngineTunables;

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing section: {0}")]
    MissingSection(String),
}
