//! Ollama local refiner

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{LlmError, TextRefiner, REFINE_PROMPT};

/// Refiner backed by a local Ollama daemon.
pub struct OllamaRefiner {
    endpoint: String,
    model: String,
    client: Client,
}

impl OllamaRefiner {
    pub fn new(endpoint: String, model: String) -> Self {
        Self {
            endpoint,
            model,
            client: Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: Option<Message>,
    error: Option<String>,
}

#[async_trait]
impl TextRefiner for OllamaRefiner {
    async fn refine(&self, text: &str) -> Result<String, LlmError> {
        let url = format!("{}/api/chat", self.endpoint.trim_end_matches('/'));

        let request = OllamaChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: REFINE_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: text.to_string(),
                },
            ],
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Api(format!("HTTP {status}: {body}")));
        }

        let parsed: OllamaChatResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::Api(e.to_string()))?;
        if let Some(error) = parsed.error {
            return Err(LlmError::Api(error));
        }
        Ok(parsed
            .message
            .map(|m| m.content.trim().to_string())
            .unwrap_or_else(|| text.to_string()))
    }
}

/// Check that the daemon is up and the model is pulled.
pub async fn probe(endpoint: &str, model: &str) -> Result<String, LlmError> {
    let client = Client::new();
    let url = format!("{}/api/tags", endpoint.trim_end_matches('/'));

    let response = client
        .get(&url)
        .timeout(std::time::Duration::from_secs(5))
        .send()
        .await
        .map_err(|e| LlmError::Network(format!("cannot reach Ollama: {e}")))?;

    if !response.status().is_success() {
        return Err(LlmError::Api(format!(
            "Ollama error: HTTP {}",
            response.status()
        )));
    }

    let body = response
        .text()
        .await
        .map_err(|e| LlmError::Network(e.to_string()))?;

    #[derive(Deserialize)]
    struct TagsResponse {
        models: Option<Vec<ModelInfo>>,
    }

    #[derive(Deserialize)]
    struct ModelInfo {
        name: String,
    }

    let tags: TagsResponse =
        serde_json::from_str(&body).map_err(|e| LlmError::Api(e.to_string()))?;

    match tags.models {
        Some(models) => {
            if models.iter().any(|m| m.name.starts_with(model)) {
                Ok(format!("Ollama reachable, model {model} available"))
            } else {
                let available: Vec<_> = models.iter().map(|m| m.name.as_str()).collect();
                Err(LlmError::Api(format!(
                    "model {model} not found; available: {}",
                    available.join(", ")
                )))
            }
        }
        None => Ok("Ollama reachable".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_response_parsing() {
        let body = r#"{ "message": { "role": "assistant", "content": "cleaned" } }"#;
        let parsed: OllamaChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.message.unwrap().content, "cleaned");

        let body = r#"{ "error": "model not found" }"#;
        let parsed: OllamaChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.error.as_deref(), Some("model not found"));
    }
}
