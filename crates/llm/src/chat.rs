//! OpenAI-style chat completion refiner
//!
//! Serves both OpenAI proper and DashScope's compatible-mode endpoint, which
//! speaks the same request and response shape.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{LlmError, TextRefiner, REFINE_PROMPT};

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const DASHSCOPE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions";

/// Chat-completion-backed refiner.
pub struct ChatCompletionRefiner {
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: Client,
}

impl ChatCompletionRefiner {
    pub fn openai(api_key: String, model: String, temperature: f32, max_tokens: u32) -> Self {
        Self {
            url: OPENAI_URL.to_string(),
            api_key,
            model,
            temperature,
            max_tokens,
            client: Client::new(),
        }
    }

    pub fn dashscope(api_key: String, model: String) -> Self {
        Self {
            url: DASHSCOPE_URL.to_string(),
            api_key,
            model,
            temperature: 0.3,
            max_tokens: 2000,
            client: Client::new(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[async_trait]
impl TextRefiner for ChatCompletionRefiner {
    async fn refine(&self, text: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
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
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
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

        let parsed: ChatResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::Api(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::Api("empty choices".into()))?;
        Ok(content.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let body = r#"{
            "choices": [ { "message": { "role": "assistant", "content": " Fixed text. " } } ]
        }"#;
        let parsed: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.choices[0].message.content.trim(), "Fixed text.");
    }
}
