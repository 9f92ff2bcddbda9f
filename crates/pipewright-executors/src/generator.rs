use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use pipewright_core::config::AiConfig;
use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::traits::TextGenerator;

/// OpenAI-compatible chat completions client. Works with OpenAI, Ollama, vLLM, Groq, etc.
pub struct HttpTextGenerator {
    http: Client,
    config: AiConfig,
}

impl HttpTextGenerator {
    pub fn new(config: AiConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl TextGenerator for HttpTextGenerator {
    fn generate(&self, prompt: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let body = ChatRequest {
                model: &self.config.model,
                messages: vec![ChatMessage {
                    role: "user",
                    content: &prompt,
                }],
                max_tokens: self.config.max_tokens,
                temperature: (self.config.temperature > 0.0).then_some(self.config.temperature),
                stream: false,
            };

            let mut req = self.http.post(self.endpoint()).json(&body);
            if let Some(api_key) = &self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req
                .send()
                .await
                .map_err(|e| PipewrightError::TextGeneration(format!("network error: {}", e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                warn!(status = %status, "Text generation request rejected");
                return Err(PipewrightError::TextGeneration(format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    text
                )));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| PipewrightError::TextGeneration(format!("invalid response: {}", e)))?;

            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| PipewrightError::TextGeneration("empty completion".to_string()))
        })
    }
}
