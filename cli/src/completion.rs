//! Client for an OpenAI-compatible chat completions endpoint.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use crate::config::AiConfig;
use crate::upstream::{UpstreamError, http_client, send_json};

const SERVICE: &str = "AI completion";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    response_format: serde_json::Value,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

pub struct CompletionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl CompletionClient {
    pub fn new(config: &AiConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    /// Ask for a JSON-object answer and return the raw message content.
    #[instrument(skip_all, fields(model = %self.model))]
    pub async fn complete_json(&self, system: &str, user: &str) -> Result<String, UpstreamError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(UpstreamError::NotConfigured(SERVICE))?;

        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.2,
            response_format: json!({ "type": "json_object" }),
        };
        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body);

        let response: ChatResponse = send_json(SERVICE, request).await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| UpstreamError::failed(SERVICE, "response had no content"))?;
        debug!(chars = content.len(), "completion received");
        Ok(content)
    }
}
