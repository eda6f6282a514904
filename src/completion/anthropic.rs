use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{parse_json_text, CompletionProvider, CompletionRequest, CompletionResponse, Usage};
use crate::error::{Result, SpendsortError};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    system: String,
    messages: Vec<Value>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    model: Option<String>,
    content: Vec<ContentBlock>,
    usage: Option<MessagesUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct MessagesUsage {
    input_tokens: u64,
    output_tokens: u64,
}

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(client: reqwest::Client, api_key: String, model: String, base_url: Option<String>) -> Self {
        Self {
            client,
            api_key,
            model,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    /// The messages API has no schema-constrained mode here, so the schema
    /// travels in the system prompt.
    fn system_prompt(request: &CompletionRequest) -> String {
        format!(
            "{}\n\nRespond with a single JSON object and nothing else. It must satisfy this JSON schema:\n{}",
            request.system, request.schema
        )
    }

    fn user_message(request: &CompletionRequest) -> Value {
        let mut content = Vec::new();
        if let Some(attachment) = &request.attachment {
            let block_type = if attachment.is_pdf() { "document" } else { "image" };
            content.push(json!({
                "type": block_type,
                "source": {
                    "type": "base64",
                    "media_type": attachment.media_type,
                    "data": attachment.base64(),
                }
            }));
        }
        content.push(json!({"type": "text", "text": request.prompt}));
        json!({"role": "user", "content": content})
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let started = Instant::now();
        let body = MessagesRequest {
            model: self.model.clone(),
            max_tokens: request.max_output_tokens,
            temperature: 0.1,
            system: Self::system_prompt(request),
            messages: vec![Self::user_message(request)],
        };

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SpendsortError::Completion {
                provider: "anthropic".into(),
                message: format!("{status}: {text}"),
            });
        }

        let parsed: MessagesResponse = response.json().await?;
        let text: String = parsed
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        let value = parse_json_text(&text)?;
        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or((0, 0));

        Ok(CompletionResponse {
            value,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            usage: Usage {
                input_tokens,
                output_tokens,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        })
    }
}
