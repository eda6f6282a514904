use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{parse_json_text, CompletionProvider, CompletionRequest, CompletionResponse, Usage};
use crate::error::{Result, SpendsortError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    max_tokens: u32,
    messages: Vec<Message>,
    response_format: Value,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<Choice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, api_key: String, model: String, base_url: Option<String>) -> Self {
        Self {
            client,
            api_key,
            model,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn user_content(request: &CompletionRequest) -> Value {
        let Some(attachment) = &request.attachment else {
            return Value::String(request.prompt.clone());
        };
        let data_url = format!("data:{};base64,{}", attachment.media_type, attachment.base64());
        let part = if attachment.is_pdf() {
            json!({
                "type": "file",
                "file": {"filename": "document.pdf", "file_data": data_url}
            })
        } else {
            json!({"type": "image_url", "image_url": {"url": data_url}})
        };
        json!([{"type": "text", "text": request.prompt}, part])
    }

    fn error(&self, message: impl Into<String>) -> SpendsortError {
        SpendsortError::Completion {
            provider: "openai".into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let started = Instant::now();
        let body = ChatRequest {
            model: self.model.clone(),
            temperature: 0.1,
            max_tokens: request.max_output_tokens,
            messages: vec![
                Message {
                    role: "system",
                    content: Value::String(request.system.clone()),
                },
                Message {
                    role: "user",
                    content: Self::user_content(request),
                },
            ],
            response_format: json!({
                "type": "json_schema",
                "json_schema": {
                    "name": request.purpose,
                    "schema": request.schema,
                    "strict": false
                }
            }),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(self.error(format!("{status}: {text}")));
        }

        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| self.error("empty response"))?;
        let value = parse_json_text(content)?;
        let usage = parsed.usage.map(|u| (u.prompt_tokens, u.completion_tokens)).unwrap_or((0, 0));

        Ok(CompletionResponse {
            value,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            usage: Usage {
                input_tokens: usage.0,
                output_tokens: usage.1,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        })
    }
}
