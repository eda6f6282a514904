//! Structured-completion providers and the ordered fallback chain over them.

pub mod anthropic;
pub mod openai;
pub mod usage;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine;
use jsonschema::JSONSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Result, SpendsortError};
use crate::settings::{ProviderKind, ProviderSettings};

pub use usage::{UsageEvent, UsageLogger};

/// Binary input sent alongside the prompt (receipt image, statement PDF).
#[derive(Debug, Clone)]
pub struct Attachment {
    pub media_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn is_pdf(&self) -> bool {
        self.media_type == "application/pdf"
    }

    pub fn base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Short tag for usage accounting, e.g. `column_mapping`.
    pub purpose: &'static str,
    pub system: String,
    pub prompt: String,
    /// JSON schema the response object must satisfy.
    pub schema: Value,
    pub attachment: Option<Attachment>,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub value: Value,
    pub model: String,
    pub usage: Usage,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}

/// A typed completion plus which provider produced it.
#[derive(Debug, Clone)]
pub struct Completion<T> {
    pub data: T,
    pub provider: String,
    pub usage: Usage,
}

/// Providers tried in order; the first one to return a schema-valid object wins.
#[derive(Clone, Default)]
pub struct CompletionChain {
    providers: Vec<Arc<dyn CompletionProvider>>,
    usage: Option<UsageLogger>,
}

impl CompletionChain {
    pub fn new(providers: Vec<Arc<dyn CompletionProvider>>) -> Self {
        Self {
            providers,
            usage: None,
        }
    }

    pub fn with_usage_logger(mut self, logger: UsageLogger) -> Self {
        self.usage = Some(logger);
        self
    }

    /// Build the chain from settings, skipping providers without an API key.
    pub fn from_settings(settings: &[ProviderSettings], client: reqwest::Client) -> Self {
        let mut providers: Vec<Arc<dyn CompletionProvider>> = Vec::new();
        for provider in settings {
            let Some(api_key) = provider.resolve_api_key() else {
                info!(model = %provider.model, "Skipping completion provider without API key");
                continue;
            };
            match provider.kind {
                ProviderKind::OpenAi => providers.push(Arc::new(openai::OpenAiProvider::new(
                    client.clone(),
                    api_key,
                    provider.model.clone(),
                    provider.base_url.clone(),
                ))),
                ProviderKind::Anthropic => {
                    providers.push(Arc::new(anthropic::AnthropicProvider::new(
                        client.clone(),
                        api_key,
                        provider.model.clone(),
                        provider.base_url.clone(),
                    )))
                }
            }
        }
        Self::new(providers)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub async fn complete<T: DeserializeOwned>(
        &self,
        request: &CompletionRequest,
    ) -> Result<Completion<T>> {
        if self.providers.is_empty() {
            return Err(SpendsortError::CompletionExhausted(
                "no completion provider is configured".into(),
            ));
        }
        let mut failures = Vec::new();
        for provider in &self.providers {
            let started = Instant::now();
            let outcome = match provider.complete(request).await {
                Ok(response) => check_response::<T>(&request.schema, response),
                Err(e) => Err(e),
            };
            match outcome {
                Ok((data, model, usage)) => {
                    self.log_usage(provider.name(), &model, request.purpose, usage, true);
                    debug!(provider = provider.name(), purpose = request.purpose, "Completion succeeded");
                    return Ok(Completion {
                        data,
                        provider: provider.name().to_string(),
                        usage,
                    });
                }
                Err(e) => {
                    warn!(
                        provider = provider.name(),
                        purpose = request.purpose,
                        error = %e,
                        "Completion provider failed, trying next"
                    );
                    let usage = Usage {
                        duration_ms: started.elapsed().as_millis() as u64,
                        ..Default::default()
                    };
                    self.log_usage(provider.name(), "", request.purpose, usage, false);
                    failures.push(format!("{}: {e}", provider.name()));
                }
            }
        }
        Err(SpendsortError::CompletionExhausted(failures.join("; ")))
    }

    /// Wait for pending usage writes, if a logger is attached.
    pub async fn flush_usage(&self) {
        if let Some(logger) = &self.usage {
            logger.flush().await;
        }
    }

    fn log_usage(&self, provider: &str, model: &str, purpose: &str, usage: Usage, success: bool) {
        if let Some(logger) = &self.usage {
            logger.record(UsageEvent {
                provider: provider.to_string(),
                model: model.to_string(),
                purpose: purpose.to_string(),
                usage,
                success,
            });
        }
    }
}

fn check_response<T: DeserializeOwned>(
    schema: &Value,
    response: CompletionResponse,
) -> Result<(T, String, Usage)> {
    if !matches_schema(schema, &response.value)? {
        return Err(SpendsortError::Extraction(
            "completion response does not match the requested schema".into(),
        ));
    }
    let data = serde_json::from_value(response.value)?;
    Ok((data, response.model, response.usage))
}

pub fn matches_schema(schema: &Value, value: &Value) -> Result<bool> {
    let compiled = JSONSchema::compile(schema)
        .map_err(|e| SpendsortError::Validation(format!("invalid response schema: {e}")))?;
    Ok(compiled.is_valid(value))
}

/// Pull a JSON object out of model text that may be wrapped in a code fence.
pub(crate) fn parse_json_text(raw: &str) -> Result<Value> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    match serde_json::from_str::<Value>(body) {
        Ok(v) => Ok(v),
        Err(e) => {
            let start = body.find('{');
            let end = body.rfind('}');
            match (start, end) {
                (Some(s), Some(e2)) if e2 > s => Ok(serde_json::from_str(&body[s..=e2])?),
                _ => Err(SpendsortError::Extraction(format!("invalid JSON in completion: {e}"))),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Scripted provider: pops one canned outcome per call.
    pub struct FakeProvider {
        pub name: String,
        responses: Mutex<Vec<Result<Value>>>,
        pub calls: AtomicUsize,
        pub prompts: Mutex<Vec<String>>,
    }

    impl FakeProvider {
        pub fn new(name: &str, responses: Vec<Result<Value>>) -> Self {
            Self {
                name: name.to_string(),
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionProvider for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(SpendsortError::Completion {
                    provider: self.name.clone(),
                    message: "no scripted response".into(),
                });
            }
            let value = responses.remove(0)?;
            Ok(CompletionResponse {
                value,
                model: "fake-model".into(),
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    duration_ms: 1,
                },
            })
        }
    }

    pub fn chain_of(providers: Vec<Arc<FakeProvider>>) -> CompletionChain {
        CompletionChain::new(
            providers
                .into_iter()
                .map(|p| p as Arc<dyn CompletionProvider>)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::testing::*;
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Answer {
        answer: String,
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            purpose: "test",
            system: "sys".into(),
            prompt: "question".into(),
            schema: json!({
                "type": "object",
                "required": ["answer"],
                "properties": {"answer": {"type": "string"}}
            }),
            attachment: None,
            max_output_tokens: 100,
        }
    }

    fn provider_error(name: &str) -> SpendsortError {
        SpendsortError::Completion {
            provider: name.into(),
            message: "503".into(),
        }
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let primary = Arc::new(FakeProvider::new("primary", vec![Ok(json!({"answer": "a"}))]));
        let fallback = Arc::new(FakeProvider::new("fallback", vec![Ok(json!({"answer": "b"}))]));
        let chain = chain_of(vec![primary.clone(), fallback.clone()]);
        let got: Completion<Answer> = chain.complete(&request()).await.unwrap();
        assert_eq!(got.data.answer, "a");
        assert_eq!(got.provider, "primary");
        assert_eq!(fallback.call_count(), 0);
    }

    #[tokio::test]
    async fn test_falls_through_on_error() {
        let primary = Arc::new(FakeProvider::new("primary", vec![Err(provider_error("primary"))]));
        let fallback = Arc::new(FakeProvider::new("fallback", vec![Ok(json!({"answer": "b"}))]));
        let chain = chain_of(vec![primary.clone(), fallback.clone()]);
        let got: Completion<Answer> = chain.complete(&request()).await.unwrap();
        assert_eq!(got.data.answer, "b");
        assert_eq!(got.provider, "fallback");
        assert_eq!(primary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_falls_through_on_schema_mismatch() {
        let primary = Arc::new(FakeProvider::new("primary", vec![Ok(json!({"wrong": 1}))]));
        let fallback = Arc::new(FakeProvider::new("fallback", vec![Ok(json!({"answer": "ok"}))]));
        let chain = chain_of(vec![primary, fallback]);
        let got: Completion<Answer> = chain.complete(&request()).await.unwrap();
        assert_eq!(got.data.answer, "ok");
    }

    #[tokio::test]
    async fn test_exhaustion_reports_every_provider() {
        let primary = Arc::new(FakeProvider::new("primary", vec![Err(provider_error("primary"))]));
        let fallback = Arc::new(FakeProvider::new("fallback", vec![Err(provider_error("fallback"))]));
        let chain = chain_of(vec![primary, fallback]);
        let err = chain.complete::<Answer>(&request()).await.unwrap_err();
        match err {
            SpendsortError::CompletionExhausted(msg) => {
                assert!(msg.contains("primary"));
                assert!(msg.contains("fallback"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_chain_is_exhausted() {
        let chain = CompletionChain::default();
        assert!(chain.is_empty());
        let err = chain.complete::<Answer>(&request()).await.unwrap_err();
        assert!(matches!(err, SpendsortError::CompletionExhausted(_)));
    }

    #[test]
    fn test_from_settings_skips_unconfigured() {
        let settings = vec![
            ProviderSettings {
                kind: ProviderKind::OpenAi,
                model: "m".into(),
                api_key: None,
                api_key_env: Some("SPENDSORT_TEST_NO_SUCH_KEY".into()),
                base_url: None,
            },
            ProviderSettings {
                kind: ProviderKind::Anthropic,
                model: "m".into(),
                api_key: Some("key".into()),
                api_key_env: None,
                base_url: None,
            },
        ];
        let chain = CompletionChain::from_settings(&settings, reqwest::Client::new());
        assert_eq!(chain.providers.len(), 1);
        assert_eq!(chain.providers[0].name(), "anthropic");
    }

    #[test]
    fn test_parse_json_text_strips_fences() {
        let v = parse_json_text("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(v["a"], 1);
        let v = parse_json_text("Here you go: {\"a\": 2} thanks").unwrap();
        assert_eq!(v["a"], 2);
        assert!(parse_json_text("no json here").is_err());
    }
}
