//! reqwest-backed `ProviderClient`
//!
//! Speaks the three wire formats a `ProviderDescriptor` can declare. Each call
//! is exactly one HTTP request; any non-2xx response is handed back as an
//! `UpstreamFailure` with its body and headers intact so the classifier can
//! inspect them.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::Response;
use serde_json::{Value, json};
use tracing::debug;

use crate::descriptor::WireFormat;
use crate::{CompletionRequest, ProviderClient, UpstreamFailure};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Sampling temperature sent with every request.
pub const DEFAULT_TEMPERATURE: f64 = 0.3;

/// Completion cap for formats that require one.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct HttpClient {
    client: reqwest::Client,
    timeout: Duration,
    temperature: f64,
    max_tokens: u32,
}

impl HttpClient {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn build(&self, request: &CompletionRequest<'_>) -> reqwest::RequestBuilder {
        let provider = request.credential.provider();
        let base = provider.base_url.trim_end_matches('/');
        let key = request.credential.secret().expose();

        let builder = match provider.wire {
            WireFormat::OpenAiChat => self
                .client
                .post(format!("{base}/chat/completions"))
                .bearer_auth(key)
                .json(&json!({
                    "model": request.model,
                    "messages": [{"role": "user", "content": request.prompt}],
                    "temperature": self.temperature,
                })),
            WireFormat::AnthropicMessages => self
                .client
                .post(format!("{base}/v1/messages"))
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&json!({
                    "model": request.model,
                    "max_tokens": self.max_tokens,
                    "temperature": self.temperature,
                    "messages": [{"role": "user", "content": request.prompt}],
                })),
            WireFormat::GeminiGenerate => {
                let model = request
                    .model
                    .strip_prefix("models/")
                    .unwrap_or(request.model);
                self.client
                    .post(format!("{base}/v1beta/models/{model}:generateContent"))
                    .header("x-goog-api-key", key)
                    .json(&json!({
                        "contents": [{"role": "user", "parts": [{"text": request.prompt}]}],
                        "generationConfig": {
                            "temperature": self.temperature,
                            "thinkingConfig": {"thinkingBudget": 0},
                        },
                    }))
            }
        };
        builder.timeout(self.timeout)
    }
}

fn response_headers(response: &Response) -> Vec<(String, String)> {
    response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

fn transport_failure(error: reqwest::Error) -> UpstreamFailure {
    if error.is_timeout() {
        UpstreamFailure::timeout(error.to_string())
    } else {
        UpstreamFailure::network(error.to_string())
    }
}

/// Pull the generated text out of a successful response body.
fn extract_text(wire: WireFormat, body: &Value) -> Option<String> {
    let text = match wire {
        WireFormat::OpenAiChat => body
            .pointer("/choices/0/message/content")?
            .as_str()?
            .to_string(),
        WireFormat::AnthropicMessages => body
            .get("content")?
            .as_array()?
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect(),
        WireFormat::GeminiGenerate => body
            .pointer("/candidates/0/content/parts")?
            .as_array()?
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect(),
    };
    (!text.trim().is_empty()).then_some(text)
}

impl ProviderClient for HttpClient {
    fn complete<'a>(
        &'a self,
        request: CompletionRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String, UpstreamFailure>> + Send + 'a>> {
        Box::pin(async move {
            let wire = request.credential.provider().wire;
            let response = self.build(&request).send().await.map_err(transport_failure)?;

            let status = response.status();
            let headers = response_headers(&response);
            let body = response.text().await.map_err(transport_failure)?;

            if !status.is_success() {
                return Err(UpstreamFailure::http(status.as_u16(), body, headers));
            }

            let parsed: Value = serde_json::from_str(&body).map_err(|e| {
                UpstreamFailure::network(format!("unparseable response body: {e}"))
            })?;
            debug!(
                provider = %request.credential.provider_id(),
                model = %request.model,
                "upstream call succeeded"
            );
            extract_text(wire, &parsed)
                .ok_or_else(|| UpstreamFailure::network("response contained no text"))
        })
    }
}
