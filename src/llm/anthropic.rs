//! Anthropic-backed `LlmCapability` over the Messages API.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::error::LlmError;
use crate::llm::{CompletionRequest, LlmCapability};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client.
pub struct AnthropicCapability {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl AnthropicCapability {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: model.into(),
        }
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl LlmCapability for AnthropicCapability {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        // Per-user model override is explicit on the request, never ambient.
        let model = request
            .context
            .model_override
            .as_deref()
            .unwrap_or(&self.model);

        let mut body = json!({
            "model": model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{"role": "user", "content": request.prompt}],
        });
        if let Some(ref system) = request.system {
            body["system"] = json!(system);
        }

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        timeout: Duration::from_secs(30),
                    }
                } else {
                    LlmError::RequestFailed {
                        provider: "anthropic".into(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited {
                provider: "anthropic".into(),
                retry_after,
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                provider: "anthropic".into(),
                reason: format!("HTTP {status}: {text}"),
            });
        }

        let parsed: MessagesResponse = response.json().await.map_err(|e| {
            LlmError::InvalidResponse {
                provider: "anthropic".into(),
                reason: e.to_string(),
            }
        })?;

        let text: String = parsed
            .content
            .into_iter()
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: "anthropic".into(),
                reason: "empty completion".into(),
            });
        }

        Ok(text)
    }
}
