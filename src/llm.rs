//! LLM gateway: one completion call against an OpenAI-compatible chat endpoint.

use crate::config::LlmSettings;
use crate::error::{excerpt, LlmError};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

/// Parameters for one completion call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionParams {
    pub fn for_filters(settings: &LlmSettings) -> Self {
        Self {
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        }
    }

    pub fn for_sql(settings: &LlmSettings) -> Self {
        Self {
            temperature: settings.sql_temperature,
            max_tokens: settings.max_tokens,
        }
    }
}

/// A text-completion service. Settings are passed on every call; nothing is read globally.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        settings: &LlmSettings,
        system_instruction: &str,
        prompt: &str,
        params: CompletionParams,
    ) -> Result<String, LlmError>;
}

/// OpenAI-compatible `/chat/completions` client.
pub struct HttpGateway {
    client: reqwest::Client,
}

impl Default for HttpGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpGateway {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CompletionProvider for HttpGateway {
    async fn complete(
        &self,
        settings: &LlmSettings,
        system_instruction: &str,
        prompt: &str,
        params: CompletionParams,
    ) -> Result<String, LlmError> {
        let api_key = settings.credential().ok_or_else(|| {
            LlmError::AuthenticationFailed("no API key configured".to_string())
        })?;

        let body = serde_json::json!({
            "model": settings.model,
            "messages": [
                { "role": "system", "content": system_instruction },
                { "role": "user", "content": prompt }
            ],
            "temperature": params.temperature,
            "max_tokens": params.max_tokens
        });

        debug!(model = %settings.model, prompt_len = prompt.len(), "calling LLM");
        let response = self
            .client
            .post(format!("{}/chat/completions", settings.base_url.trim_end_matches('/')))
            .bearer_auth(api_key)
            .header("Content-Type", "application/json")
            .timeout(Duration::from_secs(settings.timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(%status, "LLM call rejected");
            return Err(classify_status(status, &detail));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::ProviderError(format!("failed to parse LLM response: {}", e)))?;

        extract_content(&response_json)
    }
}

fn classify_transport_error(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::ProviderUnavailable(format!("request timed out: {}", err))
    } else if err.is_connect() {
        LlmError::ProviderUnavailable(format!("connection failed: {}", err))
    } else {
        LlmError::ProviderError(err.to_string())
    }
}

fn classify_status(status: StatusCode, detail: &str) -> LlmError {
    let message = format!("HTTP {}: {}", status.as_u16(), excerpt(detail));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthenticationFailed(message),
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited(message),
        s if s.is_server_error() => LlmError::ProviderUnavailable(message),
        _ => LlmError::ProviderError(message),
    }
}

fn extract_content(response_json: &serde_json::Value) -> Result<String, LlmError> {
    response_json["choices"][0]["message"]["content"]
        .as_str()
        .map(|content| content.trim().to_string())
        .ok_or_else(|| LlmError::ProviderError("no content in LLM response".to_string()))
}
