//! LLM API HTTP Client
//!
//! Supports both the Anthropic messages API and OpenAI-compatible APIs.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::config::{LlmConfig, LlmProvider};
use crate::error::{Error, Result};
use crate::retry::{CircuitBreaker, RetryPolicy, retry_async};

use super::Completion;
use super::types::*;

/// HTTP completion client
pub struct LlmClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    provider: LlmProvider,
    max_tokens: u32,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl LlmClient {
    /// Create a new LLM client
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(Error::Http)?;

        let base_url = match &config.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => match config.provider {
                LlmProvider::Claude => "https://api.anthropic.com/v1".to_string(),
                LlmProvider::OpenAi => "https://api.openai.com/v1".to_string(),
            },
        };

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url,
            provider: config.provider.clone(),
            max_tokens: config.max_tokens,
            retry: RetryPolicy::default(),
            breaker: CircuitBreaker::with_defaults("llm"),
        })
    }

    /// Replace the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Get the model name
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the provider type
    pub fn provider(&self) -> &LlmProvider {
        &self.provider
    }

    fn build_request(&self, prompt: &str, options: &CompletionOptions) -> MessagesRequest {
        MessagesRequest {
            model: self.model.clone(),
            max_tokens: options.max_tokens.unwrap_or(self.max_tokens),
            system: options.system.clone(),
            messages: vec![Message::user(prompt)],
            temperature: options.temperature,
        }
    }

    async fn send_once(&self, request: MessagesRequest) -> Result<String> {
        match self.provider {
            LlmProvider::Claude => self.send_claude_request(request).await,
            LlmProvider::OpenAi => self.send_openai_request(request).await,
        }
    }

    /// Send request to the Anthropic messages API
    async fn send_claude_request(&self, request: MessagesRequest) -> Result<String> {
        let url = format!("{}/messages", self.base_url);
        debug!("Sending request to Claude API: {}", url);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(Error::Http)?;

        let status = response.status();
        let body = response.text().await.map_err(Error::Http)?;

        if !status.is_success() {
            warn!("Claude API error: {} - {}", status, body);
            return Err(classify_status(status, body));
        }

        let parsed: MessagesResponse = serde_json::from_str(&body).map_err(|e| {
            Error::LlmApi(format!("Failed to parse response: {} - {}", e, body))
        })?;

        info!(
            stop_reason = ?parsed.stop_reason,
            output_tokens = parsed.usage.as_ref().map(|u| u.output_tokens).unwrap_or(0),
            "Claude API response"
        );

        Ok(parsed.text())
    }

    /// Send request to an OpenAI-compatible API
    async fn send_openai_request(&self, request: MessagesRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!("Sending request to OpenAI-compatible API: {}", url);

        let openai_request = ChatCompletionRequest::from_messages_request(request);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&openai_request)
            .send()
            .await
            .map_err(Error::Http)?;

        let status = response.status();
        let body = response.text().await.map_err(Error::Http)?;

        if !status.is_success() {
            warn!("OpenAI API error: {} - {}", status, body);
            return Err(classify_status(status, body));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
            Error::LlmApi(format!("Failed to parse response: {} - {}", e, body))
        })?;

        info!(
            finish_reason = ?parsed.choices.first().and_then(|c| c.finish_reason.clone()),
            output_tokens = parsed.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
            "OpenAI API response"
        );

        Ok(parsed.text())
    }
}

/// 4xx other than rate limiting is the caller's fault and must not be retried
fn classify_status(status: reqwest::StatusCode, body: String) -> Error {
    if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
        Error::InvalidInput(format!("{}: {}", status, body))
    } else {
        Error::LlmApi(format!("{}: {}", status, body))
    }
}

#[async_trait]
impl Completion for LlmClient {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        retry_async(&self.retry, "llm.complete", || {
            let request = self.build_request(prompt, options);
            self.breaker.call(move || self.send_once(request))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_base_urls() {
        let claude = LlmClient::new(&LlmConfig::default()).unwrap();
        assert_eq!(claude.base_url, "https://api.anthropic.com/v1");

        let openai = LlmClient::new(&LlmConfig {
            provider: LlmProvider::OpenAi,
            base_url: Some("http://localhost:8080/v1/".into()),
            ..LlmConfig::default()
        })
        .unwrap();
        assert_eq!(openai.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn test_build_request_uses_option_overrides() {
        let client = LlmClient::new(&LlmConfig::default()).unwrap();
        let options = CompletionOptions {
            system: Some("sys".into()),
            max_tokens: Some(64),
            temperature: Some(0.2),
        };
        let request = client.build_request("hello", &options);
        assert_eq!(request.max_tokens, 64);
        assert_eq!(request.system.as_deref(), Some("sys"));
        assert_eq!(request.messages, vec![Message::user("hello")]);
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        let err = classify_status(reqwest::StatusCode::BAD_REQUEST, "bad".into());
        assert!(!err.is_retryable());
        let err = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down".into());
        assert!(err.is_retryable());
    }
}
