use std::time::Duration;

use async_trait::async_trait;
use kcart_core::config::{LlmConfig, LlmProvider};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("llm transport failure: {0}")]
    Transport(String),
    #[error("llm provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm response could not be decoded: {0}")]
    Decode(String),
}

impl LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) => false,
        }
    }
}

/// A single system + user completion. Providers are expected to answer with
/// plain text; callers decide how to parse it.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError>;
}

#[derive(Clone, Debug)]
pub struct HttpLlmClient {
    http: reqwest::Client,
    provider: LlmProvider,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    max_retries: u32,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| LlmError::Transport(error.to_string()))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(config.provider).to_string());

        Ok(Self {
            http,
            provider: config.provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            max_retries: config.max_retries,
        })
    }

    async fn send_once(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let request = match self.provider {
            LlmProvider::OpenAi => self
                .http
                .post(format!("{}/v1/chat/completions", self.base_url))
                .bearer_auth(self.secret())
                .json(&json!({
                    "model": self.model,
                    "temperature": 0,
                    "response_format": { "type": "json_object" },
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": prompt },
                    ],
                })),
            LlmProvider::Anthropic => self
                .http
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", self.secret())
                .header("anthropic-version", "2023-06-01")
                .json(&json!({
                    "model": self.model,
                    "max_tokens": 1024,
                    "system": system,
                    "messages": [{ "role": "user", "content": prompt }],
                })),
            LlmProvider::Ollama => self.http.post(format!("{}/api/chat", self.base_url)).json(&json!({
                "model": self.model,
                "stream": false,
                "format": "json",
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": prompt },
                ],
            })),
        };

        let response =
            request.send().await.map_err(|error| LlmError::Transport(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status: status.as_u16(), body: truncate(&body, 300) });
        }

        let body =
            response.json::<Value>().await.map_err(|error| LlmError::Decode(error.to_string()))?;
        extract_text(self.provider, &body)
    }

    fn secret(&self) -> &str {
        self.api_key.as_ref().map(|key| key.expose_secret()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            match self.send_once(system, prompt).await {
                Ok(text) => return Ok(text),
                Err(error) if error.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        event_name = "llm.retry",
                        provider = self.provider.as_str(),
                        attempt,
                        error = %error,
                        "retrying llm completion"
                    );
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

fn default_base_url(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "https://api.openai.com",
        LlmProvider::Anthropic => "https://api.anthropic.com",
        LlmProvider::Ollama => "http://localhost:11434",
    }
}

fn extract_text(provider: LlmProvider, body: &Value) -> Result<String, LlmError> {
    let text = match provider {
        LlmProvider::OpenAi => body.pointer("/choices/0/message/content"),
        LlmProvider::Anthropic => body.pointer("/content/0/text"),
        LlmProvider::Ollama => body.pointer("/message/content"),
    };
    text.and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| LlmError::Decode(format!("no completion text in {} response", provider.as_str())))
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
