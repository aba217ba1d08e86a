use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::warn;
use vocario_core::config::{LlmConfig, LlmProvider};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 512;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

/// One HTTP client for the three supported providers; only the wire shapes differ.
pub struct HttpLlmClient {
    client: Client,
    provider: LlmProvider,
    api_key: Option<SecretString>,
    base_url: String,
    model: String,
    max_retries: u32,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        if config.provider != LlmProvider::Ollama && config.api_key.is_none() {
            bail!("llm provider {:?} requires an api key", config.provider);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build llm http client")?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(config.provider).to_owned())
            .trim_end_matches('/')
            .to_owned();

        Ok(Self {
            client,
            provider: config.provider,
            api_key: config.api_key.clone(),
            base_url,
            model: config.model.clone(),
            max_retries: config.max_retries,
        })
    }

    fn endpoint(&self) -> String {
        let path = match self.provider {
            LlmProvider::Anthropic => "/v1/messages",
            LlmProvider::OpenAi => "/v1/chat/completions",
            LlmProvider::Ollama => "/api/chat",
        };
        format!("{}{path}", self.base_url)
    }

    async fn call_once(&self, body: &Value) -> Result<String> {
        let mut request = self.client.post(self.endpoint()).json(body);
        if let Some(api_key) = &self.api_key {
            request = match self.provider {
                LlmProvider::Anthropic => request
                    .header("x-api-key", api_key.expose_secret())
                    .header("anthropic-version", ANTHROPIC_VERSION),
                LlmProvider::OpenAi | LlmProvider::Ollama => {
                    request.bearer_auth(api_key.expose_secret())
                }
            };
        }

        let response = request.send().await.context("llm request failed")?;
        let status = response.status();
        if !status.is_success() {
            let detail: String =
                response.text().await.unwrap_or_default().chars().take(200).collect();
            bail!("llm provider returned {status}: {detail}");
        }
        let payload: Value = response.json().await.context("llm response is not json")?;
        response_text(self.provider, &payload)
            .ok_or_else(|| anyhow!("llm response has no text content"))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let body = request_body(self.provider, &self.model, system, prompt);
        let mut attempt = 0;
        loop {
            match self.call_once(&body).await {
                Ok(text) => return Ok(text),
                Err(error) if attempt < self.max_retries => {
                    warn!(
                        attempt,
                        error = %error,
                        provider = ?self.provider,
                        "llm call failed; retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

fn default_base_url(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::Anthropic => "https://api.anthropic.com",
        LlmProvider::OpenAi => "https://api.openai.com",
        LlmProvider::Ollama => "http://localhost:11434",
    }
}

fn request_body(provider: LlmProvider, model: &str, system: &str, prompt: &str) -> Value {
    match provider {
        LlmProvider::Anthropic => json!({
            "model": model,
            "max_tokens": MAX_TOKENS,
            "system": system,
            "messages": [{ "role": "user", "content": prompt }],
        }),
        LlmProvider::OpenAi => json!({
            "model": model,
            "max_tokens": MAX_TOKENS,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
        }),
        LlmProvider::Ollama => json!({
            "model": model,
            "stream": false,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
        }),
    }
}

fn response_text(provider: LlmProvider, payload: &Value) -> Option<String> {
    let text = match provider {
        LlmProvider::Anthropic => payload.pointer("/content/0/text"),
        LlmProvider::OpenAi => payload.pointer("/choices/0/message/content"),
        LlmProvider::Ollama => payload.pointer("/message/content"),
    }?;
    text.as_str().map(str::to_owned)
}
