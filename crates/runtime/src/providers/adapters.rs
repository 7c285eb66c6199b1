//! Per-provider adapters
//!
//! Each adapter maps a [`CompletionRequest`] onto the provider's wire
//! format, applies the right auth header, and parses the first-choice text
//! out of the response. Defaults models are per-adapter; the network timeout
//! comes from [`ProviderConfig`].

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::{CompletionRequest, CompletionResponse, ProviderTag};
use crate::config::ProviderConfig;
use crate::types::{ProviderError, TokenUsage};

/// One provider's request/response mapping.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn call(&self, request: &CompletionRequest)
        -> Result<CompletionResponse, ProviderError>;

    fn tag(&self) -> ProviderTag;

    fn default_model(&self) -> &str;
}

fn http_client(timeout: Duration, provider: &str) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Request {
            provider: provider.to_string(),
            message: format!("client build failed: {e}"),
        })
}

/// Send a prepared request and handle the shared status/parse plumbing:
/// 429 becomes `RateLimited` (honoring `retry-after`), 401/403 become
/// `Auth`, timeouts become `Timeout`, everything else non-2xx is `Http`.
async fn send_json(
    builder: reqwest::RequestBuilder,
    provider: &str,
    timeout: Duration,
) -> Result<Value, ProviderError> {
    let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Timeout {
                provider: provider.to_string(),
                timeout,
            }
        } else {
            ProviderError::Request {
                provider: provider.to_string(),
                message: e.to_string(),
            }
        }
    })?;

    let status = response.status();
    if status.as_u16() == 429 {
        let retry_after_ms = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000)
            .unwrap_or(0);
        return Err(ProviderError::RateLimited { retry_after_ms });
    }
    if status.as_u16() == 401 || status.as_u16() == 403 {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Auth {
            provider: provider.to_string(),
            message: body,
        });
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Http {
            provider: provider.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    response.json().await.map_err(|e| ProviderError::Parse {
        provider: provider.to_string(),
        message: e.to_string(),
    })
}

/// Build an OpenAI-style `messages` array from the request.
fn chat_messages(request: &CompletionRequest) -> Vec<Value> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.push(json!({"role": "user", "content": request.prompt}));
    messages
}

/// Parse `choices[0].message.content` + `usage` (OpenAI-compatible shape).
fn parse_openai_style(
    resp: &Value,
    provider: &str,
    fallback_model: &str,
) -> Result<(String, String, TokenUsage), ProviderError> {
    let text = resp
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Parse {
            provider: provider.to_string(),
            message: "no choices[0].message.content in response".to_string(),
        })?
        .to_string();

    let usage = resp
        .get("usage")
        .map(|u| TokenUsage {
            prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            completion_tokens: u
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            total_tokens: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
        })
        .unwrap_or_default();

    let model = resp
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or(fallback_model)
        .to_string();

    Ok((text, model, usage))
}

/// MiniMax chat completion adapter.
pub struct MinimaxAdapter {
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl MinimaxAdapter {
    pub fn new(api_key: String, config: &ProviderConfig) -> Self {
        Self {
            api_key,
            base_url: std::env::var("MINIMAX_BASE_URL")
                .unwrap_or_else(|_| "https://api.minimax.io/v1".to_string()),
            timeout: config.request_timeout,
        }
    }
}

#[async_trait]
impl ProviderAdapter for MinimaxAdapter {
    async fn call(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let model = request.model.as_deref().unwrap_or(self.default_model());
        let body = json!({
            "model": model,
            "messages": chat_messages(request),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        let client = http_client(self.timeout, "minimax")?;
        let resp = send_json(
            client
                .post(format!("{}/text/chatcompletion_v2", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body),
            "minimax",
            self.timeout,
        )
        .await?;

        // MiniMax carries API-level failures in base_resp with a 200 status
        if let Some(code) = resp
            .pointer("/base_resp/status_code")
            .and_then(Value::as_i64)
        {
            if code != 0 {
                let msg = resp
                    .pointer("/base_resp/status_msg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                return Err(ProviderError::Request {
                    provider: "minimax".to_string(),
                    message: format!("base_resp {code}: {msg}"),
                });
            }
        }

        let (text, model, usage) = parse_openai_style(&resp, "minimax", model)?;
        Ok(CompletionResponse {
            text,
            model,
            provider: ProviderTag::Minimax,
            usage,
        })
    }

    fn tag(&self) -> ProviderTag {
        ProviderTag::Minimax
    }

    fn default_model(&self) -> &str {
        "MiniMax-Text-01"
    }
}

/// Groq adapter (OpenAI-compatible endpoint).
pub struct GroqAdapter {
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl GroqAdapter {
    pub fn new(api_key: String, config: &ProviderConfig) -> Self {
        Self {
            api_key,
            base_url: std::env::var("GROQ_BASE_URL")
                .unwrap_or_else(|_| "https://api.groq.com/openai/v1".to_string()),
            timeout: config.request_timeout,
        }
    }
}

#[async_trait]
impl ProviderAdapter for GroqAdapter {
    async fn call(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let model = request.model.as_deref().unwrap_or(self.default_model());
        let body = json!({
            "model": model,
            "messages": chat_messages(request),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        let client = http_client(self.timeout, "groq")?;
        let resp = send_json(
            client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body),
            "groq",
            self.timeout,
        )
        .await?;

        let (text, model, usage) = parse_openai_style(&resp, "groq", model)?;
        Ok(CompletionResponse {
            text,
            model,
            provider: ProviderTag::Groq,
            usage,
        })
    }

    fn tag(&self) -> ProviderTag {
        ProviderTag::Groq
    }

    fn default_model(&self) -> &str {
        "llama-3.3-70b-versatile"
    }
}

/// Anthropic Messages API adapter.
pub struct ClaudeAdapter {
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl ClaudeAdapter {
    pub fn new(api_key: String, config: &ProviderConfig) -> Self {
        Self {
            api_key,
            base_url: std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com/v1".to_string()),
            timeout: config.request_timeout,
        }
    }
}

#[async_trait]
impl ProviderAdapter for ClaudeAdapter {
    async fn call(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let model = request.model.as_deref().unwrap_or(self.default_model());
        let mut body = json!({
            "model": model,
            "messages": [{"role": "user", "content": request.prompt}],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if let Some(system) = &request.system {
            body["system"] = Value::String(system.clone());
        }
        let client = http_client(self.timeout, "claude")?;
        let resp = send_json(
            client
                .post(format!("{}/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&body),
            "claude",
            self.timeout,
        )
        .await?;

        let text = resp
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::Parse {
                provider: "claude".to_string(),
                message: "no text content blocks in response".to_string(),
            })?;

        let usage = resp
            .get("usage")
            .map(|u| {
                let input = u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32;
                let output = u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32;
                TokenUsage {
                    prompt_tokens: input,
                    completion_tokens: output,
                    total_tokens: input + output,
                }
            })
            .unwrap_or_default();

        let model = resp
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_string();

        Ok(CompletionResponse {
            text,
            model,
            provider: ProviderTag::Claude,
            usage,
        })
    }

    fn tag(&self) -> ProviderTag {
        ProviderTag::Claude
    }

    fn default_model(&self) -> &str {
        "claude-sonnet-4-5"
    }
}

/// OpenAI chat completion adapter.
pub struct OpenAiAdapter {
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl OpenAiAdapter {
    pub fn new(api_key: String, config: &ProviderConfig) -> Self {
        Self {
            api_key,
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            timeout: config.request_timeout,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn call(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let model = request.model.as_deref().unwrap_or(self.default_model());
        let body = json!({
            "model": model,
            "messages": chat_messages(request),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        let client = http_client(self.timeout, "openai")?;
        let resp = send_json(
            client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body),
            "openai",
            self.timeout,
        )
        .await?;

        let (text, model, usage) = parse_openai_style(&resp, "openai", model)?;
        Ok(CompletionResponse {
            text,
            model,
            provider: ProviderTag::OpenAi,
            usage,
        })
    }

    fn tag(&self) -> ProviderTag {
        ProviderTag::OpenAi
    }

    fn default_model(&self) -> &str {
        "gpt-4o-mini"
    }
}

/// Local model server adapter (Ollama chat endpoint).
pub struct OllamaAdapter {
    base_url: String,
    timeout: Duration,
}

impl OllamaAdapter {
    pub fn new(base_url: String, config: &ProviderConfig) -> Self {
        Self {
            base_url,
            timeout: config.request_timeout,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    async fn call(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let model = request.model.as_deref().unwrap_or(self.default_model());
        let body = json!({
            "model": model,
            "messages": chat_messages(request),
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });
        let client = http_client(self.timeout, "ollama")?;
        let resp = send_json(
            client
                .post(format!("{}/api/chat", self.base_url))
                .json(&body),
            "ollama",
            self.timeout,
        )
        .await?;

        let text = resp
            .pointer("/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Parse {
                provider: "ollama".to_string(),
                message: "no message.content in response".to_string(),
            })?
            .to_string();

        let prompt_tokens = resp
            .get("prompt_eval_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let completion_tokens = resp.get("eval_count").and_then(Value::as_u64).unwrap_or(0) as u32;

        Ok(CompletionResponse {
            text,
            model: model.to_string(),
            provider: ProviderTag::Ollama,
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
        })
    }

    fn tag(&self) -> ProviderTag {
        ProviderTag::Ollama
    }

    fn default_model(&self) -> &str {
        "llama3.1"
    }
}
