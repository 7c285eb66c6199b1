//! LLM provider chain with ordered fallback
//!
//! The chain is an ordered list of provider tags discovered at startup from
//! credential presence (plus a reachability probe for the local model
//! server). `call` iterates the chain and falls through on error; the chain
//! list itself is swapped atomically so live updates only affect subsequent
//! calls (copy-on-read snapshot semantics).

pub mod adapters;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ProviderConfig;
use crate::metrics::UsageMetrics;
use crate::types::{ProviderError, TokenUsage};

pub use adapters::{
    ClaudeAdapter, GroqAdapter, MinimaxAdapter, OllamaAdapter, OpenAiAdapter, ProviderAdapter,
};

/// Provider tags, in the startup discovery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTag {
    Minimax,
    Groq,
    Claude,
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

impl ProviderTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderTag::Minimax => "minimax",
            ProviderTag::Groq => "groq",
            ProviderTag::Claude => "claude",
            ProviderTag::OpenAi => "openai",
            ProviderTag::Ollama => "ollama",
        }
    }
}

impl std::fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single completion request, mapped by each adapter onto its wire format.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            model: None,
            temperature: 0.3,
            max_tokens: 1024,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// First-choice text plus usage from a provider call.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub model: String,
    pub provider: ProviderTag,
    pub usage: TokenUsage,
}

/// Ordered provider chain with fallback.
pub struct ProviderChain {
    adapters: HashMap<ProviderTag, Arc<dyn ProviderAdapter>>,
    chain: ArcSwap<Vec<ProviderTag>>,
    metrics: Arc<UsageMetrics>,
    config: ProviderConfig,
}

impl ProviderChain {
    /// Discover the chain from the environment: each cloud provider joins
    /// when its credential is set; Ollama joins when the local server
    /// answers the probe.
    pub async fn from_env(config: ProviderConfig, metrics: Arc<UsageMetrics>) -> Self {
        let mut adapters: Vec<Arc<dyn ProviderAdapter>> = Vec::new();

        if let Ok(key) = std::env::var("MINIMAX_API_KEY") {
            adapters.push(Arc::new(MinimaxAdapter::new(key, &config)));
        }
        if let Ok(key) = std::env::var("GROQ_API_KEY") {
            adapters.push(Arc::new(GroqAdapter::new(key, &config)));
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            adapters.push(Arc::new(ClaudeAdapter::new(key, &config)));
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            adapters.push(Arc::new(OpenAiAdapter::new(key, &config)));
        }

        let ollama_url = std::env::var("OLLAMA_URL").unwrap_or_else(|_| config.ollama_url.clone());
        if Self::probe_ollama(&ollama_url, config.ollama_probe_timeout).await {
            adapters.push(Arc::new(OllamaAdapter::new(ollama_url, &config)));
        }

        let chain = Self::with_adapters(adapters, config, metrics);
        tracing::info!(chain = ?chain.chain_snapshot(), "provider chain discovered");
        chain
    }

    /// Build a chain from explicit adapters, in the given order. This is the
    /// seam tests use to inject mock providers.
    pub fn with_adapters(
        ordered: Vec<Arc<dyn ProviderAdapter>>,
        config: ProviderConfig,
        metrics: Arc<UsageMetrics>,
    ) -> Self {
        let order: Vec<ProviderTag> = ordered.iter().map(|a| a.tag()).collect();
        let adapters = ordered.into_iter().map(|a| (a.tag(), a)).collect();
        Self {
            adapters,
            chain: ArcSwap::from_pointee(order),
            metrics,
            config,
        }
    }

    async fn probe_ollama(url: &str, timeout: Duration) -> bool {
        let Ok(client) = reqwest::Client::builder().timeout(timeout).build() else {
            return false;
        };
        match client.get(format!("{url}/api/tags")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Replace the chain order. Takes effect for subsequent calls only;
    /// in-flight calls keep the snapshot they started with.
    pub fn set_dynamic_chain(&self, order: Vec<ProviderTag>) {
        let filtered: Vec<ProviderTag> = order
            .into_iter()
            .filter(|tag| {
                let known = self.adapters.contains_key(tag);
                if !known {
                    tracing::warn!(%tag, "dropping unconfigured provider from dynamic chain");
                }
                known
            })
            .collect();
        self.chain.store(Arc::new(filtered));
    }

    pub fn chain_snapshot(&self) -> Vec<ProviderTag> {
        self.chain.load().as_ref().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.load().is_empty()
    }

    /// Dispatch once to a specific provider, or walk the chain with
    /// fallback. Single attempt per adapter; chain exhaustion fails with
    /// `AllProvidersFailed`.
    pub async fn call(
        &self,
        request: &CompletionRequest,
        provider: Option<ProviderTag>,
    ) -> Result<CompletionResponse, ProviderError> {
        self.dispatch(request, provider, 0).await
    }

    /// Retry wrapper for the primary reasoning/audit path.
    ///
    /// Rate limiting is retried per adapter before the chain falls through
    /// to the next one: `retry-after` is honored when the provider sent
    /// one, otherwise exponential backoff capped at the configured ceiling,
    /// up to three retries. Every other error moves on (or propagates, for
    /// an explicit provider) unretried.
    pub async fn call_with_retry(
        &self,
        request: &CompletionRequest,
        provider: Option<ProviderTag>,
    ) -> Result<CompletionResponse, ProviderError> {
        self.dispatch(request, provider, self.config.max_rate_limit_retries)
            .await
    }

    async fn dispatch(
        &self,
        request: &CompletionRequest,
        provider: Option<ProviderTag>,
        max_retries: u32,
    ) -> Result<CompletionResponse, ProviderError> {
        if let Some(tag) = provider {
            let adapter = self
                .adapters
                .get(&tag)
                .ok_or_else(|| ProviderError::NotConfigured(tag.to_string()))?;
            return self
                .invoke_with_retry(adapter.as_ref(), request, max_retries)
                .await;
        }

        let snapshot = self.chain.load();
        for (i, tag) in snapshot.iter().enumerate() {
            let Some(adapter) = self.adapters.get(tag) else {
                continue;
            };
            match self
                .invoke_with_retry(adapter.as_ref(), request, max_retries)
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) => {
                    tracing::warn!(provider = %tag, error = %err, "provider failed, falling through");
                    self.metrics.record_failure(tag.as_str());
                    if i + 1 < snapshot.len() {
                        self.metrics.record_fallback();
                    }
                }
            }
        }
        Err(ProviderError::AllProvidersFailed)
    }

    /// One adapter invocation with the 429 retry loop around it.
    async fn invoke_with_retry(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &CompletionRequest,
        max_retries: u32,
    ) -> Result<CompletionResponse, ProviderError> {
        let mut attempt = 0u32;
        loop {
            match self.invoke(adapter, request).await {
                Ok(response) => return Ok(response),
                Err(ProviderError::RateLimited { retry_after_ms }) if attempt < max_retries => {
                    let backoff = if retry_after_ms > 0 {
                        Duration::from_millis(retry_after_ms)
                    } else {
                        let exp = Duration::from_secs(1) * 2u32.pow(attempt);
                        exp.min(self.config.backoff_cap)
                    };
                    tracing::debug!(
                        provider = %adapter.tag(),
                        attempt,
                        ?backoff,
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn invoke(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let start = Instant::now();
        let response = adapter.call(request).await?;
        self.metrics
            .record_call(adapter.tag().as_str(), &response.usage, start.elapsed());
        Ok(response)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scriptable adapter for unit tests: pops one canned outcome per call.
    pub struct ScriptedAdapter {
        tag: ProviderTag,
        outcomes: Mutex<Vec<Result<String, ProviderError>>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedAdapter {
        pub fn new(tag: ProviderTag, outcomes: Vec<Result<String, ProviderError>>) -> Self {
            let mut reversed = outcomes;
            reversed.reverse();
            Self {
                tag,
                outcomes: Mutex::new(reversed),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn always(tag: ProviderTag, text: &str) -> Self {
            Self {
                tag,
                outcomes: Mutex::new(vec![Ok(text.to_string())]),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        async fn call(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock();
            let outcome = if outcomes.len() == 1 {
                outcomes[0].as_ref().map(|s| s.clone()).map_err(clone_err)
            } else {
                outcomes
                    .pop()
                    .unwrap_or(Err(ProviderError::AllProvidersFailed))
            };
            outcome.map(|text| CompletionResponse {
                text,
                model: "scripted".to_string(),
                provider: self.tag,
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 20,
                    total_tokens: 30,
                },
            })
        }

        fn tag(&self) -> ProviderTag {
            self.tag
        }

        fn default_model(&self) -> &str {
            "scripted"
        }
    }

    fn clone_err(err: &ProviderError) -> ProviderError {
        match err {
            ProviderError::RateLimited { retry_after_ms } => ProviderError::RateLimited {
                retry_after_ms: *retry_after_ms,
            },
            other => ProviderError::Request {
                provider: "scripted".to_string(),
                message: other.to_string(),
            },
        }
    }

    pub fn chain_of(adapters: Vec<Arc<dyn ProviderAdapter>>) -> ProviderChain {
        ProviderChain::with_adapters(
            adapters,
            ProviderConfig::default(),
            Arc::new(UsageMetrics::new()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn chain_falls_through_to_next_provider() {
        let failing = Arc::new(ScriptedAdapter::new(
            ProviderTag::Groq,
            vec![Err(ProviderError::Request {
                provider: "groq".to_string(),
                message: "boom".to_string(),
            })],
        ));
        let working = Arc::new(ScriptedAdapter::always(ProviderTag::Claude, "hello"));
        let chain = chain_of(vec![failing.clone(), working.clone()]);

        let response = chain
            .call(&CompletionRequest::new("hi"), None)
            .await
            .unwrap();
        assert_eq!(response.text, "hello");
        assert_eq!(response.provider, ProviderTag::Claude);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_chain_fails_with_all_providers_failed() {
        let chain = chain_of(vec![]);
        let err = chain
            .call(&CompletionRequest::new("hi"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::AllProvidersFailed));
    }

    #[tokio::test]
    async fn explicit_provider_dispatches_once() {
        let a = Arc::new(ScriptedAdapter::always(ProviderTag::Groq, "from groq"));
        let b = Arc::new(ScriptedAdapter::always(ProviderTag::Claude, "from claude"));
        let chain = chain_of(vec![a, b.clone()]);

        let response = chain
            .call(&CompletionRequest::new("hi"), Some(ProviderTag::Claude))
            .await
            .unwrap();
        assert_eq!(response.text, "from claude");

        let err = chain
            .call(&CompletionRequest::new("hi"), Some(ProviderTag::Ollama))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn dynamic_chain_reorders_subsequent_calls() {
        let a = Arc::new(ScriptedAdapter::always(ProviderTag::Groq, "from groq"));
        let b = Arc::new(ScriptedAdapter::always(ProviderTag::Claude, "from claude"));
        let chain = chain_of(vec![a, b]);

        chain.set_dynamic_chain(vec![ProviderTag::Claude, ProviderTag::Groq]);
        let response = chain
            .call(&CompletionRequest::new("hi"), None)
            .await
            .unwrap();
        assert_eq!(response.text, "from claude");

        // unknown tags are dropped, not kept as dead entries
        chain.set_dynamic_chain(vec![ProviderTag::Ollama, ProviderTag::Groq]);
        assert_eq!(chain.chain_snapshot(), vec![ProviderTag::Groq]);
    }

    #[tokio::test]
    async fn rate_limit_is_retried_then_succeeds() {
        let adapter = Arc::new(ScriptedAdapter::new(
            ProviderTag::Groq,
            vec![
                Err(ProviderError::RateLimited { retry_after_ms: 1 }),
                Err(ProviderError::RateLimited { retry_after_ms: 1 }),
                Ok("recovered".to_string()),
            ],
        ));
        let chain = chain_of(vec![adapter.clone()]);

        let response = chain
            .call_with_retry(&CompletionRequest::new("hi"), Some(ProviderTag::Groq))
            .await
            .unwrap();
        assert_eq!(response.text, "recovered");
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_rate_limit_errors_are_not_retried() {
        let adapter = Arc::new(ScriptedAdapter::new(
            ProviderTag::Groq,
            vec![Err(ProviderError::Request {
                provider: "groq".to_string(),
                message: "bad".to_string(),
            })],
        ));
        let chain = chain_of(vec![adapter.clone()]);

        let err = chain
            .call_with_retry(&CompletionRequest::new("hi"), Some(ProviderTag::Groq))
            .await
            .unwrap_err();
        assert!(!err.is_rate_limit());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chain_walk_retries_rate_limits_in_place() {
        // no provider override: the retry loop must fire on the chain path
        let adapter = Arc::new(ScriptedAdapter::new(
            ProviderTag::Groq,
            vec![
                Err(ProviderError::RateLimited { retry_after_ms: 1 }),
                Ok("recovered in place".to_string()),
            ],
        ));
        let chain = chain_of(vec![adapter.clone()]);

        let response = chain
            .call_with_retry(&CompletionRequest::new("hi"), None)
            .await
            .unwrap();
        assert_eq!(response.text, "recovered in place");
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_falls_through_to_next_provider() {
        // first adapter rate-limits forever; after the retry budget the
        // chain moves on instead of failing the call
        let limited = Arc::new(ScriptedAdapter::new(
            ProviderTag::Groq,
            vec![Err(ProviderError::RateLimited { retry_after_ms: 1 })],
        ));
        let working = Arc::new(ScriptedAdapter::always(ProviderTag::Claude, "from claude"));
        let chain = chain_of(vec![limited.clone(), working.clone()]);

        let response = chain
            .call_with_retry(&CompletionRequest::new("hi"), None)
            .await
            .unwrap();
        assert_eq!(response.text, "from claude");
        // initial attempt plus max_rate_limit_retries
        assert_eq!(limited.calls.load(Ordering::SeqCst), 4);
        assert_eq!(working.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn plain_call_does_not_retry_rate_limits() {
        let limited = Arc::new(ScriptedAdapter::new(
            ProviderTag::Groq,
            vec![Err(ProviderError::RateLimited { retry_after_ms: 1 })],
        ));
        let working = Arc::new(ScriptedAdapter::always(ProviderTag::Claude, "fallback"));
        let chain = chain_of(vec![limited.clone(), working]);

        let response = chain
            .call(&CompletionRequest::new("hi"), None)
            .await
            .unwrap();
        assert_eq!(response.text, "fallback");
        assert_eq!(limited.calls.load(Ordering::SeqCst), 1);
    }
}
