//! End-to-end pipeline scenarios against in-process mock collaborators

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use nyanclaw_runtime::config::RuntimeConfig;
use nyanclaw_runtime::fetchers::forex::ForexRateSource;
use nyanclaw_runtime::fetchers::market::{MarketData, MarketDataProvider, SeriesBars};
use nyanclaw_runtime::fetchers::search::{SearchProvider, SearchResult};
use nyanclaw_runtime::metrics::UsageMetrics;
use nyanclaw_runtime::providers::{
    CompletionRequest, CompletionResponse, ProviderAdapter, ProviderChain, ProviderTag,
};
use nyanclaw_runtime::routing::RoutingMode;
use nyanclaw_runtime::types::{
    AuditVerdict, Badge, FetchError, StageId, TokenUsage,
};
use nyanclaw_runtime::watchtower::ExecOptions;
use nyanclaw_runtime::{Collaborators, PipelineRequest, PipelineRuntime};

/// Adapter that pops scripted replies, repeating the last one forever.
struct SequencedAdapter {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
}

impl SequencedAdapter {
    fn new(replies: &[&str]) -> Arc<Self> {
        let last = replies.last().copied().unwrap_or("ok").to_string();
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            last: Mutex::new(last),
        })
    }
}

#[async_trait]
impl ProviderAdapter for SequencedAdapter {
    async fn call(&self, _request: &CompletionRequest) -> Result<CompletionResponse, nyanclaw_runtime::types::ProviderError> {
        let text = match self.replies.lock().pop_front() {
            Some(reply) => {
                *self.last.lock() = reply.clone();
                reply
            }
            None => self.last.lock().clone(),
        };
        Ok(CompletionResponse {
            text,
            model: "mock".to_string(),
            provider: ProviderTag::Groq,
            usage: TokenUsage {
                prompt_tokens: 12,
                completion_tokens: 24,
                total_tokens: 36,
            },
        })
    }

    fn tag(&self) -> ProviderTag {
        ProviderTag::Groq
    }

    fn default_model(&self) -> &str {
        "mock"
    }
}

struct StubMarket {
    bars: usize,
}

#[async_trait]
impl MarketDataProvider for StubMarket {
    async fn fetch(&self, ticker: &str) -> Result<MarketData, FetchError> {
        if self.bars == 0 {
            return Err(FetchError::MarketUnavailable {
                ticker: ticker.to_string(),
                reason: "no data".to_string(),
            });
        }
        let closes: Vec<f64> = (0..self.bars).map(|i| 100.0 + i as f64 * 0.4).collect();
        Ok(MarketData {
            ticker: ticker.to_string(),
            currency: Some("USD".to_string()),
            name: Some(format!("{ticker} Incorporated")),
            current_price: closes.last().copied(),
            end_date: Some("2026-08-01".to_string()),
            daily: SeriesBars {
                bar_count: closes.len(),
                closes,
                unavailable_reason: None,
            },
            weekly: SeriesBars {
                closes: (0..30).map(|i| 100.0 + i as f64).collect(),
                bar_count: 30,
                unavailable_reason: None,
            },
            fundamentals: serde_json::json!({}),
        })
    }
}

#[derive(Default)]
struct StubSearch {
    brave_queries: Mutex<Vec<String>>,
}

#[async_trait]
impl SearchProvider for StubSearch {
    async fn ddg(&self, _query: &str) -> Option<SearchResult> {
        None
    }

    async fn brave(&self, query: &str, _client_id: &str) -> Option<SearchResult> {
        self.brave_queries.lock().push(query.to_string());
        let text = if query.contains("price") {
            "listings average $3,500 per square meter in the city center"
        } else if query.contains("income") {
            "the median household earns about $70,000 per year"
        } else {
            return None;
        };
        Some(SearchResult {
            text: text.to_string(),
            results: Vec::new(),
            related: Vec::new(),
        })
    }
}

struct NoForex;

#[async_trait]
impl ForexRateSource for NoForex {
    async fn fetch_raw(
        &self,
        _base: &str,
        quote: &str,
    ) -> Result<(String, serde_json::Value), FetchError> {
        Ok((
            "mock-fx".to_string(),
            serde_json::json!({"rates": {quote: 149.5}}),
        ))
    }
}

fn fast_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.fetchers.fanout_spacing = Duration::from_millis(1);
    config
}

fn runtime_with(
    replies: &[&str],
    market_bars: usize,
    search: Arc<StubSearch>,
) -> PipelineRuntime {
    let config = fast_config();
    let metrics = Arc::new(UsageMetrics::new());
    let chain = Arc::new(ProviderChain::with_adapters(
        vec![SequencedAdapter::new(replies)],
        config.providers.clone(),
        Arc::clone(&metrics),
    ));
    let collaborators = Collaborators {
        market: Arc::new(StubMarket { bars: market_bars }),
        forex: Arc::new(NoForex),
        search: Some(search),
        extractor: Collaborators::degraded().extractor,
        vision: Collaborators::degraded().vision,
    };
    PipelineRuntime::with_chain(config, collaborators, chain, metrics)
}

fn request(query: &str, tenant: &str) -> PipelineRequest {
    PipelineRequest {
        query: query.to_string(),
        tenant_id: tenant.to_string(),
        session_id: Some(format!("session-{tenant}")),
        caller_id: "test-caller".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn scenario_hello_is_verified_general() {
    let runtime = runtime_with(&["Hello to you as well."], 0, Arc::new(StubSearch::default()));
    let response = runtime.run(request("hello", "t1")).await;

    assert!(response.success);
    assert_eq!(response.mode, RoutingMode::General);
    assert_eq!(response.badge, Badge::Verified);
    assert!(response.answer.trim_end().ends_with(']'));
    assert!(response.answer.contains("🔥 ~nyan ["));

    let packages = runtime.store.get_recent_packages("t1", 1);
    for stage in [
        StageId::ContextExtract,
        StageId::Preflight,
        StageId::ContextBuild,
        StageId::Reasoning,
        StageId::Audit,
        StageId::Personality,
        StageId::Output,
    ] {
        assert!(packages[0].read_stage(stage).is_some());
    }
    runtime.shutdown();
}

#[tokio::test]
async fn scenario_dollar_ticker_runs_the_indicator() {
    let runtime = runtime_with(&["unused"], 120, Arc::new(StubSearch::default()));
    let response = runtime.run(request("analyze $NVDA trend", "t1")).await;

    assert_eq!(response.mode, RoutingMode::PsiEma);
    assert_eq!(response.audit.verdict, AuditVerdict::Bypass);
    assert_eq!(response.badge, Badge::Verified);
    assert!(response.answer.contains("θ"));
    assert!(response.answer.contains("z (anomaly)"));
    assert!(response.answer.contains("R (convergence)"));
    runtime.shutdown();
}

#[tokio::test]
async fn scenario_ai_push_rescues_the_ticker() {
    let runtime = runtime_with(&["TICKER:NVDA"], 120, Arc::new(StubSearch::default()));
    let response = runtime
        .run(request("analyze the stock price trend for nvidia", "t1"))
        .await;

    assert_eq!(response.mode, RoutingMode::PsiEma);
    assert_eq!(response.preflight.ticker.as_deref(), Some("NVDA"));
    assert!(response.answer.contains("θ"));
    runtime.shutdown();
}

#[tokio::test]
async fn scenario_geo_comparison_builds_the_table() {
    let search = Arc::new(StubSearch::default());
    let runtime = runtime_with(&["unused"], 0, Arc::clone(&search));
    let response = runtime.run(request("LA vs NY housing price", "t1")).await;

    assert_eq!(response.mode, RoutingMode::SeedMetric);
    assert!(response.did_search);
    // 2 cities × 4 queries, all through Brave first
    assert_eq!(search.brave_queries.lock().len(), 8);
    assert!(response.answer.contains("| Los Angeles |"));
    assert!(response.answer.contains("| New York |"));
    // 3500 * 700 / 70000 = 35 years → FATALISM
    assert!(response.answer.contains("FATALISM"));
    runtime.shutdown();
}

#[tokio::test]
async fn scenario_forex_quotes_the_rate() {
    let runtime = runtime_with(
        &["The current USD/JPY rate is 149.50."],
        0,
        Arc::new(StubSearch::default()),
    );
    let response = runtime.run(request("USD/JPY rate?", "t1")).await;

    assert_eq!(response.mode, RoutingMode::Forex);
    assert_eq!(response.badge, Badge::Verified);
    let quote = response.preflight.forex_data.as_ref().unwrap();
    assert_eq!(quote.rate, Some(149.5));
    runtime.shutdown();
}

#[tokio::test]
async fn scenario_compound_query_merges_sections() {
    let runtime = runtime_with(&["A plain answer."], 120, Arc::new(StubSearch::default()));
    let response = runtime
        .run(request(
            "$SPY trend? also what is the capital of France?",
            "t1",
        ))
        .await;

    assert!(response.answer.contains("1. "));
    assert!(response.answer.contains("2. "));
    assert_eq!(response.answer.matches("🔥 ~nyan [").count(), 1);
    assert_eq!(response.badge, Badge::Verified);
    runtime.shutdown();
}

#[tokio::test]
async fn scenario_dangerous_exec_is_blocked() {
    let runtime = runtime_with(&["unused"], 0, Arc::new(StubSearch::default()));
    let result = runtime
        .watchtower
        .exec_foreground("rm -rf /", ExecOptions::default())
        .await;

    assert_eq!(result.exit_code, 1);
    assert!(result.stdout.is_empty());
    assert!(result.stderr.starts_with("[watchtower] blocked:"));
    assert_eq!(runtime.watchtower.registry_len(), 0);
    runtime.shutdown();
}

#[tokio::test]
async fn scenario_tenants_keep_eight_packages_and_stay_isolated() {
    let runtime = runtime_with(&["fine"], 0, Arc::new(StubSearch::default()));

    let (a, b) = tokio::join!(
        async {
            for _ in 0..9 {
                runtime.run(request("hello", "tenant-a")).await;
            }
        },
        async {
            for _ in 0..9 {
                runtime.run(request("hello", "tenant-b")).await;
            }
        }
    );
    let _ = (a, b);

    assert_eq!(runtime.store.package_count("tenant-a"), 8);
    assert_eq!(runtime.store.package_count("tenant-b"), 8);

    let a_packages = runtime.store.get_recent_packages("tenant-a", 8);
    assert!(a_packages.iter().all(|p| p.tenant_id() == "tenant-a"));
    runtime.shutdown();
}

#[tokio::test]
async fn zero_provider_chain_yields_unavailable() {
    let config = fast_config();
    let metrics = Arc::new(UsageMetrics::new());
    let chain = Arc::new(ProviderChain::with_adapters(
        vec![],
        config.providers.clone(),
        Arc::clone(&metrics),
    ));
    let runtime =
        PipelineRuntime::with_chain(config, Collaborators::degraded(), chain, metrics);
    let response = runtime.run(request("anything at all", "t1")).await;

    assert!(!response.success);
    assert_eq!(response.badge, Badge::Unavailable);
    assert!(response.answer.contains("🔥 ~nyan ["));
    runtime.shutdown();
}
