//! Shared in-crate test fixtures
//!
//! Builds a full pipeline from scripted components so unit tests across
//! modules can exercise the orchestrator without any network.

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::extraction::{CachingExtractor, DocumentExtractionCache, PlainTextExtractor};
use crate::fetchers::forex::testing::StaticForex;
use crate::fetchers::forex::ForexFetcher;
use crate::fetchers::market::testing::StaticMarket;
use crate::fetchers::market::MarketDataFetcher;
use crate::fetchers::search::testing::ScriptedSearch;
use crate::fetchers::search::SearchCascade;
use crate::memory::MemoryManager;
use crate::metrics::UsageMetrics;
use crate::package::TenantPackageStore;
use crate::pipeline::{NoVision, Pipeline};
use crate::providers::testing::ScriptedAdapter;
use crate::providers::{ProviderChain, ProviderTag};
use crate::routing::PreflightRouter;

pub struct PipelineFixture {
    pub pipeline: Arc<Pipeline>,
    pub memory: Arc<MemoryManager>,
    pub store: Arc<TenantPackageStore>,
    pub metrics: Arc<UsageMetrics>,
}

/// A pipeline whose chain always answers with `reply`, with no market data
/// and no search hits.
pub fn pipeline_fixture(reply: &str) -> PipelineFixture {
    pipeline_fixture_with(reply, StaticMarket::unavailable(), ScriptedSearch::default())
}

/// A pipeline with a scripted chain, market source, and search provider.
pub fn pipeline_fixture_with(
    reply: &str,
    market: StaticMarket,
    search: ScriptedSearch,
) -> PipelineFixture {
    let config = RuntimeConfig::default();
    let metrics = Arc::new(UsageMetrics::new());
    let adapter: Arc<dyn crate::providers::ProviderAdapter> =
        Arc::new(ScriptedAdapter::always(ProviderTag::Groq, reply));
    let chain = Arc::new(ProviderChain::with_adapters(
        vec![adapter],
        config.providers.clone(),
        Arc::clone(&metrics),
    ));

    build_fixture(config, chain, market, search, metrics)
}

/// A pipeline with an empty provider chain (every LLM call fails).
pub fn pipeline_fixture_no_providers() -> PipelineFixture {
    let config = RuntimeConfig::default();
    let metrics = Arc::new(UsageMetrics::new());
    let chain = Arc::new(ProviderChain::with_adapters(
        vec![],
        config.providers.clone(),
        Arc::clone(&metrics),
    ));
    build_fixture(
        config,
        chain,
        StaticMarket::unavailable(),
        ScriptedSearch::default(),
        metrics,
    )
}

fn build_fixture(
    config: RuntimeConfig,
    chain: Arc<ProviderChain>,
    market: StaticMarket,
    search: ScriptedSearch,
    metrics: Arc<UsageMetrics>,
) -> PipelineFixture {
    let store = Arc::new(TenantPackageStore::new(config.store.clone()));
    let cache = Arc::new(DocumentExtractionCache::new(config.extraction.clone()));
    let extractor = Arc::new(CachingExtractor::new(Arc::new(PlainTextExtractor), cache));
    let memory = Arc::new(MemoryManager::new(
        Arc::clone(&chain),
        config.memory.clone(),
    ));
    let market = Arc::new(MarketDataFetcher::new(Arc::new(market), &config.fetchers));
    let forex = Arc::new(ForexFetcher::new(Arc::new(StaticForex { rate: 149.5 })));
    let mut fetcher_config = config.fetchers.clone();
    fetcher_config.fanout_spacing = std::time::Duration::from_millis(1);
    let search = Arc::new(SearchCascade::new(Arc::new(search), &fetcher_config));
    let router = Arc::new(PreflightRouter::new(
        Arc::clone(&chain),
        Arc::clone(&market),
        Arc::clone(&forex),
    ));

    let pipeline = Arc::new(Pipeline::new(
        config.pipeline.clone(),
        chain,
        router,
        Arc::clone(&memory),
        Arc::clone(&store),
        extractor,
        search,
        Arc::new(NoVision),
        Arc::clone(&metrics),
    ));

    PipelineFixture {
        pipeline,
        memory,
        store,
        metrics,
    }
}
