//! nyanclaw pipeline runtime
//!
//! The core orchestration layer of the nyanclaw platform: a deterministic
//! eight-stage pipeline (S-1..S6) that routes multi-tenant conversational
//! queries through classification, external data fetches, LLM reasoning, an
//! LLM audit pass, and regex output normalization, recording every stage as
//! an immutable artifact in a bounded per-tenant history.

pub mod analysis;
pub mod config;
pub mod extraction;
pub mod fetchers;
pub mod memory;
pub mod metrics;
pub mod package;
pub mod pipeline;
pub mod prelude;
pub mod providers;
pub mod routing;
pub mod swarm;
pub mod types;
pub mod watchtower;

#[cfg(test)]
pub(crate) mod testkit;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use pipeline::{Pipeline, PipelineRequest, PipelineResponse};
pub use types::{Badge, PipelineError, PipelineResult, StageId};

use std::sync::Arc;
use tokio::task::JoinHandle;

use extraction::{CachingExtractor, DocumentExtractionCache, DocumentExtractor, PlainTextExtractor};
use fetchers::forex::{ForexFetcher, ForexRateSource};
use fetchers::market::{MarketDataFetcher, MarketDataProvider};
use fetchers::rate_limit::RateLimiter;
use fetchers::search::{HttpSearchProvider, SearchCascade, SearchProvider};
use memory::MemoryManager;
use metrics::UsageMetrics;
use package::TenantPackageStore;
use pipeline::{NoVision, VisionAdapter};
use providers::ProviderChain;
use routing::PreflightRouter;
use swarm::SwarmManager;
use watchtower::ExecWatchtower;

/// External collaborators injected into the runtime. Every seam has a
/// degraded default so the runtime boots with nothing configured.
pub struct Collaborators {
    pub market: Arc<dyn MarketDataProvider>,
    pub forex: Arc<dyn ForexRateSource>,
    pub search: Option<Arc<dyn SearchProvider>>,
    pub extractor: Arc<dyn DocumentExtractor>,
    pub vision: Arc<dyn VisionAdapter>,
}

/// Main runtime: owns every shared registry and the orchestrator, plus the
/// background sweep tasks.
pub struct PipelineRuntime {
    pub pipeline: Arc<Pipeline>,
    pub swarm: Arc<SwarmManager>,
    pub watchtower: Arc<ExecWatchtower>,
    pub store: Arc<TenantPackageStore>,
    pub memory: Arc<MemoryManager>,
    pub extraction_cache: Arc<DocumentExtractionCache>,
    pub chain: Arc<ProviderChain>,
    pub metrics: Arc<UsageMetrics>,
    sweepers: Vec<JoinHandle<()>>,
}

impl PipelineRuntime {
    /// Assemble the runtime from config and collaborators, discovering the
    /// provider chain from the environment.
    pub async fn new(config: RuntimeConfig, collaborators: Collaborators) -> Self {
        let metrics = Arc::new(UsageMetrics::new());
        let chain = Arc::new(
            ProviderChain::from_env(config.providers.clone(), Arc::clone(&metrics)).await,
        );
        Self::with_chain(config, collaborators, chain, metrics)
    }

    /// Assemble with an explicit chain (tests and embedded deployments).
    pub fn with_chain(
        config: RuntimeConfig,
        collaborators: Collaborators,
        chain: Arc<ProviderChain>,
        metrics: Arc<UsageMetrics>,
    ) -> Self {
        let store = Arc::new(TenantPackageStore::new(config.store.clone()));
        let extraction_cache =
            Arc::new(DocumentExtractionCache::new(config.extraction.clone()));
        let extractor = Arc::new(CachingExtractor::new(
            collaborators.extractor,
            Arc::clone(&extraction_cache),
        ));
        let memory = Arc::new(MemoryManager::new(
            Arc::clone(&chain),
            config.memory.clone(),
        ));

        let rate_limiter = Arc::new(RateLimiter::new(&config.fetchers));
        let search_provider = collaborators
            .search
            .unwrap_or_else(|| Arc::new(HttpSearchProvider::new(Arc::clone(&rate_limiter))));
        let search = Arc::new(SearchCascade::new(search_provider, &config.fetchers));

        let market = Arc::new(MarketDataFetcher::new(
            collaborators.market,
            &config.fetchers,
        ));
        let forex = Arc::new(ForexFetcher::new(collaborators.forex));
        let router = Arc::new(PreflightRouter::new(
            Arc::clone(&chain),
            Arc::clone(&market),
            Arc::clone(&forex),
        ));

        let pipeline = Arc::new(Pipeline::new(
            config.pipeline.clone(),
            Arc::clone(&chain),
            router,
            Arc::clone(&memory),
            Arc::clone(&store),
            extractor,
            search,
            collaborators.vision,
            Arc::clone(&metrics),
        ));

        let swarm = Arc::new(SwarmManager::new(
            Arc::clone(&pipeline),
            Arc::clone(&memory),
            config.swarm.clone(),
        ));
        let watchtower = Arc::new(ExecWatchtower::new(config.watchtower.clone()));

        let sweepers = vec![
            store.spawn_sweeper(),
            extraction_cache.spawn_sweeper(),
            memory.spawn_sweeper(),
            watchtower.spawn_sweeper(),
            swarm.spawn_sweeper(),
        ];

        Self {
            pipeline,
            swarm,
            watchtower,
            store,
            memory,
            extraction_cache,
            chain,
            metrics,
            sweepers,
        }
    }

    /// Run one request through the orchestrator.
    pub async fn run(&self, request: PipelineRequest) -> PipelineResponse {
        self.pipeline.run(request).await
    }

    /// Stop the background sweepers. Registries stay readable afterwards.
    pub fn shutdown(&self) {
        for sweeper in &self.sweepers {
            sweeper.abort();
        }
        self.watchtower.clear_registry();
    }
}

impl Collaborators {
    /// Degraded defaults: no market data, no forex, HTTP search built at
    /// runtime construction, UTF-8-only extraction, no vision.
    pub fn degraded() -> Self {
        struct NoMarket;
        #[async_trait::async_trait]
        impl MarketDataProvider for NoMarket {
            async fn fetch(
                &self,
                ticker: &str,
            ) -> Result<fetchers::market::MarketData, types::FetchError> {
                Err(types::FetchError::MarketUnavailable {
                    ticker: ticker.to_string(),
                    reason: "no market data adapter configured".to_string(),
                })
            }
        }
        struct NoForex;
        #[async_trait::async_trait]
        impl ForexRateSource for NoForex {
            async fn fetch_raw(
                &self,
                base: &str,
                quote: &str,
            ) -> Result<(String, serde_json::Value), types::FetchError> {
                Err(types::FetchError::ForexFailed {
                    pair: format!("{base}/{quote}"),
                    reason: "no forex adapter configured".to_string(),
                })
            }
        }

        Self {
            market: Arc::new(NoMarket),
            forex: Arc::new(NoForex),
            search: None,
            extractor: Arc::new(PlainTextExtractor),
            vision: Arc::new(NoVision),
        }
    }
}
