//! Curated re-exports for embedding the runtime

pub use crate::config::RuntimeConfig;
pub use crate::extraction::{DocumentExtractor, ExtractionOutcome};
pub use crate::fetchers::forex::ForexRateSource;
pub use crate::fetchers::market::{MarketData, MarketDataProvider};
pub use crate::fetchers::search::{SearchProvider, SearchResult};
pub use crate::pipeline::{
    Photo, Pipeline, PipelineRequest, PipelineResponse, VisionAdapter,
};
pub use crate::routing::{PreflightResult, RoutingMode};
pub use crate::swarm::{SwarmManager, WorkerSpec};
pub use crate::types::{tenant_key, AuditVerdict, Badge, PipelineError, StageId};
pub use crate::watchtower::{ExecOptions, ExecWatchtower};
pub use crate::{Collaborators, PipelineRuntime};
