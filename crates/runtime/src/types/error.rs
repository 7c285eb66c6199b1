//! Error types for the pipeline runtime

use std::time::Duration;
use thiserror::Error;

use super::{PackageId, RunId, StageId, SwarmId};

/// Top-level pipeline error type
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Package error: {0}")]
    Package(#[from] PackageError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Watchtower error: {0}")]
    Watchtower(#[from] WatchtowerError),

    #[error("Swarm error: {0}")]
    Swarm(#[from] SwarmError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Data package errors
#[derive(Error, Debug, Clone)]
pub enum PackageError {
    /// Write attempted after `finalize()`. Internal bug, always propagated.
    #[error("Package {package_id} is finalized; cannot write stage {stage}")]
    Finalized {
        package_id: PackageId,
        stage: StageId,
    },

    #[error("Snapshot restore failed: {0}")]
    SnapshotRestore(String),
}

/// Provider chain and adapter errors
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Authentication failed for {provider}: {message}")]
    Auth { provider: String, message: String },

    #[error("Request to {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Provider {provider} returned HTTP {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Response parse error from {provider}: {message}")]
    Parse { provider: String, message: String },

    #[error("Provider {0} is not configured")]
    NotConfigured(String),

    #[error("All providers in the chain failed")]
    AllProvidersFailed,

    #[error("Request failed for {provider}: {message}")]
    Request { provider: String, message: String },
}

impl ProviderError {
    /// True only for 429-style errors; these are the sole retryable kind.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }
}

/// External fetcher errors (market data, forex, search)
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Invalid ticker: {0:?}")]
    InvalidTicker(String),

    #[error("Market data fetch for {ticker} timed out after {timeout:?}")]
    MarketTimeout { ticker: String, timeout: Duration },

    #[error("Market data for {ticker} unavailable: {reason}")]
    MarketUnavailable { ticker: String, reason: String },

    #[error("Invalid forex pair: {0:?}")]
    InvalidPair(String),

    #[error("Forex fetch for {pair} failed: {reason}")]
    ForexFailed { pair: String, reason: String },

    #[error("Capacity denied for service {service}")]
    CapacityDenied { service: String },

    #[error("Response parse error: {0}")]
    Parse(String),
}

/// Watchtower execution errors.
///
/// Validation failures (dangerous command, path escape, blocked env) are
/// converted into blocked results and never surface as `Err` from the exec
/// entry points; the variants exist for the validator and registry internals.
#[derive(Error, Debug, Clone)]
pub enum WatchtowerError {
    #[error("empty command")]
    EmptyCommand,

    #[error("dangerous command pattern detected")]
    DangerousCommand,

    #[error("command path escapes the workspace: {0}")]
    PathEscape(String),

    #[error("environment override blocked: {0}")]
    EnvBlocked(String),

    #[error("background capacity full ({capacity} running entries)")]
    CapacityFull { capacity: usize },

    #[error("process not found: {0}")]
    NotFound(RunId),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),
}

/// Swarm errors
#[derive(Error, Debug, Clone)]
pub enum SwarmError {
    #[error("Too many tasks: {given} given, max {max}")]
    TooManyTasks { given: usize, max: usize },

    #[error("No tasks given")]
    NoTasks,

    #[error("Swarm capacity full ({capacity} active swarms)")]
    CapacityFull { capacity: usize },

    #[error("Swarm not found: {0}")]
    NotFound(SwarmId),

    #[error("Swarm {0} is not in a runnable state")]
    NotRunnable(SwarmId),
}

/// Seed-metric parse failures, surfaced when neither the LLM reply nor the
/// search snippets yield usable figures.
#[derive(Error, Debug, Clone)]
#[error("seed-metric parse failure for {city}: {reason}")]
pub struct SeedMetricParseFailure {
    pub city: String,
    pub reason: String,
}

/// Result alias used across the runtime
pub type PipelineResult<T> = Result<T, PipelineError>;
