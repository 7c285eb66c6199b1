//! Runtime configuration
//!
//! Every bounded registry and timeout in the runtime is driven by a config
//! struct here; the `Default` impls carry the normative constants. Provider
//! credentials are discovered from the environment, never stored in files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub providers: ProviderConfig,
    pub store: StoreConfig,
    pub extraction: ExtractionCacheConfig,
    pub memory: MemoryConfig,
    pub fetchers: FetcherConfig,
    pub pipeline: PipelineConfig,
    pub watchtower: WatchtowerConfig,
    pub swarm: SwarmConfig,
}

impl RuntimeConfig {
    /// Load from a TOML string (the CLI `--config` path reads one of these).
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

/// Provider chain configuration.
///
/// Credentials are read from the environment at startup; a provider joins
/// the chain only when its key is present (Ollama joins on a successful
/// reachability probe instead).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Network timeout for every provider call.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Max retries on HTTP 429 in `call_with_retry`.
    pub max_rate_limit_retries: u32,
    /// Backoff ceiling for 429 retries.
    #[serde(with = "humantime_serde")]
    pub backoff_cap: Duration,
    /// Base URL of the local model server, probed at startup.
    pub ollama_url: String,
    /// Probe timeout for the local model server.
    #[serde(with = "humantime_serde")]
    pub ollama_probe_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            max_rate_limit_retries: 3,
            backoff_cap: Duration::from_secs(8),
            ollama_url: "http://127.0.0.1:11434".to_string(),
            ollama_probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Tenant package store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Packages retained per tenant (the φ-8 window).
    pub window: usize,
    /// Tenant entry TTL after last activity.
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
    /// Background sweep interval.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Salt mixed into tenant key derivation.
    pub tenant_salt: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            window: 8,
            session_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            tenant_salt: "nyanclaw".to_string(),
        }
    }
}

/// Document extraction cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionCacheConfig {
    pub capacity: usize,
    /// Fraction of oldest entries evicted on overflow.
    pub eviction_fraction: f64,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for ExtractionCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            eviction_fraction: 0.20,
            ttl: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Per-session memory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Rolling message window per session.
    pub message_window: usize,
    /// Attachment log bound per session.
    pub attachment_window: usize,
    /// Message content truncation.
    pub max_message_chars: usize,
    /// Attachment extracted-text truncation.
    pub max_attachment_chars: usize,
    /// Attachment text bound applied on export.
    pub export_attachment_chars: usize,
    /// Summarize every Nth user query.
    pub summarize_every: u64,
    /// Concurrent session cap; LRU-evicted beyond this.
    pub max_sessions: usize,
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            message_window: 8,
            attachment_window: 8,
            max_message_chars: 50_000,
            max_attachment_chars: 100_000,
            export_attachment_chars: 2_000,
            summarize_every: 2,
            max_sessions: 500,
            session_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// External fetcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Hard kill for market data fetches.
    #[serde(with = "humantime_serde")]
    pub market_timeout: Duration,
    /// Spacing between requests in the rate-limited search fan-out.
    #[serde(with = "humantime_serde")]
    pub fanout_spacing: Duration,
    /// Token bucket capacity per (client, service).
    pub bucket_capacity: f64,
    /// Token bucket refill per second.
    pub bucket_refill_per_sec: f64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            market_timeout: Duration::from_secs(30),
            fanout_spacing: Duration::from_millis(350),
            bucket_capacity: 10.0,
            bucket_refill_per_sec: 0.5,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Max S3→S4→S2→S3 loop-backs per run.
    pub max_retries: u32,
    /// Reasoning call sampling temperature.
    pub reasoning_temperature: f32,
    /// Reasoning call token cap.
    pub reasoning_max_tokens: u32,
    /// Summary call token cap.
    pub summary_max_tokens: u32,
    /// Photos analyzed per run.
    pub max_photos: usize,
    /// Aggregate attachment text cap in the S2 prompt.
    pub max_attachment_prompt_chars: usize,
    /// Sub-queries allowed by the compound splitter.
    pub max_compound_parts: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            reasoning_temperature: 0.15,
            reasoning_max_tokens: 1500,
            summary_max_tokens: 300,
            max_photos: 5,
            max_attachment_prompt_chars: 100_000,
            max_compound_parts: 3,
        }
    }
}

/// Watchtower configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchtowerConfig {
    /// Workspace root; command paths outside it are rejected unless they
    /// begin with a safe system prefix.
    pub workspace_root: String,
    #[serde(with = "humantime_serde")]
    pub foreground_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub background_timeout: Duration,
    /// Per-stream output cap in bytes.
    pub max_output_bytes: usize,
    /// Background registry cap.
    pub max_background: usize,
    /// SIGTERM → SIGKILL grace period.
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,
    /// Completed entry retention.
    #[serde(with = "humantime_serde")]
    pub completed_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for WatchtowerConfig {
    fn default() -> Self {
        Self {
            workspace_root: "/tmp/nyanclaw-workspace".to_string(),
            foreground_timeout: Duration::from_secs(30),
            background_timeout: Duration::from_secs(120),
            max_output_bytes: 4096,
            max_background: 20,
            kill_grace: Duration::from_secs(5),
            completed_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Swarm configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Workers per swarm.
    pub max_workers: usize,
    /// Default token budget per swarm.
    pub default_token_budget: u64,
    /// Concurrent swarm cap.
    pub max_swarms: usize,
    /// Workers admitted concurrently within one swarm.
    pub worker_concurrency: usize,
    /// Completed swarm retention.
    #[serde(with = "humantime_serde")]
    pub completed_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            default_token_budget: 50_000,
            max_swarms: 5,
            worker_concurrency: 4,
            completed_ttl: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_the_documented_bounds() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.store.window, 8);
        assert_eq!(cfg.extraction.capacity, 100);
        assert_eq!(cfg.memory.message_window, 8);
        assert_eq!(cfg.memory.max_sessions, 500);
        assert_eq!(cfg.watchtower.max_background, 20);
        assert_eq!(cfg.swarm.max_swarms, 5);
        assert_eq!(cfg.swarm.default_token_budget, 50_000);
        assert_eq!(cfg.pipeline.max_retries, 1);
    }

    #[test]
    fn toml_round_trip_with_durations() {
        let text = r#"
            [store]
            window = 4
            session_ttl = "30m"

            [watchtower]
            foreground_timeout = "10s"
        "#;
        let cfg = RuntimeConfig::from_toml(text).unwrap();
        assert_eq!(cfg.store.window, 4);
        assert_eq!(cfg.store.session_ttl, Duration::from_secs(1800));
        assert_eq!(cfg.watchtower.foreground_timeout, Duration::from_secs(10));
        // untouched sections keep their defaults
        assert_eq!(cfg.extraction.capacity, 100);
    }
}
