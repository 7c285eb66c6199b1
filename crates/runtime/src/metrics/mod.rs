//! In-process usage metrics
//!
//! Counters for provider calls, token usage, fallbacks, and pipeline runs.
//! Snapshots serialize to JSON for the status surface; shipping them anywhere
//! is a collaborator concern.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::TokenUsage;

#[derive(Debug, Default)]
struct ProviderCounters {
    calls: AtomicU64,
    failures: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    latency_ms_total: AtomicU64,
}

/// Process-lifetime usage metrics.
#[derive(Debug, Default)]
pub struct UsageMetrics {
    providers: DashMap<String, ProviderCounters>,
    fallbacks: AtomicU64,
    pipeline_runs: AtomicU64,
    pipeline_failures: AtomicU64,
}

impl UsageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self, provider: &str, usage: &TokenUsage, latency: Duration) {
        let counters = self.providers.entry(provider.to_string()).or_default();
        counters.calls.fetch_add(1, Ordering::Relaxed);
        counters
            .prompt_tokens
            .fetch_add(usage.prompt_tokens as u64, Ordering::Relaxed);
        counters
            .completion_tokens
            .fetch_add(usage.completion_tokens as u64, Ordering::Relaxed);
        counters
            .latency_ms_total
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, provider: &str) {
        self.providers
            .entry(provider.to_string())
            .or_default()
            .failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pipeline_run(&self, success: bool) {
        self.pipeline_runs.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.pipeline_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let providers = self
            .providers
            .iter()
            .map(|entry| {
                let c = entry.value();
                let calls = c.calls.load(Ordering::Relaxed);
                ProviderSnapshot {
                    provider: entry.key().clone(),
                    calls,
                    failures: c.failures.load(Ordering::Relaxed),
                    prompt_tokens: c.prompt_tokens.load(Ordering::Relaxed),
                    completion_tokens: c.completion_tokens.load(Ordering::Relaxed),
                    avg_latency_ms: if calls > 0 {
                        c.latency_ms_total.load(Ordering::Relaxed) / calls
                    } else {
                        0
                    },
                }
            })
            .collect();
        MetricsSnapshot {
            providers,
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            pipeline_runs: self.pipeline_runs.load(Ordering::Relaxed),
            pipeline_failures: self.pipeline_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    pub provider: String,
    pub calls: u64,
    pub failures: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub avg_latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub providers: Vec<ProviderSnapshot>,
    pub fallbacks: u64,
    pub pipeline_runs: u64,
    pub pipeline_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_and_tokens() {
        let metrics = UsageMetrics::new();
        let usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 20,
            total_tokens: 30,
        };
        metrics.record_call("groq", &usage, Duration::from_millis(40));
        metrics.record_call("groq", &usage, Duration::from_millis(60));
        metrics.record_failure("claude");
        metrics.record_fallback();
        metrics.record_pipeline_run(true);
        metrics.record_pipeline_run(false);

        let snap = metrics.snapshot();
        let groq = snap.providers.iter().find(|p| p.provider == "groq").unwrap();
        assert_eq!(groq.calls, 2);
        assert_eq!(groq.prompt_tokens, 20);
        assert_eq!(groq.avg_latency_ms, 50);
        let claude = snap
            .providers
            .iter()
            .find(|p| p.provider == "claude")
            .unwrap();
        assert_eq!(claude.failures, 1);
        assert_eq!(snap.fallbacks, 1);
        assert_eq!(snap.pipeline_runs, 2);
        assert_eq!(snap.pipeline_failures, 1);
    }
}
