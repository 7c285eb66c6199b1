//! Web search adapters and cascade policies
//!
//! Two providers sit behind the [`SearchProvider`] trait: DuckDuckGo (free)
//! and Brave (credentialed, rate-limited). Both return `None` on zero
//! results or capacity denial, never an error; search failure is always
//! non-fatal to the pipeline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::FetcherConfig;
use crate::fetchers::rate_limit::RateLimiter;

/// Which search provider a routing decision selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    #[default]
    None,
    Duckduckgo,
    Brave,
}

/// A single search result item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultItem {
    pub title: String,
    pub url: String,
    pub description: String,
}

/// Aggregated search output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// Flattened text summary used directly in prompts.
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<SearchResultItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<String>,
}

/// Search adapter seam. Implementations return `None` on zero results or
/// capacity denial.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn ddg(&self, query: &str) -> Option<SearchResult>;
    async fn brave(&self, query: &str, client_id: &str) -> Option<SearchResult>;
}

/// HTTP-backed search provider: DuckDuckGo instant answers plus the Brave
/// web search API (key from `BRAVE_API_KEY`).
pub struct HttpSearchProvider {
    client: reqwest::Client,
    brave_key: Option<String>,
    rate_limiter: Arc<RateLimiter>,
}

impl HttpSearchProvider {
    pub fn new(rate_limiter: Arc<RateLimiter>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            brave_key: std::env::var("BRAVE_API_KEY").ok(),
            rate_limiter,
        }
    }
}

#[async_trait]
impl SearchProvider for HttpSearchProvider {
    async fn ddg(&self, query: &str) -> Option<SearchResult> {
        let response = self
            .client
            .get("https://api.duckduckgo.com/")
            .query(&[("q", query), ("format", "json"), ("no_html", "1")])
            .send()
            .await
            .ok()?;
        let body: Value = response.json().await.ok()?;

        let abstract_text = body
            .get("AbstractText")
            .and_then(Value::as_str)
            .unwrap_or("");
        let related: Vec<String> = body
            .get("RelatedTopics")
            .and_then(Value::as_array)
            .map(|topics| {
                topics
                    .iter()
                    .filter_map(|t| t.get("Text").and_then(Value::as_str))
                    .take(5)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if abstract_text.is_empty() && related.is_empty() {
            return None;
        }
        let mut text = abstract_text.to_string();
        for item in &related {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(item);
        }
        Some(SearchResult {
            text,
            results: Vec::new(),
            related,
        })
    }

    async fn brave(&self, query: &str, client_id: &str) -> Option<SearchResult> {
        let key = self.brave_key.as_ref()?;
        if !self.rate_limiter.consume(client_id, "brave") {
            tracing::debug!(client = client_id, "brave capacity denied");
            return None;
        }
        let response = self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .query(&[("q", query), ("count", "5")])
            .header("X-Subscription-Token", key)
            .header("Accept", "application/json")
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: Value = response.json().await.ok()?;

        let results: Vec<SearchResultItem> = body
            .pointer("/web/results")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(SearchResultItem {
                            title: item.get("title")?.as_str()?.to_string(),
                            url: item.get("url")?.as_str()?.to_string(),
                            description: item
                                .get("description")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        if results.is_empty() {
            return None;
        }
        let text = results
            .iter()
            .map(|r| format!("{}: {}", r.title, r.description))
            .collect::<Vec<_>>()
            .join("\n");
        Some(SearchResult {
            text,
            results,
            related: Vec::new(),
        })
    }
}

/// Cascade policies over the two providers.
pub struct SearchCascade {
    provider: Arc<dyn SearchProvider>,
    fanout_spacing: Duration,
}

impl SearchCascade {
    pub fn new(provider: Arc<dyn SearchProvider>, config: &FetcherConfig) -> Self {
        Self {
            provider,
            fanout_spacing: config.fanout_spacing,
        }
    }

    /// Best-effort cascade: DDG first, Brave on null.
    pub async fn best_effort(&self, query: &str, client_id: &str) -> Option<SearchResult> {
        if let Some(result) = self.provider.ddg(query).await {
            return Some(result);
        }
        self.provider.brave(query, client_id).await
    }

    /// Rate-limited fan-out used by the seed-metric path: queries run
    /// sequentially with fixed spacing, Brave first and DDG as fallback,
    /// and each hit becomes a labeled block.
    pub async fn fan_out(&self, queries: &[String], client_id: &str) -> Vec<LabeledBlock> {
        let mut blocks = Vec::with_capacity(queries.len());
        for (i, query) in queries.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.fanout_spacing).await;
            }
            let result = match self.provider.brave(query, client_id).await {
                Some(result) => Some(result),
                None => self.provider.ddg(query).await,
            };
            if let Some(result) = result {
                blocks.push(LabeledBlock {
                    label: query.clone(),
                    text: result.text,
                });
            } else {
                tracing::debug!(query, "fan-out query returned nothing");
            }
        }
        blocks
    }
}

/// One fan-out hit, labeled with its originating query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledBlock {
    pub label: String,
    pub text: String,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Scriptable search provider: maps substrings of queries to results.
    #[derive(Default)]
    pub struct ScriptedSearch {
        pub ddg_hits: Vec<(String, String)>,
        pub brave_hits: Vec<(String, String)>,
        pub queries_seen: Mutex<Vec<String>>,
    }

    impl ScriptedSearch {
        pub fn with_brave(hits: Vec<(&str, &str)>) -> Self {
            Self {
                brave_hits: hits
                    .into_iter()
                    .map(|(q, t)| (q.to_string(), t.to_string()))
                    .collect(),
                ..Default::default()
            }
        }

        pub fn with_ddg(hits: Vec<(&str, &str)>) -> Self {
            Self {
                ddg_hits: hits
                    .into_iter()
                    .map(|(q, t)| (q.to_string(), t.to_string()))
                    .collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl SearchProvider for ScriptedSearch {
        async fn ddg(&self, query: &str) -> Option<SearchResult> {
            self.queries_seen.lock().push(format!("ddg:{query}"));
            self.ddg_hits
                .iter()
                .find(|(needle, _)| query.contains(needle.as_str()))
                .map(|(_, text)| SearchResult {
                    text: text.clone(),
                    results: Vec::new(),
                    related: Vec::new(),
                })
        }

        async fn brave(&self, query: &str, _client_id: &str) -> Option<SearchResult> {
            self.queries_seen.lock().push(format!("brave:{query}"));
            self.brave_hits
                .iter()
                .find(|(needle, _)| query.contains(needle.as_str()))
                .map(|(_, text)| SearchResult {
                    text: text.clone(),
                    results: Vec::new(),
                    related: Vec::new(),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedSearch;
    use super::*;

    fn cascade(provider: ScriptedSearch) -> SearchCascade {
        SearchCascade::new(
            Arc::new(provider),
            &FetcherConfig {
                fanout_spacing: Duration::from_millis(1),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn best_effort_prefers_ddg() {
        let provider = ScriptedSearch {
            ddg_hits: vec![("rust".to_string(), "ddg says".to_string())],
            brave_hits: vec![("rust".to_string(), "brave says".to_string())],
            ..Default::default()
        };
        let cascade = cascade(provider);
        let result = cascade.best_effort("rust lang", "c1").await.unwrap();
        assert_eq!(result.text, "ddg says");
    }

    #[tokio::test]
    async fn best_effort_falls_back_to_brave() {
        let cascade = cascade(ScriptedSearch::with_brave(vec![("rust", "brave says")]));
        let result = cascade.best_effort("rust lang", "c1").await.unwrap();
        assert_eq!(result.text, "brave says");
    }

    #[tokio::test]
    async fn best_effort_returns_none_when_both_miss() {
        let cascade = cascade(ScriptedSearch::default());
        assert!(cascade.best_effort("anything", "c1").await.is_none());
    }

    #[tokio::test]
    async fn fan_out_labels_blocks_and_skips_misses() {
        let cascade = cascade(ScriptedSearch::with_brave(vec![
            ("price", "price data"),
            ("income", "income data"),
        ]));
        let queries = vec![
            "jakarta price per sqm".to_string(),
            "jakarta income".to_string(),
            "jakarta weather".to_string(),
        ];
        let blocks = cascade.fan_out(&queries, "c1").await;
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].label, "jakarta price per sqm");
        assert_eq!(blocks[0].text, "price data");
        assert_eq!(blocks[1].text, "income data");
    }

    #[tokio::test]
    async fn fan_out_tries_brave_before_ddg() {
        let provider = ScriptedSearch {
            ddg_hits: vec![("q1".to_string(), "from ddg".to_string())],
            brave_hits: vec![],
            ..Default::default()
        };
        let seen = Arc::new(provider);
        let cascade = SearchCascade::new(
            seen.clone(),
            &FetcherConfig {
                fanout_spacing: Duration::from_millis(1),
                ..Default::default()
            },
        );
        let blocks = cascade.fan_out(&["q1".to_string()], "c1").await;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text, "from ddg");
        let calls = seen.queries_seen.lock().clone();
        assert_eq!(calls, vec!["brave:q1", "ddg:q1"]);
    }
}
