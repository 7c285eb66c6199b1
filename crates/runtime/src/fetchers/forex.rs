//! Forex pair fetcher

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::types::FetchError;

/// A fetched exchange-rate quote. `rate` is extracted from the raw payload
/// when a numeric rate is present; the raw response rides along untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForexQuote {
    pub pair: String,
    pub rate: Option<f64>,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub raw: Value,
}

/// Raw rate source seam.
#[async_trait]
pub trait ForexRateSource: Send + Sync {
    /// Fetch the raw payload for `BASE/QUOTE`. The source name is used for
    /// attribution in the quote.
    async fn fetch_raw(&self, base: &str, quote: &str) -> Result<(String, Value), FetchError>;
}

/// Parses pairs, dispatches to the source, extracts the numeric rate.
pub struct ForexFetcher {
    source: Arc<dyn ForexRateSource>,
}

impl ForexFetcher {
    pub fn new(source: Arc<dyn ForexRateSource>) -> Self {
        Self { source }
    }

    /// Parse `BASE/QUOTE` into two three-letter uppercase codes.
    pub fn parse_pair(raw: &str) -> Result<(String, String), FetchError> {
        let trimmed = raw.trim().to_uppercase();
        let (base, quote) = trimmed
            .split_once('/')
            .ok_or_else(|| FetchError::InvalidPair(raw.to_string()))?;
        let valid =
            |code: &str| code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase());
        if valid(base) && valid(quote) && base != quote {
            Ok((base.to_string(), quote.to_string()))
        } else {
            Err(FetchError::InvalidPair(raw.to_string()))
        }
    }

    pub async fn fetch(&self, raw_pair: &str) -> Result<ForexQuote, FetchError> {
        let (base, quote) = Self::parse_pair(raw_pair)?;
        let pair = format!("{base}/{quote}");
        let (source, raw) = self.source.fetch_raw(&base, &quote).await?;
        let rate = extract_rate(&raw, &quote);
        Ok(ForexQuote {
            pair,
            rate,
            source,
            timestamp: Utc::now(),
            raw,
        })
    }
}

/// Pull a finite numeric rate out of the common payload shapes:
/// `{"rate": n}`, `{"rates": {"JPY": n}}`, or a bare number.
fn extract_rate(raw: &Value, quote: &str) -> Option<f64> {
    let candidate = raw
        .get("rate")
        .and_then(Value::as_f64)
        .or_else(|| raw.pointer(&format!("/rates/{quote}")).and_then(Value::as_f64))
        .or_else(|| raw.as_f64());
    candidate.filter(|r| r.is_finite() && *r > 0.0)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub struct StaticForex {
        pub rate: f64,
    }

    #[async_trait]
    impl ForexRateSource for StaticForex {
        async fn fetch_raw(&self, _base: &str, quote: &str) -> Result<(String, Value), FetchError> {
            Ok((
                "static".to_string(),
                serde_json::json!({"rates": {quote: self.rate}}),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StaticForex;
    use super::*;

    #[test]
    fn parse_pair_normalizes_case() {
        assert_eq!(
            ForexFetcher::parse_pair("usd/jpy").unwrap(),
            ("USD".to_string(), "JPY".to_string())
        );
    }

    #[test]
    fn parse_pair_rejects_malformed_input() {
        for bad in ["USDJPY", "US/JPY", "USD/US1", "USD/USD", "USD/JPY/EUR"] {
            assert!(ForexFetcher::parse_pair(bad).is_err(), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn fetch_extracts_rate_from_rates_map() {
        let fetcher = ForexFetcher::new(Arc::new(StaticForex { rate: 149.85 }));
        let quote = fetcher.fetch("USD/JPY").await.unwrap();
        assert_eq!(quote.pair, "USD/JPY");
        assert_eq!(quote.rate, Some(149.85));
        assert_eq!(quote.source, "static");
    }

    #[test]
    fn extract_rate_handles_shapes_and_rejects_junk() {
        assert_eq!(
            extract_rate(&serde_json::json!({"rate": 1.08}), "EUR"),
            Some(1.08)
        );
        assert_eq!(extract_rate(&serde_json::json!(7.25), "CNY"), Some(7.25));
        assert_eq!(extract_rate(&serde_json::json!({"rate": -3.0}), "EUR"), None);
        assert_eq!(extract_rate(&serde_json::json!({"other": 1}), "EUR"), None);
    }
}
