//! Market data fetcher
//!
//! The raw quote source (subprocess or RPC) sits behind
//! [`MarketDataProvider`]; the fetcher owns ticker sanitation, the 30-second
//! hard timeout, and scrubbing of non-finite numbers out of the payload.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::FetcherConfig;
use crate::types::FetchError;

/// One close-price series.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeriesBars {
    pub closes: Vec<f64>,
    pub bar_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
}

/// Normalized market data payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketData {
    pub ticker: String,
    pub currency: Option<String>,
    pub name: Option<String>,
    pub current_price: Option<f64>,
    pub end_date: Option<String>,
    pub daily: SeriesBars,
    pub weekly: SeriesBars,
    pub fundamentals: Value,
}

/// Raw market data source (the §6 adapter: subprocess or RPC).
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch(&self, ticker: &str) -> Result<MarketData, FetchError>;
}

/// Sanitizing, deadline-enforcing wrapper over a raw provider.
pub struct MarketDataFetcher {
    provider: Arc<dyn MarketDataProvider>,
    timeout: Duration,
}

impl MarketDataFetcher {
    pub fn new(provider: Arc<dyn MarketDataProvider>, config: &FetcherConfig) -> Self {
        Self {
            provider,
            timeout: config.market_timeout,
        }
    }

    /// Validate a candidate ticker: A-Z0-9.- only, 1–10 chars, must start
    /// with a letter. Returns the uppercased form.
    pub fn sanitize_ticker(raw: &str) -> Result<String, FetchError> {
        let candidate = raw.trim().trim_start_matches('$').to_uppercase();
        let valid = !candidate.is_empty()
            && candidate.len() <= 10
            && candidate.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && candidate
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.' || c == '-');
        if valid {
            Ok(candidate)
        } else {
            Err(FetchError::InvalidTicker(raw.to_string()))
        }
    }

    /// Fetch market data for a ticker, sanitized and deadline-bounded.
    pub async fn fetch(&self, raw_ticker: &str) -> Result<MarketData, FetchError> {
        let ticker = Self::sanitize_ticker(raw_ticker)?;
        let result = tokio::time::timeout(self.timeout, self.provider.fetch(&ticker)).await;
        match result {
            Ok(Ok(mut data)) => {
                scrub_market_data(&mut data);
                Ok(data)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(FetchError::MarketTimeout {
                ticker,
                timeout: self.timeout,
            }),
        }
    }
}

/// Replace NaN/Infinity with null (or drop from series) so no non-finite
/// value ever reaches a prompt or artifact.
fn scrub_market_data(data: &mut MarketData) {
    if let Some(price) = data.current_price {
        if !price.is_finite() {
            data.current_price = None;
        }
    }
    scrub_series(&mut data.daily);
    scrub_series(&mut data.weekly);
    scrub_value(&mut data.fundamentals);
}

fn scrub_series(series: &mut SeriesBars) {
    series.closes.retain(|c| c.is_finite());
    series.bar_count = series.closes.len();
}

fn scrub_value(value: &mut Value) {
    match value {
        Value::Number(n) => {
            if n.as_f64().is_some_and(|f| !f.is_finite()) {
                *value = Value::Null;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(scrub_value),
        Value::Object(map) => map.values_mut().for_each(scrub_value),
        _ => {}
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Fixed-payload provider for tests.
    pub struct StaticMarket {
        pub data: Option<MarketData>,
    }

    impl StaticMarket {
        pub fn with_daily_bars(ticker: &str, count: usize) -> Self {
            let closes: Vec<f64> = (0..count).map(|i| 100.0 + (i as f64) * 0.5).collect();
            Self {
                data: Some(MarketData {
                    ticker: ticker.to_string(),
                    currency: Some("USD".to_string()),
                    name: Some(format!("{ticker} Inc.")),
                    current_price: closes.last().copied(),
                    end_date: Some("2026-08-01".to_string()),
                    daily: SeriesBars {
                        bar_count: closes.len(),
                        closes,
                        unavailable_reason: None,
                    },
                    weekly: SeriesBars {
                        closes: (0..20).map(|i| 100.0 + i as f64).collect(),
                        bar_count: 20,
                        unavailable_reason: None,
                    },
                    fundamentals: serde_json::json!({"pe": 30.5}),
                }),
            }
        }

        pub fn unavailable() -> Self {
            Self { data: None }
        }
    }

    #[async_trait]
    impl MarketDataProvider for StaticMarket {
        async fn fetch(&self, ticker: &str) -> Result<MarketData, FetchError> {
            self.data.clone().ok_or(FetchError::MarketUnavailable {
                ticker: ticker.to_string(),
                reason: "no data".to_string(),
            })
        }
    }
}
