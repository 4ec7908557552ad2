//! CoinGecko markets API adapter.
//!
//! Maps the `/coins/markets` payload into canonical raw rows for the
//! collector. Entities without a market cap cannot be ranked and are dropped
//! at this boundary with a log line; defaulting a required field downstream
//! would poison the table.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::coerce::{RawRow, RawValue};
use crate::collector::{FetchError, PageSource};

pub const COINGECKO_API_BASE: &str = "https://api.coingecko.com/api/v3";
pub const COINS_PER_PAGE: u32 = 250;

/// Canonical field name -> CoinGecko payload key.
const FIELD_MAP: &[(&str, &str)] = &[
    ("coin_id", "id"),
    ("symbol", "symbol"),
    ("name", "name"),
    ("price", "current_price"),
    ("market_cap", "market_cap"),
    ("volume_24h", "total_volume"),
    ("circulating_supply", "circulating_supply"),
];

pub struct CoinGeckoSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    per_page: u32,
}

impl CoinGeckoSource {
    pub fn new(api_key: Option<String>) -> Result<Self> {
        Self::with_base_url(COINGECKO_API_BASE.to_string(), api_key)
    }

    pub fn with_base_url(base_url: String, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build CoinGecko HTTP client")?;
        Ok(Self {
            client,
            base_url,
            api_key,
            per_page: COINS_PER_PAGE,
        })
    }

    fn query_params(&self, page: u32) -> Vec<(String, String)> {
        let mut params = vec![
            ("vs_currency".to_string(), "usd".to_string()),
            ("order".to_string(), "market_cap_desc".to_string()),
            ("per_page".to_string(), self.per_page.to_string()),
            ("page".to_string(), page.to_string()),
            ("sparkline".to_string(), "false".to_string()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("x_cg_demo_api_key".to_string(), key.clone()));
        }
        params
    }
}

/// Map one markets entry to a raw row, or `None` for unrankable entities.
pub(crate) fn map_entity(entity: &Value) -> Option<RawRow> {
    if entity.get("market_cap").map_or(true, Value::is_null) {
        debug!(
            id = entity.get("id").and_then(|v| v.as_str()).unwrap_or("?"),
            "skipping entity without market cap"
        );
        return None;
    }
    let mut row = RawRow::new();
    for (canonical, upstream) in FIELD_MAP {
        let value = entity.get(*upstream).unwrap_or(&Value::Null);
        row.insert(canonical.to_string(), RawValue::from_json(value));
    }
    Some(row)
}

async fn check_status(response: Response) -> Result<Response, FetchError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(FetchError::RateLimited { retry_after });
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(FetchError::Network {
            message: format!("HTTP {status}: {body}"),
        });
    }
    Ok(response)
}

#[async_trait]
impl PageSource for CoinGeckoSource {
    fn source_tag(&self) -> &str {
        "coingecko"
    }

    fn per_page(&self) -> u32 {
        self.per_page
    }

    async fn total_items(&self) -> Result<u64, FetchError> {
        let url = format!("{}/coins/list", self.base_url);
        let mut params: Vec<(String, String)> = Vec::new();
        if let Some(key) = &self.api_key {
            params.push(("x_cg_demo_api_key".to_string(), key.clone()));
        }
        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| FetchError::Network {
                message: e.to_string(),
            })?;
        let response = check_status(response).await?;
        let listing: Vec<Value> = response.json().await.map_err(|e| FetchError::Network {
            message: format!("bad /coins/list payload: {e}"),
        })?;
        Ok(listing.len() as u64)
    }

    async fn fetch_page(&self, page: u32) -> Result<Vec<RawRow>, FetchError> {
        let url = format!("{}/coins/markets", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&self.query_params(page))
            .send()
            .await
            .map_err(|e| FetchError::Network {
                message: e.to_string(),
            })?;
        let response = check_status(response).await?;
        let entities: Vec<Value> = response.json().await.map_err(|e| FetchError::Network {
            message: format!("bad /coins/markets payload: {e}"),
        })?;

        let total = entities.len();
        let rows: Vec<RawRow> = entities.iter().filter_map(map_entity).collect();
        if rows.len() < total {
            debug!(
                page,
                skipped = total - rows.len(),
                "dropped entities without market cap"
            );
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_maps_to_canonical_fields() {
        let entity = json!({
            "id": "bitcoin",
            "symbol": "btc",
            "name": "Bitcoin",
            "current_price": 46_300.0,
            "market_cap": 876_000_000_000.0,
            "total_volume": 24_000_000_000.0,
            "circulating_supply": 18_920_000.0,
            "ath": 69_000.0
        });
        let row = map_entity(&entity).unwrap();
        assert_eq!(row["coin_id"], RawValue::Text("bitcoin".to_string()));
        assert_eq!(row["symbol"], RawValue::Text("btc".to_string()));
        assert_eq!(row["price"], RawValue::Float(46_300.0));
        assert_eq!(row["market_cap"], RawValue::Float(876_000_000_000.0));
        assert_eq!(row["volume_24h"], RawValue::Float(24_000_000_000.0));
        assert_eq!(row["circulating_supply"], RawValue::Float(18_920_000.0));
        // Fields outside the map are dropped.
        assert!(!row.contains_key("ath"));
    }

    #[test]
    fn missing_optional_fields_map_to_null() {
        let entity = json!({
            "id": "obscure-coin",
            "market_cap": 1_000_000,
            "current_price": 0.01,
            "total_volume": 500.0
        });
        let row = map_entity(&entity).unwrap();
        assert_eq!(row["symbol"], RawValue::Null);
        assert_eq!(row["circulating_supply"], RawValue::Null);
    }

    #[test]
    fn entity_without_market_cap_is_skipped() {
        let entity = json!({
            "id": "dead-listing",
            "symbol": "dead",
            "current_price": null,
            "market_cap": null,
            "total_volume": null
        });
        assert!(map_entity(&entity).is_none());
        assert!(map_entity(&json!({"id": "no-cap-key"})).is_none());
    }
}
