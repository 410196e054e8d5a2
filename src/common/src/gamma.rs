//! Gamma API client for window market metadata.
//!
//! Windows are addressed by slug: `{asset_lower}-updown-{interval}-{aligned_start_unix}`
//! (e.g. `btc-updown-900-1754055000`). A missing slug means the window does
//! not exist on the venue yet.

use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::models::Asset;
use crate::Config;

#[derive(Debug, Error)]
pub enum GammaError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("API error: {0}")]
    ApiError(String),
}

/// Build the venue slug for a window.
pub fn window_slug(asset: Asset, interval_secs: i64, aligned_start_unix: i64) -> String {
    format!(
        "{}-updown-{}-{}",
        asset.slug_prefix(),
        interval_secs,
        aligned_start_unix
    )
}

/// Raw market data from the Gamma API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GammaMarket {
    #[serde(rename = "conditionId")]
    pub condition_id: String,
    pub question: String,
    #[serde(rename = "endDate")]
    pub end_date: Option<String>,
    /// JSON string of array: "[\"Up\", \"Down\"]"
    pub outcomes: Option<String>,
    /// JSON string of array: "[\"0.55\", \"0.45\"]"
    #[serde(rename = "outcomePrices")]
    pub outcome_prices: Option<String>,
    /// JSON string of array with token IDs
    #[serde(rename = "clobTokenIds")]
    pub clob_token_ids: Option<String>,
    pub active: Option<bool>,
    pub closed: Option<bool>,
    pub slug: Option<String>,
}

impl GammaMarket {
    /// Parse the clob_token_ids JSON string into a vector.
    pub fn parse_token_ids(&self) -> Option<Vec<String>> {
        self.clob_token_ids
            .as_ref()
            .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
    }

    /// Parse outcomes JSON string.
    pub fn parse_outcomes(&self) -> Option<Vec<String>> {
        self.outcomes
            .as_ref()
            .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
    }

    /// Parse outcome prices JSON string.
    pub fn parse_outcome_prices(&self) -> Option<Vec<Decimal>> {
        self.outcome_prices
            .as_ref()
            .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
            .map(|prices| prices.iter().filter_map(|p| p.parse().ok()).collect())
    }
}

/// Market identity for a window, resolved from the venue.
#[derive(Debug, Clone)]
pub struct WindowMarket {
    pub condition_id: String,
    pub question: String,
    pub end_time: DateTime<Utc>,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub yes_price: Option<Decimal>,
    pub no_price: Option<Decimal>,
}

/// Gamma API client.
pub struct GammaClient {
    client: Client,
    base_url: String,
}

impl GammaClient {
    /// Create a new Gamma API client.
    pub fn new(config: &Config) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: config.gamma_api_url.clone(),
        }
    }

    /// Fetch the market behind a window slug. Returns `Ok(None)` when the
    /// venue has no market for the slug.
    pub async fn fetch_market_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<WindowMarket>, GammaError> {
        let url = format!("{}/markets", self.base_url);

        debug!("Fetching market for slug={}", slug);

        let response = self
            .client
            .get(&url)
            .query(&[("slug", slug)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GammaError::ApiError(format!(
                "API returned status: {}",
                response.status()
            )));
        }

        let markets: Vec<GammaMarket> = response.json().await?;
        let Some(market) = markets.into_iter().next() else {
            return Ok(None);
        };

        parse_window_market(&market).map(Some)
    }
}

/// Map a raw Gamma market onto window identity. The "Up" outcome is the YES
/// side for up/down markets; token and price arrays follow outcome order.
fn parse_window_market(market: &GammaMarket) -> Result<WindowMarket, GammaError> {
    let token_ids = market
        .parse_token_ids()
        .filter(|t| t.len() == 2)
        .ok_or_else(|| GammaError::ParseError(format!("bad clobTokenIds for {}", market.condition_id)))?;

    let outcomes = market.parse_outcomes().unwrap_or_default();
    let up_first = outcomes
        .first()
        .map(|o| {
            let o = o.to_lowercase();
            o == "up" || o == "yes"
        })
        .unwrap_or(true);

    let (yes_idx, no_idx) = if up_first { (0, 1) } else { (1, 0) };

    let prices = market.parse_outcome_prices().unwrap_or_default();

    let end_time = market
        .end_date
        .as_deref()
        .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
        .map(|d| d.with_timezone(&Utc))
        .ok_or_else(|| GammaError::ParseError(format!("bad endDate for {}", market.condition_id)))?;

    Ok(WindowMarket {
        condition_id: market.condition_id.clone(),
        question: market.question.clone(),
        end_time,
        yes_token_id: token_ids[yes_idx].clone(),
        no_token_id: token_ids[no_idx].clone(),
        yes_price: prices.get(yes_idx).copied(),
        no_price: prices.get(no_idx).copied(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_slug_format() {
        assert_eq!(
            window_slug(Asset::Btc, 900, 1754055000),
            "btc-updown-900-1754055000"
        );
        assert_eq!(
            window_slug(Asset::Sol, 900, 1754055900),
            "sol-updown-900-1754055900"
        );
    }

    #[test]
    fn test_parse_window_market() {
        let market = GammaMarket {
            condition_id: "0xabc".to_string(),
            question: "Bitcoin Up or Down?".to_string(),
            end_date: Some("2026-08-01T12:15:00Z".to_string()),
            outcomes: Some(r#"["Up", "Down"]"#.to_string()),
            outcome_prices: Some(r#"["0.55", "0.45"]"#.to_string()),
            clob_token_ids: Some(r#"["tok-up", "tok-down"]"#.to_string()),
            active: Some(true),
            closed: Some(false),
            slug: Some("btc-updown-900-1".to_string()),
        };

        let parsed = parse_window_market(&market).unwrap();
        assert_eq!(parsed.yes_token_id, "tok-up");
        assert_eq!(parsed.no_token_id, "tok-down");
        assert_eq!(parsed.yes_price.unwrap().to_string(), "0.55");
        assert_eq!(parsed.end_time.to_rfc3339(), "2026-08-01T12:15:00+00:00");
    }

    #[test]
    fn test_parse_window_market_reversed_outcomes() {
        let market = GammaMarket {
            condition_id: "0xdef".to_string(),
            question: "Ethereum Up or Down?".to_string(),
            end_date: Some("2026-08-01T12:15:00Z".to_string()),
            outcomes: Some(r#"["Down", "Up"]"#.to_string()),
            outcome_prices: Some(r#"["0.40", "0.60"]"#.to_string()),
            clob_token_ids: Some(r#"["tok-down", "tok-up"]"#.to_string()),
            active: Some(true),
            closed: Some(false),
            slug: None,
        };

        let parsed = parse_window_market(&market).unwrap();
        assert_eq!(parsed.yes_token_id, "tok-up");
        assert_eq!(parsed.no_token_id, "tok-down");
        assert_eq!(parsed.yes_price.unwrap().to_string(), "0.60");
    }

    #[test]
    fn test_parse_window_market_rejects_bad_tokens() {
        let market = GammaMarket {
            condition_id: "0xbad".to_string(),
            question: "?".to_string(),
            end_date: Some("2026-08-01T12:15:00Z".to_string()),
            outcomes: None,
            outcome_prices: None,
            clob_token_ids: Some(r#"["only-one"]"#.to_string()),
            active: None,
            closed: None,
            slug: None,
        };

        assert!(parse_window_market(&market).is_err());
    }
}
