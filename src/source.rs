use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DIRECT_SOURCE_TAG;
use crate::error::{AppError, Result};
use crate::types::{now_ns, Marketplace, PriceObservation};

/// What the price source is asked to look at.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceReference {
    pub name: String,
    pub url: String,
    pub marketplace: Option<Marketplace>,
    pub listing_ref: Option<String>,
}

/// External price extraction. Slow and unreliable; always called through the
/// retry primitive.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_price(&self, reference: &PriceReference) -> Result<PriceObservation>;
}

/// Search page used as the fresh lookup reference for a marketplace each cycle.
pub fn search_url(marketplace: Marketplace, product_name: &str) -> Result<reqwest::Url> {
    let (base, param) = match marketplace {
        Marketplace::Amazon => ("https://www.amazon.com/s", "k"),
        Marketplace::Walmart => ("https://www.walmart.com/search", "q"),
        Marketplace::Target => ("https://www.target.com/s", "searchTerm"),
        Marketplace::BestBuy => ("https://www.bestbuy.com/site/searchpage.jsp", "st"),
    };
    reqwest::Url::parse_with_params(base, &[(param, product_name)])
        .map_err(|e| AppError::InvalidInput(format!("cannot build search URL: {e}")))
}

/// Reject prices that must never reach the store.
pub fn validate_price(price: f64) -> Result<f64> {
    if price.is_finite() && price > 0.0 {
        Ok(price)
    } else {
        Err(AppError::InvalidInput(format!("source reported invalid price {price}")))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceResponse {
    success: bool,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    in_stock: Option<bool>,
}

/// Client for the price extraction service at PRICE_SOURCE_URL.
pub struct HttpPriceSource {
    client: reqwest::Client,
    url: String,
}

impl HttpPriceSource {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn fetch_price(&self, reference: &PriceReference) -> Result<PriceObservation> {
        let resp = self.client.post(&self.url).json(reference).send().await?;
        if !resp.status().is_success() {
            return Err(AppError::SourceUnavailable(format!(
                "price source returned HTTP {}",
                resp.status()
            )));
        }

        let body: SourceResponse = resp.json().await?;
        into_observation(body)
    }
}

fn into_observation(body: SourceResponse) -> Result<PriceObservation> {
    if !body.success {
        return Err(AppError::SourceUnavailable(
            body.error.unwrap_or_else(|| "price source reported failure".to_string()),
        ));
    }
    let Some(price) = body.price else {
        return Err(AppError::SourceUnavailable("price source returned no price".to_string()));
    };
    Ok(PriceObservation {
        price: validate_price(price)?,
        source: body.source.unwrap_or_else(|| DIRECT_SOURCE_TAG.to_string()),
        observed_at: now_ns(),
        title: body.title.filter(|t| !t.trim().is_empty()),
        in_stock: body.in_stock,
    })
}

/// Stand-in used when PRICE_SOURCE_URL is not configured: every fetch fails,
/// so items are marked checked and reported instead of silently skipped.
#[derive(Debug, Default)]
pub struct UnconfiguredSource;

#[async_trait]
impl PriceSource for UnconfiguredSource {
    async fn fetch_price(&self, _reference: &PriceReference) -> Result<PriceObservation> {
        Err(AppError::Config("PRICE_SOURCE_URL not configured".to_string()))
    }
}
