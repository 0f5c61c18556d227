use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AppError, Result};
use crate::source::search_url;
use crate::types::TrackedItem;

/// Edge-triggered price-drop check.
///
/// Fires only on the transition into "at or below target": the new price must
/// be at or below target, the previous price must have been above target, and
/// the price must actually have dropped. A missing previous price counts as
/// "above target" so the very first check can fire.
pub fn should_alert(old_price: Option<f64>, new_price: f64, target_price: f64) -> bool {
    if new_price > target_price {
        return false;
    }
    match old_price {
        None => true,
        Some(old) => old > target_price && new_price < old,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceAlert {
    pub recipient: String,
    pub item_id: String,
    pub item_name: String,
    pub old_price: Option<f64>,
    pub new_price: f64,
    pub target_price: f64,
    /// target − new
    pub savings: f64,
    pub url: Option<String>,
}

impl PriceAlert {
    pub fn for_item(item: &TrackedItem, old_price: Option<f64>, new_price: f64) -> Self {
        let url = item.url.clone().or_else(|| {
            item.primary_marketplace
                .and_then(|mp| search_url(mp, &item.name).ok())
                .map(|u| u.to_string())
        });
        Self {
            recipient: item.owner.clone(),
            item_id: item.id.clone(),
            item_name: item.name.clone(),
            old_price,
            new_price,
            target_price: item.target_price,
            savings: item.target_price - new_price,
            url,
        }
    }
}

/// Outbound notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_price_alert(&self, alert: &PriceAlert) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct DeliveryResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Posts alerts as JSON to an external delivery service.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_price_alert(&self, alert: &PriceAlert) -> Result<()> {
        if alert.recipient.trim().is_empty() {
            return Err(AppError::InvalidInput(format!("item {} has no recipient", alert.item_id)));
        }

        let resp = self.client.post(&self.url).json(alert).send().await?;
        if !resp.status().is_success() {
            return Err(AppError::Notification(format!("delivery returned HTTP {}", resp.status())));
        }

        let body: DeliveryResponse = resp.json().await?;
        if body.success {
            Ok(())
        } else {
            Err(AppError::Notification(body.error.unwrap_or_else(|| "delivery failed".to_string())))
        }
    }
}

/// Used when no delivery service is configured: the alert becomes a log line.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_price_alert(&self, alert: &PriceAlert) -> Result<()> {
        info!(
            event = "PRICE_ALERT",
            item_id = %alert.item_id,
            recipient = %alert.recipient,
            new_price = alert.new_price,
            savings = alert.savings,
            "PRICE ALERT | {} now ${:.2} (target ${:.2}, save ${:.2})",
            alert.item_name, alert.new_price, alert.target_price, alert.savings,
        );
        Ok(())
    }
}
