use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::AppError;

/// Nanosecond UTC epoch timestamp, as stored in every table.
pub type TimestampNs = i64;

pub fn now_ns() -> TimestampNs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

// ---------------------------------------------------------------------------
// Marketplace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Marketplace {
    Amazon,
    Walmart,
    Target,
    BestBuy,
}

impl Marketplace {
    pub const ALL: [Marketplace; 4] = [
        Marketplace::Amazon,
        Marketplace::Walmart,
        Marketplace::Target,
        Marketplace::BestBuy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Marketplace::Amazon => "amazon",
            Marketplace::Walmart => "walmart",
            Marketplace::Target => "target",
            Marketplace::BestBuy => "bestbuy",
        }
    }
}

impl std::fmt::Display for Marketplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Marketplace {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "amazon" => Ok(Marketplace::Amazon),
            "walmart" => Ok(Marketplace::Walmart),
            "target" => Ok(Marketplace::Target),
            "bestbuy" | "best-buy" | "best_buy" => Ok(Marketplace::BestBuy),
            other => {
                let known: Vec<&str> = Marketplace::ALL.iter().map(Marketplace::as_str).collect();
                Err(AppError::InvalidInput(format!(
                    "unknown marketplace '{other}', expected one of {}",
                    known.join(", ")
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tracked items and listings
// ---------------------------------------------------------------------------

pub fn validate_name(item_id: &str, name: &str) -> Result<(), AppError> {
    if name.trim().is_empty() {
        return Err(AppError::InvalidInput(format!("item {item_id} has an empty name")));
    }
    Ok(())
}

pub fn validate_target_price(item_id: &str, target_price: f64) -> Result<(), AppError> {
    if !target_price.is_finite() || target_price < 0.0 {
        return Err(AppError::InvalidInput(format!(
            "item {item_id} has an invalid target price {target_price}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedItem {
    pub id: String,
    /// Notification recipient for this item's creator.
    pub owner: String,
    pub name: String,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub target_price: f64,
    pub tracking_enabled: bool,
    pub purchased: bool,
    pub current_price: Option<f64>,
    pub lowest_price: Option<f64>,
    pub highest_price: Option<f64>,
    pub last_checked_at: Option<TimestampNs>,
    pub primary_marketplace: Option<Marketplace>,
    pub created_at: TimestampNs,
}

impl TrackedItem {
    pub fn new(owner: &str, name: &str, url: Option<String>, target_price: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            name: name.to_string(),
            url,
            image_url: None,
            target_price,
            tracking_enabled: true,
            purchased: false,
            current_price: None,
            lowest_price: None,
            highest_price: None,
            last_checked_at: None,
            primary_marketplace: None,
            created_at: now_ns(),
        }
    }

    /// The item's reference URL, if it is an absolute http(s) URL.
    pub fn resolvable_url(&self) -> Option<reqwest::Url> {
        let raw = self.url.as_deref()?.trim();
        let url = reqwest::Url::parse(raw).ok()?;
        matches!(url.scheme(), "http" | "https").then_some(url)
    }

    /// Owner-editable fields must hold before the pipeline touches the item.
    pub fn validate(&self) -> Result<(), AppError> {
        validate_name(&self.id, &self.name)?;
        validate_target_price(&self.id, self.target_price)
    }

    pub fn as_product(&self) -> Product {
        Product {
            name: self.name.clone(),
            price: self.current_price,
            url: self.url.clone(),
            image_url: self.image_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    /// Confirmed listing that takes part in reconciliation.
    Active,
    /// Possible match waiting for the owner to confirm or reject it.
    Pending,
}

impl std::fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListingStatus::Active => write!(f, "active"),
            ListingStatus::Pending => write!(f, "pending"),
        }
    }
}

impl std::str::FromStr for ListingStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ListingStatus::Active),
            "pending" => Ok(ListingStatus::Pending),
            other => Err(AppError::InvalidInput(format!("unknown listing status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceListing {
    pub item_id: String,
    pub marketplace: Marketplace,
    /// Listing URL or search key as registered.
    pub listing_ref: String,
    pub status: ListingStatus,
    pub last_price: Option<f64>,
    pub last_checked_at: Option<TimestampNs>,
    pub in_stock: bool,
    /// None until the listing has been accepted or confirmed.
    pub confidence: Option<f64>,
}

impl MarketplaceListing {
    pub fn is_active(&self) -> bool {
        self.status == ListingStatus::Active
    }
}

// ---------------------------------------------------------------------------
// Products and observations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    pub price: Option<f64>,
    pub url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// A product offered on a specific marketplace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(flatten)]
    pub product: Product,
    pub marketplace: Marketplace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub price: f64,
    pub source: String,
    pub observed_at: TimestampNs,
    /// Listing title as seen by the source, when it reports one.
    pub title: Option<String>,
    pub in_stock: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub item_id: String,
    pub price: f64,
    pub source: String,
    pub checked_at: TimestampNs,
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchFactors {
    pub name_match: f64,
    pub price_match: f64,
    pub specs_match: f64,
    pub image_match: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDecision {
    pub is_match: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub factors: MatchFactors,
    /// Set only on the fallback produced when the comparator was unavailable.
    #[serde(default)]
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    AutoAccept,
    Review,
    AutoReject,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Decision::AutoAccept => "auto-accept",
            Decision::Review => "review",
            Decision::AutoReject => "auto-reject",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchOutcome {
    Accepted,
    Pending,
    Rejected,
    Confirmed,
}

impl std::fmt::Display for MatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MatchOutcome::Accepted => "accepted",
            MatchOutcome::Pending => "pending",
            MatchOutcome::Rejected => "rejected",
            MatchOutcome::Confirmed => "confirmed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MatchOutcome {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(MatchOutcome::Accepted),
            "pending" => Ok(MatchOutcome::Pending),
            "rejected" => Ok(MatchOutcome::Rejected),
            "confirmed" => Ok(MatchOutcome::Confirmed),
            other => Err(AppError::InvalidInput(format!("unknown match outcome '{other}'"))),
        }
    }
}

/// Audit trail entry for every registry decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchHistoryRecord {
    pub item_id: String,
    pub marketplace: Marketplace,
    pub listing_ref: String,
    pub confidence: f64,
    pub outcome: MatchOutcome,
    pub reasoning: String,
    pub recorded_at: TimestampNs,
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// False when a run-level error aborted the batch.
    pub success: bool,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub alerts_sent: usize,
    /// Items not checked: the run was cancelled or aborted, or the item
    /// stopped being eligible after it was selected.
    pub skipped: usize,
    pub errors: Vec<String>,
    pub run_error: Option<String>,
    pub started_at: TimestampNs,
    pub finished_at: TimestampNs,
}
