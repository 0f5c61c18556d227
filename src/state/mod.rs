pub mod memory_store;

pub use memory_store::MemoryStore;

use async_trait::async_trait;
use serde::Serialize;

use crate::consensus::Resolution;
use crate::error::{AppError, Result};
use crate::types::{
    validate_name, validate_target_price, ListingStatus, Marketplace, MarketplaceListing, MatchHistoryRecord, PriceHistoryEntry, TimestampNs,
    TrackedItem,
};

/// Result of fetching one active listing during a check. A failed fetch still
/// moves `checked_at` forward but leaves price and stock untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingUpdate {
    pub marketplace: Marketplace,
    pub checked_at: TimestampNs,
    pub price: Option<f64>,
    pub in_stock: Option<bool>,
}

/// Everything one item check writes. Applied as a single unit: either all of
/// it is visible afterwards or none of it is.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckCommit {
    pub item_id: String,
    pub checked_at: TimestampNs,
    pub listing_updates: Vec<ListingUpdate>,
    pub resolution: Option<Resolution>,
    pub history: Vec<PriceHistoryEntry>,
}

/// Changes an owner may make to an item. Price state, check times and the
/// primary marketplace are written only by check commits, so an edit can never
/// roll them back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OwnerEdit {
    pub name: Option<String>,
    /// `Some(None)` clears the URL.
    pub url: Option<Option<String>>,
    pub image_url: Option<Option<String>>,
    pub target_price: Option<f64>,
    pub tracking_enabled: Option<bool>,
    pub purchased: Option<bool>,
}

impl OwnerEdit {
    pub fn apply(&self, item: &mut TrackedItem) {
        if let Some(name) = &self.name {
            item.name = name.clone();
        }
        if let Some(url) = &self.url {
            item.url = url.clone();
        }
        if let Some(image_url) = &self.image_url {
            item.image_url = image_url.clone();
        }
        if let Some(target) = self.target_price {
            item.target_price = target;
        }
        if let Some(enabled) = self.tracking_enabled {
            item.tracking_enabled = enabled;
        }
        if let Some(purchased) = self.purchased {
            item.purchased = purchased;
        }
    }

    /// Field checks that do not need the stored item.
    pub fn validate(&self, item_id: &str) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name(item_id, name)?;
        }
        if let Some(target) = self.target_price {
            validate_target_price(item_id, target)?;
        }
        Ok(())
    }
}

/// Persistent state for tracked items, their marketplace listings, price
/// history and the match audit trail.
#[async_trait]
pub trait Store: Send + Sync {
    async fn tracked_items(&self) -> Result<Vec<TrackedItem>>;

    async fn get_item(&self, item_id: &str) -> Result<Option<TrackedItem>>;

    /// Insert or replace an item, keeping its listings and history.
    async fn upsert_item(&self, item: &TrackedItem) -> Result<()>;

    /// Apply an owner edit to the stored item without touching any field a
    /// check commit writes. Returns the item as stored afterwards.
    async fn update_owner_fields(&self, item_id: &str, edit: &OwnerEdit) -> Result<TrackedItem>;

    /// Remove an item together with everything attached to it.
    async fn delete_item(&self, item_id: &str) -> Result<bool>;

    async fn listings(&self, item_id: &str) -> Result<Vec<MarketplaceListing>>;

    /// Insert or replace the listing keyed by (item, marketplace, status).
    async fn put_listing(&self, listing: &MarketplaceListing) -> Result<()>;

    async fn delete_listing(&self, item_id: &str, marketplace: Marketplace, status: ListingStatus) -> Result<bool>;

    async fn set_primary(&self, item_id: &str, marketplace: Option<Marketplace>) -> Result<()>;

    /// Apply one item check atomically.
    async fn commit_check(&self, commit: &CheckCommit) -> Result<()>;

    /// Most recent first, at most `limit` entries.
    async fn price_history(&self, item_id: &str, limit: usize) -> Result<Vec<PriceHistoryEntry>>;

    async fn append_match_record(&self, record: &MatchHistoryRecord) -> Result<()>;

    /// Most recent first.
    async fn match_history(&self, item_id: &str) -> Result<Vec<MatchHistoryRecord>>;
}

/// Checks shared by every backend before a commit touches anything.
pub(crate) fn validate_commit(commit: &CheckCommit, last_history_at: Option<TimestampNs>) -> Result<()> {
    if let Some(r) = &commit.resolution {
        let prices = [r.authoritative_price, r.lowest_ever, r.highest_ever];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(AppError::InvalidInput(format!(
                "refusing to store invalid price for item {}",
                commit.item_id
            )));
        }
        if !(r.lowest_ever <= r.authoritative_price && r.authoritative_price <= r.highest_ever) {
            return Err(AppError::InvalidInput(format!(
                "price {} outside [{}, {}] for item {}",
                r.authoritative_price, r.lowest_ever, r.highest_ever, commit.item_id
            )));
        }
    }

    let mut previous = last_history_at;
    for entry in &commit.history {
        if entry.item_id != commit.item_id {
            return Err(AppError::InvalidInput(format!(
                "history entry for {} in commit for {}",
                entry.item_id, commit.item_id
            )));
        }
        if !entry.price.is_finite() || entry.price <= 0.0 {
            return Err(AppError::InvalidInput(format!("invalid history price {}", entry.price)));
        }
        if previous.is_some_and(|prev| entry.checked_at < prev) {
            return Err(AppError::InvalidInput(format!(
                "history for item {} would go back in time",
                commit.item_id
            )));
        }
        previous = Some(entry.checked_at);
    }
    Ok(())
}

pub(crate) fn validate_listing(listing: &MarketplaceListing) -> Result<()> {
    if let Some(c) = listing.confidence {
        if !(0.0..=1.0).contains(&c) {
            return Err(AppError::InvalidInput(format!("listing confidence {c} outside [0, 1]")));
        }
    }
    if let Some(p) = listing.last_price {
        if !p.is_finite() || p <= 0.0 {
            return Err(AppError::InvalidInput(format!("invalid listing price {p}")));
        }
    }
    Ok(())
}
