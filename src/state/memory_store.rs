use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{AppError, Result};
use crate::state::{validate_commit, validate_listing, CheckCommit, OwnerEdit, Store};
use crate::types::{
    ListingStatus, Marketplace, MarketplaceListing, MatchHistoryRecord, PriceHistoryEntry, TrackedItem,
};

/// Everything stored for one tracked item. Held under a single DashMap entry so
/// a check commit is applied while holding that entry's lock.
#[derive(Debug, Clone)]
struct ItemRecord {
    item: TrackedItem,
    listings: Vec<MarketplaceListing>,
    /// Insertion order, oldest first.
    history: Vec<PriceHistoryEntry>,
    matches: Vec<MatchHistoryRecord>,
}

impl ItemRecord {
    fn new(item: TrackedItem) -> Self {
        Self { item, listings: Vec::new(), history: Vec::new(), matches: Vec::new() }
    }

    fn listing_mut(&mut self, marketplace: Marketplace, status: ListingStatus) -> Option<&mut MarketplaceListing> {
        self.listings.iter_mut().find(|l| l.marketplace == marketplace && l.status == status)
    }
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    /// item_id → item state
    items: DashMap<String, ItemRecord>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn missing(item_id: &str) -> AppError {
        AppError::NotFound(format!("item {item_id}"))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn tracked_items(&self) -> Result<Vec<TrackedItem>> {
        let mut items: Vec<TrackedItem> = self.items.iter().map(|r| r.item.clone()).collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn get_item(&self, item_id: &str) -> Result<Option<TrackedItem>> {
        Ok(self.items.get(item_id).map(|r| r.item.clone()))
    }

    async fn upsert_item(&self, item: &TrackedItem) -> Result<()> {
        self.items
            .entry(item.id.clone())
            .and_modify(|r| r.item = item.clone())
            .or_insert_with(|| ItemRecord::new(item.clone()));
        Ok(())
    }

    async fn update_owner_fields(&self, item_id: &str, edit: &OwnerEdit) -> Result<TrackedItem> {
        edit.validate(item_id)?;
        let mut record = self.items.get_mut(item_id).ok_or_else(|| Self::missing(item_id))?;
        edit.apply(&mut record.item);
        Ok(record.item.clone())
    }

    async fn delete_item(&self, item_id: &str) -> Result<bool> {
        Ok(self.items.remove(item_id).is_some())
    }

    async fn listings(&self, item_id: &str) -> Result<Vec<MarketplaceListing>> {
        Ok(self.items.get(item_id).map(|r| r.listings.clone()).unwrap_or_default())
    }

    async fn put_listing(&self, listing: &MarketplaceListing) -> Result<()> {
        validate_listing(listing)?;
        let mut record = self.items.get_mut(&listing.item_id).ok_or_else(|| Self::missing(&listing.item_id))?;
        match record.listing_mut(listing.marketplace, listing.status) {
            Some(existing) => *existing = listing.clone(),
            None => record.listings.push(listing.clone()),
        }
        Ok(())
    }

    async fn delete_listing(&self, item_id: &str, marketplace: Marketplace, status: ListingStatus) -> Result<bool> {
        let Some(mut record) = self.items.get_mut(item_id) else {
            return Ok(false);
        };
        let before = record.listings.len();
        record.listings.retain(|l| !(l.marketplace == marketplace && l.status == status));
        Ok(record.listings.len() != before)
    }

    async fn set_primary(&self, item_id: &str, marketplace: Option<Marketplace>) -> Result<()> {
        let mut record = self.items.get_mut(item_id).ok_or_else(|| Self::missing(item_id))?;
        record.item.primary_marketplace = marketplace;
        Ok(())
    }

    async fn commit_check(&self, commit: &CheckCommit) -> Result<()> {
        let mut record = self.items.get_mut(&commit.item_id).ok_or_else(|| Self::missing(&commit.item_id))?;
        validate_commit(commit, record.history.last().map(|h| h.checked_at))?;

        // Validated: from here on nothing can fail, so the entry is updated in one go.
        for update in &commit.listing_updates {
            if let Some(listing) = record.listing_mut(update.marketplace, ListingStatus::Active) {
                listing.last_checked_at = Some(update.checked_at);
                if let Some(price) = update.price {
                    listing.last_price = Some(price);
                }
                if let Some(in_stock) = update.in_stock {
                    listing.in_stock = in_stock;
                }
            }
        }

        let item = &mut record.item;
        item.last_checked_at = Some(commit.checked_at);
        if let Some(r) = &commit.resolution {
            item.current_price = Some(r.authoritative_price);
            item.primary_marketplace = r.primary_marketplace;
            item.lowest_price = Some(r.lowest_ever);
            item.highest_price = Some(r.highest_ever);
        }

        record.history.extend(commit.history.iter().cloned());
        Ok(())
    }

    async fn price_history(&self, item_id: &str, limit: usize) -> Result<Vec<PriceHistoryEntry>> {
        Ok(self
            .items
            .get(item_id)
            .map(|r| r.history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn append_match_record(&self, record: &MatchHistoryRecord) -> Result<()> {
        let mut entry = self.items.get_mut(&record.item_id).ok_or_else(|| Self::missing(&record.item_id))?;
        entry.matches.push(record.clone());
        Ok(())
    }

    async fn match_history(&self, item_id: &str) -> Result<Vec<MatchHistoryRecord>> {
        Ok(self
            .items
            .get(item_id)
            .map(|r| r.matches.iter().rev().cloned().collect())
            .unwrap_or_default())
    }
}
