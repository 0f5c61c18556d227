/// Database row types matching migrations/0001_init.sql.
/// Conversions into domain types parse the stored tags and reject unknown ones.
use crate::error::{AppError, Result};
use crate::types::{
    ListingStatus, Marketplace, MarketplaceListing, MatchHistoryRecord, PriceHistoryEntry, TrackedItem,
};

#[derive(Debug, sqlx::FromRow)]
pub struct ItemRow {
    pub id: String,
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
    pub last_checked_at: Option<i64>,
    pub primary_marketplace: Option<String>,
    pub created_at: i64,
}

impl TryFrom<ItemRow> for TrackedItem {
    type Error = AppError;

    fn try_from(r: ItemRow) -> Result<Self> {
        Ok(TrackedItem {
            primary_marketplace: r.primary_marketplace.as_deref().map(str::parse::<Marketplace>).transpose()?,
            id: r.id,
            owner: r.owner,
            name: r.name,
            url: r.url,
            image_url: r.image_url,
            target_price: r.target_price,
            tracking_enabled: r.tracking_enabled,
            purchased: r.purchased,
            current_price: r.current_price,
            lowest_price: r.lowest_price,
            highest_price: r.highest_price,
            last_checked_at: r.last_checked_at,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct ListingRow {
    pub item_id: String,
    pub marketplace: String,
    pub status: String,
    pub listing_ref: String,
    pub last_price: Option<f64>,
    pub last_checked_at: Option<i64>,
    pub in_stock: bool,
    pub confidence: Option<f64>,
}

impl TryFrom<ListingRow> for MarketplaceListing {
    type Error = AppError;

    fn try_from(r: ListingRow) -> Result<Self> {
        Ok(MarketplaceListing {
            marketplace: r.marketplace.parse::<Marketplace>()?,
            status: r.status.parse::<ListingStatus>()?,
            item_id: r.item_id,
            listing_ref: r.listing_ref,
            last_price: r.last_price,
            last_checked_at: r.last_checked_at,
            in_stock: r.in_stock,
            confidence: r.confidence,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct PriceHistoryRow {
    pub item_id: String,
    pub price: f64,
    pub source: String,
    pub checked_at: i64,
}

impl From<PriceHistoryRow> for PriceHistoryEntry {
    fn from(r: PriceHistoryRow) -> Self {
        PriceHistoryEntry { item_id: r.item_id, price: r.price, source: r.source, checked_at: r.checked_at }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct MatchHistoryRow {
    pub item_id: String,
    pub marketplace: String,
    pub listing_ref: String,
    pub confidence: f64,
    pub outcome: String,
    pub reasoning: String,
    pub recorded_at: i64,
}

impl TryFrom<MatchHistoryRow> for MatchHistoryRecord {
    type Error = AppError;

    fn try_from(r: MatchHistoryRow) -> Result<Self> {
        Ok(MatchHistoryRecord {
            marketplace: r.marketplace.parse()?,
            outcome: r.outcome.parse()?,
            item_id: r.item_id,
            listing_ref: r.listing_ref,
            confidence: r.confidence,
            reasoning: r.reasoning,
            recorded_at: r.recorded_at,
        })
    }
}
