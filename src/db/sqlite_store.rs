use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::db::models::{ItemRow, ListingRow, MatchHistoryRow, PriceHistoryRow};
use crate::error::{AppError, Result};
use crate::state::{validate_commit, validate_listing, CheckCommit, OwnerEdit, Store};
use crate::types::{
    ListingStatus, Marketplace, MarketplaceListing, MatchHistoryRecord, PriceHistoryEntry, TimestampNs,
    TrackedItem,
};

const ITEM_COLUMNS: &str = "id, owner, name, url, image_url, target_price, tracking_enabled, purchased, \
     current_price, lowest_price, highest_price, last_checked_at, primary_marketplace, created_at";

const LISTING_COLUMNS: &str =
    "item_id, marketplace, status, listing_ref, last_price, last_checked_at, in_stock, confidence";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and run pending migrations.
    pub async fn connect(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database ready at {db_path}");
        Ok(Self { pool })
    }

    /// Private in-memory database. A single never-recycled connection keeps it alive.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    async fn item_exists(&self, item_id: &str) -> Result<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT id FROM items WHERE id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn require_item(&self, item_id: &str) -> Result<()> {
        if self.item_exists(item_id).await? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("item {item_id}")))
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn tracked_items(&self) -> Result<Vec<TrackedItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TrackedItem::try_from).collect()
    }

    async fn get_item(&self, item_id: &str) -> Result<Option<TrackedItem>> {
        let row = sqlx::query_as::<_, ItemRow>(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"))
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TrackedItem::try_from).transpose()
    }

    async fn upsert_item(&self, item: &TrackedItem) -> Result<()> {
        let primary = item.primary_marketplace.map(|m| m.as_str());
        sqlx::query(
            r#"
            INSERT INTO items (
                id, owner, name, url, image_url, target_price, tracking_enabled, purchased,
                current_price, lowest_price, highest_price, last_checked_at, primary_marketplace, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                owner = excluded.owner,
                name = excluded.name,
                url = excluded.url,
                image_url = excluded.image_url,
                target_price = excluded.target_price,
                tracking_enabled = excluded.tracking_enabled,
                purchased = excluded.purchased,
                current_price = excluded.current_price,
                lowest_price = excluded.lowest_price,
                highest_price = excluded.highest_price,
                last_checked_at = excluded.last_checked_at,
                primary_marketplace = excluded.primary_marketplace
            "#,
        )
        .bind(&item.id)
        .bind(&item.owner)
        .bind(&item.name)
        .bind(&item.url)
        .bind(&item.image_url)
        .bind(item.target_price)
        .bind(item.tracking_enabled)
        .bind(item.purchased)
        .bind(item.current_price)
        .bind(item.lowest_price)
        .bind(item.highest_price)
        .bind(item.last_checked_at)
        .bind(primary)
        .bind(item.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_owner_fields(&self, item_id: &str, edit: &OwnerEdit) -> Result<TrackedItem> {
        edit.validate(item_id)?;
        let mut tx = self.pool.begin().await?;

        // Owner columns only. The CASE flags distinguish "leave alone" from "clear".
        let updated = sqlx::query(
            r#"
            UPDATE items
            SET name = COALESCE(?, name),
                url = CASE WHEN ? THEN ? ELSE url END,
                image_url = CASE WHEN ? THEN ? ELSE image_url END,
                target_price = COALESCE(?, target_price),
                tracking_enabled = COALESCE(?, tracking_enabled),
                purchased = COALESCE(?, purchased)
            WHERE id = ?
            "#,
        )
        .bind(edit.name.as_deref())
        .bind(edit.url.is_some())
        .bind(edit.url.clone().flatten())
        .bind(edit.image_url.is_some())
        .bind(edit.image_url.clone().flatten())
        .bind(edit.target_price)
        .bind(edit.tracking_enabled)
        .bind(edit.purchased)
        .bind(item_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(AppError::NotFound(format!("item {item_id}")));
        }

        let row = sqlx::query_as::<_, ItemRow>(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"))
            .bind(item_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        TrackedItem::try_from(row)
    }

    async fn delete_item(&self, item_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        for table in ["listings", "price_history", "match_history"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE item_id = ?"))
                .bind(item_id)
                .execute(&mut *tx)
                .await?;
        }
        let deleted = sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(item_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn listings(&self, item_id: &str) -> Result<Vec<MarketplaceListing>> {
        let rows = sqlx::query_as::<_, ListingRow>(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE item_id = ? ORDER BY marketplace, status"
        ))
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MarketplaceListing::try_from).collect()
    }

    async fn put_listing(&self, listing: &MarketplaceListing) -> Result<()> {
        validate_listing(listing)?;
        self.require_item(&listing.item_id).await?;
        sqlx::query(
            r#"
            INSERT INTO listings (item_id, marketplace, status, listing_ref, last_price, last_checked_at, in_stock, confidence)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(item_id, marketplace, status) DO UPDATE SET
                listing_ref = excluded.listing_ref,
                last_price = excluded.last_price,
                last_checked_at = excluded.last_checked_at,
                in_stock = excluded.in_stock,
                confidence = excluded.confidence
            "#,
        )
        .bind(&listing.item_id)
        .bind(listing.marketplace.as_str())
        .bind(listing.status.to_string())
        .bind(&listing.listing_ref)
        .bind(listing.last_price)
        .bind(listing.last_checked_at)
        .bind(listing.in_stock)
        .bind(listing.confidence)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_listing(&self, item_id: &str, marketplace: Marketplace, status: ListingStatus) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM listings WHERE item_id = ? AND marketplace = ? AND status = ?")
            .bind(item_id)
            .bind(marketplace.as_str())
            .bind(status.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn set_primary(&self, item_id: &str, marketplace: Option<Marketplace>) -> Result<()> {
        let updated = sqlx::query("UPDATE items SET primary_marketplace = ? WHERE id = ?")
            .bind(marketplace.map(|m| m.as_str()))
            .bind(item_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(AppError::NotFound(format!("item {item_id}")));
        }
        Ok(())
    }

    async fn commit_check(&self, commit: &CheckCommit) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM items WHERE id = ?")
            .bind(&commit.item_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(AppError::NotFound(format!("item {}", commit.item_id)));
        }

        let last_history_at: Option<TimestampNs> = sqlx::query_scalar(
            "SELECT checked_at FROM price_history WHERE item_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(&commit.item_id)
        .fetch_optional(&mut *tx)
        .await?;
        validate_commit(commit, last_history_at)?;

        for update in &commit.listing_updates {
            sqlx::query(
                r#"
                UPDATE listings
                SET last_checked_at = ?,
                    last_price = COALESCE(?, last_price),
                    in_stock = COALESCE(?, in_stock)
                WHERE item_id = ? AND marketplace = ? AND status = 'active'
                "#,
            )
            .bind(update.checked_at)
            .bind(update.price)
            .bind(update.in_stock)
            .bind(&commit.item_id)
            .bind(update.marketplace.as_str())
            .execute(&mut *tx)
            .await?;
        }

        match &commit.resolution {
            Some(r) => {
                sqlx::query(
                    r#"
                    UPDATE items
                    SET last_checked_at = ?, current_price = ?, primary_marketplace = ?,
                        lowest_price = ?, highest_price = ?
                    WHERE id = ?
                    "#,
                )
                .bind(commit.checked_at)
                .bind(r.authoritative_price)
                .bind(r.primary_marketplace.map(|m| m.as_str()))
                .bind(r.lowest_ever)
                .bind(r.highest_ever)
                .bind(&commit.item_id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("UPDATE items SET last_checked_at = ? WHERE id = ?")
                    .bind(commit.checked_at)
                    .bind(&commit.item_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        for entry in &commit.history {
            sqlx::query("INSERT INTO price_history (item_id, price, source, checked_at) VALUES (?, ?, ?, ?)")
                .bind(&entry.item_id)
                .bind(entry.price)
                .bind(&entry.source)
                .bind(entry.checked_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn price_history(&self, item_id: &str, limit: usize) -> Result<Vec<PriceHistoryEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, PriceHistoryRow>(
            r#"
            SELECT item_id, price, source, checked_at
            FROM price_history
            WHERE item_id = ?
            ORDER BY checked_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(item_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PriceHistoryEntry::from).collect())
    }

    async fn append_match_record(&self, record: &MatchHistoryRecord) -> Result<()> {
        self.require_item(&record.item_id).await?;
        sqlx::query(
            r#"
            INSERT INTO match_history (item_id, marketplace, listing_ref, confidence, outcome, reasoning, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.item_id)
        .bind(record.marketplace.as_str())
        .bind(&record.listing_ref)
        .bind(record.confidence)
        .bind(record.outcome.to_string())
        .bind(&record.reasoning)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn match_history(&self, item_id: &str) -> Result<Vec<MatchHistoryRecord>> {
        let rows = sqlx::query_as::<_, MatchHistoryRow>(
            r#"
            SELECT item_id, marketplace, listing_ref, confidence, outcome, reasoning, recorded_at
            FROM match_history
            WHERE item_id = ?
            ORDER BY recorded_at DESC, id DESC
            "#,
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MatchHistoryRecord::try_from).collect()
    }
}
