//! Scripted collaborators and fixtures shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::alert::{Notifier, PriceAlert};
use crate::error::{AppError, Result};
use crate::matching::{Comparator, MatchingEngine};
use crate::retry::RetryPolicy;
use crate::source::{PriceReference, PriceSource};
use crate::state::{CheckCommit, MemoryStore, OwnerEdit, Store};
use crate::types::{
    now_ns, Candidate, ListingStatus, Marketplace, MarketplaceListing, MatchDecision, MatchFactors,
    MatchHistoryRecord, PriceHistoryEntry, PriceObservation, Product, TrackedItem,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn product(name: &str, price: Option<f64>) -> Product {
    Product { name: name.to_string(), price, url: None, image_url: None }
}

pub fn candidate(name: &str, price: Option<f64>, marketplace: Marketplace) -> Candidate {
    Candidate { product: product(name, price), marketplace }
}

pub fn item(name: &str, target_price: f64) -> TrackedItem {
    let slug = name.to_lowercase().replace(' ', "-");
    TrackedItem::new(
        "owner@example.com",
        name,
        Some(format!("https://shop.example.com/p/{slug}")),
        target_price,
    )
}

/// Active listing with a confirmed-level confidence.
pub fn listing(item_id: &str, marketplace: Marketplace, price: Option<f64>, checked_at: i64) -> MarketplaceListing {
    MarketplaceListing {
        item_id: item_id.to_string(),
        marketplace,
        listing_ref: format!("https://{marketplace}.example.com/listing/{item_id}"),
        status: ListingStatus::Active,
        last_price: price,
        last_checked_at: Some(checked_at),
        in_stock: true,
        confidence: Some(0.9),
    }
}

pub fn decision(confidence: f64) -> MatchDecision {
    MatchDecision {
        is_match: confidence >= 0.85,
        confidence,
        reasoning: "scripted".to_string(),
        factors: MatchFactors {
            name_match: confidence,
            price_match: confidence,
            specs_match: confidence,
            image_match: None,
        },
        degraded: false,
    }
}

/// One retry, millisecond backoff.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(1, Duration::from_millis(1), Duration::from_secs(2))
}

pub fn matcher(comparator: ScriptedComparator) -> MatchingEngine {
    MatchingEngine::new(Arc::new(comparator), fast_retry())
}

// ---------------------------------------------------------------------------
// Comparator
// ---------------------------------------------------------------------------

pub struct ScriptedComparator {
    confidence: f64,
    is_match: bool,
    failing: bool,
    broken_batch: bool,
    /// Candidate names containing the needle get the paired confidence.
    by_title: Vec<(String, f64)>,
    single: AtomicUsize,
    batch: AtomicUsize,
}

impl ScriptedComparator {
    pub fn fixed(confidence: f64, is_match: bool) -> Self {
        Self {
            confidence,
            is_match,
            failing: false,
            broken_batch: false,
            by_title: Vec::new(),
            single: AtomicUsize::new(0),
            batch: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self { failing: true, ..Self::fixed(0.0, false) }
    }

    pub fn with_broken_batch(mut self) -> Self {
        self.broken_batch = true;
        self
    }

    pub fn with_title(mut self, needle: &str, confidence: f64) -> Self {
        self.by_title.push((needle.to_string(), confidence));
        self
    }

    pub fn single_calls(&self) -> usize {
        self.single.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch.load(Ordering::SeqCst)
    }

    fn decide(&self, candidate: &Candidate) -> MatchDecision {
        let confidence = self
            .by_title
            .iter()
            .find(|(needle, _)| candidate.product.name.contains(needle.as_str()))
            .map_or(self.confidence, |(_, c)| *c);
        MatchDecision { is_match: self.is_match, ..decision(confidence) }
    }
}

#[async_trait]
impl Comparator for ScriptedComparator {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn compare(&self, _reference: &Product, candidate: &Candidate) -> Result<MatchDecision> {
        self.single.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(AppError::MatchingUnavailable("scripted outage".to_string()));
        }
        Ok(self.decide(candidate))
    }

    async fn compare_batch(&self, _reference: &Product, candidates: &[Candidate]) -> Result<Vec<MatchDecision>> {
        self.batch.fetch_add(1, Ordering::SeqCst);
        if self.failing || self.broken_batch {
            return Err(AppError::MatchingUnavailable("scripted batch failure".to_string()));
        }
        Ok(candidates.iter().map(|c| self.decide(c)).collect())
    }
}

// ---------------------------------------------------------------------------
// Price source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Reply {
    Price(f64),
    Titled(f64, String),
    Fail,
}

type SourceKey = (String, Option<Marketplace>);

/// Answers by (item name, marketplace); `None` marketplace is the direct
/// item URL. Unscripted references fail.
#[derive(Default)]
pub struct ScriptedSource {
    replies: Mutex<HashMap<SourceKey, Reply>>,
    outages: Mutex<HashMap<SourceKey, u32>>,
    calls: Mutex<Vec<(PriceReference, Instant)>>,
    delay: Duration,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call takes at least `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay, ..Self::default() }
    }

    pub fn set(&self, name: &str, marketplace: Option<Marketplace>, reply: Reply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.insert((name.to_string(), marketplace), reply);
        }
    }

    /// The next `failures` calls for the key fail before the reply is used.
    pub fn flaky(&self, name: &str, marketplace: Option<Marketplace>, failures: u32) {
        if let Ok(mut outages) = self.outages.lock() {
            outages.insert((name.to_string(), marketplace), failures);
        }
    }

    pub fn calls(&self) -> Vec<(PriceReference, Instant)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl PriceSource for ScriptedSource {
    async fn fetch_price(&self, reference: &PriceReference) -> Result<PriceObservation> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((reference.clone(), Instant::now()));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let key = (reference.name.clone(), reference.marketplace);
        let outage = self.outages.lock().ok().and_then(|mut o| {
            let left = o.get_mut(&key)?;
            (*left > 0).then(|| *left -= 1)
        });
        if outage.is_some() {
            return Err(AppError::SourceUnavailable("scripted outage".to_string()));
        }

        let reply = self.replies.lock().ok().and_then(|r| r.get(&key).cloned());
        let (price, title) = match reply {
            Some(Reply::Price(p)) => (p, None),
            Some(Reply::Titled(p, t)) => (p, Some(t)),
            Some(Reply::Fail) => return Err(AppError::SourceUnavailable("scripted failure".to_string())),
            None => return Err(AppError::SourceUnavailable(format!("no script for {}", reference.name))),
        };
        Ok(PriceObservation {
            price: crate::source::validate_price(price)?,
            source: reference.marketplace.map_or("direct".to_string(), |m| m.to_string()),
            observed_at: now_ns(),
            title,
            in_stock: Some(true),
        })
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<PriceAlert>>,
    attempts: AtomicUsize,
    failing: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { failing: true, ..Self::default() }
    }

    pub fn sent(&self) -> Vec<PriceAlert> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_price_alert(&self, alert: &PriceAlert) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(AppError::Notification("scripted delivery failure".to_string()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(alert.clone());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Memory store that starts failing like an unreachable database.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    /// Commits succeed this many times, then fail.
    commits_before_failure: Option<usize>,
    unreachable: bool,
    commits: AtomicUsize,
}

impl FlakyStore {
    pub fn failing_commits_after(inner: Arc<MemoryStore>, commits: usize) -> Self {
        Self { inner, commits_before_failure: Some(commits), unreachable: false, commits: AtomicUsize::new(0) }
    }

    pub fn unreachable(inner: Arc<MemoryStore>) -> Self {
        Self { inner, commits_before_failure: None, unreachable: true, commits: AtomicUsize::new(0) }
    }

    fn down() -> AppError {
        AppError::Database(sqlx::Error::PoolTimedOut)
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn tracked_items(&self) -> Result<Vec<TrackedItem>> {
        if self.unreachable {
            return Err(Self::down());
        }
        self.inner.tracked_items().await
    }

    async fn get_item(&self, item_id: &str) -> Result<Option<TrackedItem>> {
        self.inner.get_item(item_id).await
    }

    async fn upsert_item(&self, item: &TrackedItem) -> Result<()> {
        self.inner.upsert_item(item).await
    }

    async fn update_owner_fields(&self, item_id: &str, edit: &OwnerEdit) -> Result<TrackedItem> {
        self.inner.update_owner_fields(item_id, edit).await
    }

    async fn delete_item(&self, item_id: &str) -> Result<bool> {
        self.inner.delete_item(item_id).await
    }

    async fn listings(&self, item_id: &str) -> Result<Vec<MarketplaceListing>> {
        self.inner.listings(item_id).await
    }

    async fn put_listing(&self, listing: &MarketplaceListing) -> Result<()> {
        self.inner.put_listing(listing).await
    }

    async fn delete_listing(&self, item_id: &str, marketplace: Marketplace, status: ListingStatus) -> Result<bool> {
        self.inner.delete_listing(item_id, marketplace, status).await
    }

    async fn set_primary(&self, item_id: &str, marketplace: Option<Marketplace>) -> Result<()> {
        self.inner.set_primary(item_id, marketplace).await
    }

    async fn commit_check(&self, commit: &CheckCommit) -> Result<()> {
        let done = self.commits.fetch_add(1, Ordering::SeqCst);
        if self.commits_before_failure.is_some_and(|limit| done >= limit) {
            return Err(Self::down());
        }
        self.inner.commit_check(commit).await
    }

    async fn price_history(&self, item_id: &str, limit: usize) -> Result<Vec<PriceHistoryEntry>> {
        self.inner.price_history(item_id, limit).await
    }

    async fn append_match_record(&self, record: &MatchHistoryRecord) -> Result<()> {
        self.inner.append_match_record(record).await
    }

    async fn match_history(&self, item_id: &str) -> Result<Vec<MatchHistoryRecord>> {
        self.inner.match_history(item_id).await
    }
}
