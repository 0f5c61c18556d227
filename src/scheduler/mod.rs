pub mod ticker;

pub use ticker::ReconcileTicker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::alert::{should_alert, Notifier, PriceAlert};
use crate::api::health::RunHealth;
use crate::api::latency::FetchLatency;
use crate::config::{Config, DIRECT_SOURCE_TAG};
use crate::consensus::{apply, resolve};
use crate::error::{AppError, Result};
use crate::matching::{decision_for, MatchingEngine};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::source::{search_url, PriceReference, PriceSource};
use crate::state::{CheckCommit, ListingUpdate, Store};
use crate::types::{
    now_ns, Candidate, Decision, MarketplaceListing, PriceHistoryEntry, PriceObservation, Product, RunReport,
    TimestampNs, TrackedItem,
};

/// Items that should be re-checked now: tracking enabled, not purchased, a
/// usable http(s) reference, and either never checked or checked at least
/// `stale_after` ago. Never-checked items come first, then the stalest.
pub fn select_due(items: &[TrackedItem], now: TimestampNs, stale_after: Duration) -> Vec<TrackedItem> {
    let stale_ns = i64::try_from(stale_after.as_nanos()).unwrap_or(i64::MAX);
    let mut due: Vec<TrackedItem> = items
        .iter()
        .filter(|item| is_trackable(item))
        .filter(|item| match item.last_checked_at {
            None => true,
            Some(last) => now.saturating_sub(last) >= stale_ns,
        })
        .cloned()
        .collect();
    due.sort_by(|a, b| {
        a.last_checked_at
            .cmp(&b.last_checked_at)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    due
}

/// Fold item outcomes into `report`. Anything neither successful nor failed
/// counts as skipped.
fn tally(report: &mut RunReport, outcomes: impl IntoIterator<Item = ItemOutcome>) {
    for outcome in outcomes {
        if outcome.skipped {
            continue;
        }
        if outcome.success {
            report.successful += 1;
        } else {
            report.failed += 1;
        }
        if outcome.alert_sent {
            report.alerts_sent += 1;
        }
        report.errors.extend(outcome.errors);
    }
    report.skipped = report.total.saturating_sub(report.successful + report.failed);
}

/// Tracking enabled, not purchased and a usable http(s) reference.
fn is_trackable(item: &TrackedItem) -> bool {
    item.tracking_enabled && !item.purchased && item.resolvable_url().is_some()
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Upper bound on items processed per run; the rest stay due.
    pub max_items: usize,
    /// Minimum spacing between consecutive fetches of one worker.
    pub inter_request_delay: Duration,
    /// Applied to every source fetch and alert delivery.
    pub retry: RetryPolicy,
    pub max_concurrency: usize,
    pub stale_after: Duration,
}

impl BatchOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_items: cfg.max_items_per_run,
            inter_request_delay: cfg.inter_request_delay,
            retry: RetryPolicy::new(cfg.max_retries, cfg.retry_base_delay, cfg.fetch_timeout),
            max_concurrency: cfg.max_concurrency,
            stale_after: cfg.stale_after,
        }
    }
}

/// Keeps at least `delay` of idle time between the end of one fetch and the
/// start of the next, whatever the outcome of the first.
struct Pacer {
    delay: Duration,
    last_done: Option<Instant>,
}

impl Pacer {
    fn new(delay: Duration) -> Self {
        Self { delay, last_done: None }
    }

    async fn wait(&self) {
        if let Some(done) = self.last_done {
            tokio::time::sleep_until(done + self.delay).await;
        }
    }

    /// Call once a fetch, its retries included, has finished.
    fn done(&mut self) {
        self.last_done = Some(Instant::now());
    }
}

/// Per-item result folded into the run report.
#[derive(Debug, Default)]
struct ItemOutcome {
    success: bool,
    /// Not checked at all; counted as skipped, not failed.
    skipped: bool,
    alert_sent: bool,
    errors: Vec<String>,
}

impl ItemOutcome {
    fn failed(error: String) -> Self {
        Self { errors: vec![error], ..Self::default() }
    }

    fn skipped() -> Self {
        Self { skipped: true, ..Self::default() }
    }
}

/// Scheduled checks only touch items that are still due-eligible when their
/// turn comes; an on-demand check is an explicit request and ignores the
/// tracking flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckMode {
    Scheduled,
    OnDemand,
}

/// Shared between workers: set once by the first run-level error.
#[derive(Default)]
struct AbortSignal {
    reason: Mutex<Option<String>>,
    set: AtomicBool,
}

impl AbortSignal {
    fn trip(&self, reason: String) {
        if let Ok(mut r) = self.reason.lock() {
            r.get_or_insert(reason);
        }
        self.set.store(true, Ordering::Release);
    }

    fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    fn reason(&self) -> Option<String> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }
}

/// Holds the run slot; released on drop so an abandoned run cannot wedge it.
struct RunSlot<'a> {
    health: &'a RunHealth,
    report: Option<RunReport>,
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        self.health.finish(self.report.as_ref());
    }
}

/// Runs reconciliation batches: fetch, gate, resolve, commit, alert.
pub struct Reconciler {
    store: Arc<dyn Store>,
    source: Arc<dyn PriceSource>,
    matcher: Arc<MatchingEngine>,
    notifier: Arc<dyn Notifier>,
    options: BatchOptions,
    health: Arc<RunHealth>,
    latency: Arc<FetchLatency>,
    cancel: AtomicBool,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn PriceSource>,
        matcher: Arc<MatchingEngine>,
        notifier: Arc<dyn Notifier>,
        options: BatchOptions,
    ) -> Self {
        Self {
            store,
            source,
            matcher,
            notifier,
            options,
            health: Arc::new(RunHealth::new()),
            latency: Arc::new(FetchLatency::new()),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn with_latency(mut self, latency: Arc<FetchLatency>) -> Self {
        self.latency = latency;
        self
    }

    pub fn health(&self) -> &Arc<RunHealth> {
        &self.health
    }

    /// Ask the current run to stop. Items already being processed finish;
    /// nothing new is started.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Select due items and run one batch over them. Only one run at a time;
    /// a second concurrent call gets `RunInProgress`.
    pub async fn run_reconciliation(&self) -> Result<RunReport> {
        if !self.health.try_start() {
            return Err(AppError::RunInProgress);
        }
        let mut slot = RunSlot { health: &self.health, report: None };
        self.cancel.store(false, Ordering::Release);

        let report = match self.store.tracked_items().await {
            Ok(items) => {
                let due = select_due(&items, now_ns(), self.options.stale_after);
                info!(
                    tracked = items.len(),
                    due = due.len(),
                    "Reconciliation run started: {} of {} items due",
                    due.len(),
                    items.len(),
                );
                self.run_batch(due).await
            }
            Err(e) => {
                error!("Reconciliation run aborted, store unavailable: {e}");
                let now = now_ns();
                RunReport {
                    success: false,
                    run_error: Some(e.to_string()),
                    started_at: now,
                    finished_at: now,
                    ..Default::default()
                }
            }
        };

        slot.report = Some(report.clone());
        Ok(report)
    }

    /// Check one item now, whatever its due window or tracking flags. Uses the
    /// same run slot as batch runs: refused with `RunInProgress` while one is
    /// going.
    pub async fn check_item(&self, item_id: &str) -> Result<RunReport> {
        if !self.health.try_start() {
            return Err(AppError::RunInProgress);
        }
        // Released without a report: on-demand checks are not counted as runs.
        let _slot = RunSlot { health: &self.health, report: None };

        let item = self
            .store
            .get_item(item_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("item {item_id}")))?;

        let started_at = now_ns();
        let mut pacer = Pacer::new(self.options.inter_request_delay);
        let outcome = self.process_item(&item, &mut pacer, CheckMode::OnDemand).await?;

        let mut report = RunReport { success: true, total: 1, started_at, ..Default::default() };
        tally(&mut report, [outcome]);
        report.finished_at = now_ns();
        info!(
            event = "ITEM_CHECK_COMPLETE",
            item_id = %item.id,
            successful = report.successful,
            alerts = report.alerts_sent,
            "ON-DEMAND CHECK | {} | ok: {} | alerts: {}",
            item.name, report.successful, report.alerts_sent,
        );
        Ok(report)
    }

    /// Process at most `max_items` of `due`, in order, with a fixed pool of
    /// workers pulling from a shared queue.
    pub async fn run_batch(&self, due: Vec<TrackedItem>) -> RunReport {
        let started_at = now_ns();
        let batch: VecDeque<TrackedItem> = due.into_iter().take(self.options.max_items).collect();
        let total = batch.len();
        let queue = Mutex::new(batch);
        let abort = AbortSignal::default();

        let workers = self.options.max_concurrency.max(1).min(total.max(1));
        let results = join_all((0..workers).map(|_| self.worker(&queue, &abort))).await;

        let mut report = RunReport { success: true, total, started_at, ..Default::default() };
        tally(&mut report, results.into_iter().flatten());
        if let Some(reason) = abort.reason() {
            report.success = false;
            report.run_error = Some(reason);
        }
        report.finished_at = now_ns();

        info!(
            event = "RUN_COMPLETE",
            total = report.total,
            successful = report.successful,
            failed = report.failed,
            alerts = report.alerts_sent,
            skipped = report.skipped,
            "RUN COMPLETE | total: {} | ok: {} | failed: {} | alerts: {} | skipped: {}",
            report.total, report.successful, report.failed, report.alerts_sent, report.skipped,
        );
        report
    }

    async fn worker(&self, queue: &Mutex<VecDeque<TrackedItem>>, abort: &AbortSignal) -> Vec<ItemOutcome> {
        let mut pacer = Pacer::new(self.options.inter_request_delay);
        let mut outcomes = Vec::new();
        loop {
            if self.cancel.load(Ordering::Acquire) || abort.is_set() {
                break;
            }
            let next = match queue.lock() {
                Ok(mut q) => q.pop_front(),
                Err(_) => None,
            };
            let Some(item) = next else { break };

            match self.process_item(&item, &mut pacer, CheckMode::Scheduled).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(item_id = %item.id, "Store failure, aborting run: {e}");
                    abort.trip(e.to_string());
                    outcomes.push(ItemOutcome::failed(format!("{}: {e}", item.name)));
                }
            }
        }
        outcomes
    }

    /// Check one item. `Err` is reserved for run-level failures; everything
    /// item-specific ends up in the returned outcome.
    async fn process_item(&self, snapshot: &TrackedItem, pacer: &mut Pacer, mode: CheckMode) -> Result<ItemOutcome> {
        // Owner edits may have landed since selection.
        let Some(item) = self.store.get_item(&snapshot.id).await? else {
            return Ok(ItemOutcome::failed(format!("{}: item no longer exists", snapshot.name)));
        };
        if let Err(e) = item.validate() {
            warn!(item_id = %item.id, "Skipping invalid item: {e}");
            return Ok(ItemOutcome::failed(e.to_string()));
        }
        if mode == CheckMode::Scheduled && !is_trackable(&item) {
            info!(item_id = %item.id, "Skipping '{}': no longer tracked", item.name);
            return Ok(ItemOutcome::skipped());
        }

        let listings = self.store.listings(&item.id).await?;
        let mut active: Vec<MarketplaceListing> = listings.into_iter().filter(|l| l.is_active()).collect();
        let mut outcome = ItemOutcome::default();
        let mut updates = Vec::with_capacity(active.len());
        let mut direct: Option<PriceObservation> = None;

        if active.is_empty() {
            let Some(url) = item.resolvable_url() else {
                return Ok(ItemOutcome::failed(format!("{}: no usable product URL", item.name)));
            };
            let reference = PriceReference {
                name: item.name.clone(),
                url: url.to_string(),
                marketplace: None,
                listing_ref: None,
            };
            pacer.wait().await;
            let fetched = self.fetch(&reference).await;
            pacer.done();
            match fetched {
                Ok(obs) => {
                    outcome.success = true;
                    direct = Some(obs);
                }
                Err(e) => outcome.errors.push(format!("{}: {e}", item.name)),
            }
        } else {
            for listing in active.iter_mut() {
                let url = match search_url(listing.marketplace, &item.name) {
                    Ok(url) => url.to_string(),
                    Err(e) => {
                        outcome.errors.push(format!("{} ({}): {e}", item.name, listing.marketplace));
                        continue;
                    }
                };
                let reference = PriceReference {
                    name: item.name.clone(),
                    url,
                    marketplace: Some(listing.marketplace),
                    listing_ref: Some(listing.listing_ref.clone()),
                };
                pacer.wait().await;
                let checked_at = now_ns();
                let fetched = self.fetch(&reference).await;
                pacer.done();
                let observed = match fetched {
                    Ok(obs) => self.gate(&item, &reference, obs).await,
                    Err(e) => Err(e),
                };

                match observed {
                    Ok(obs) => {
                        outcome.success = true;
                        listing.last_price = Some(obs.price);
                        listing.last_checked_at = Some(checked_at);
                        if let Some(in_stock) = obs.in_stock {
                            listing.in_stock = in_stock;
                        }
                        updates.push(ListingUpdate {
                            marketplace: listing.marketplace,
                            checked_at,
                            price: Some(obs.price),
                            in_stock: obs.in_stock,
                        });
                    }
                    Err(e) => {
                        outcome.errors.push(format!("{} ({}): {e}", item.name, listing.marketplace));
                        listing.last_checked_at = Some(checked_at);
                        updates.push(ListingUpdate {
                            marketplace: listing.marketplace,
                            checked_at,
                            price: None,
                            in_stock: None,
                        });
                    }
                }
            }
        }

        let checked_at = now_ns();
        let resolution = if outcome.success { resolve(&item, &active, direct.as_ref()) } else { None };
        let history = resolution
            .iter()
            .map(|r| PriceHistoryEntry {
                item_id: item.id.clone(),
                price: r.authoritative_price,
                source: r.source.clone(),
                checked_at,
            })
            .collect();

        let commit = CheckCommit {
            item_id: item.id.clone(),
            checked_at,
            listing_updates: updates,
            resolution: resolution.clone(),
            history,
        };
        match self.store.commit_check(&commit).await {
            Ok(()) => {}
            Err(e @ (AppError::NotFound(_) | AppError::InvalidInput(_))) => {
                warn!(item_id = %item.id, "Check not committed: {e}");
                outcome.success = false;
                outcome.errors.push(format!("{}: {e}", item.name));
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        }

        let Some(resolution) = resolution else {
            warn!(
                item_id = %item.id,
                errors = outcome.errors.len(),
                "ITEM UNCHANGED | {} | no price observed",
                item.name,
            );
            return Ok(outcome);
        };

        let old_price = item.current_price;
        let new_price = resolution.authoritative_price;
        info!(
            event = "ITEM_CHECKED",
            item_id = %item.id,
            price = new_price,
            source = %resolution.source,
            "ITEM CHECKED | {} | ${:.2} via {} | low ${:.2} | high ${:.2}",
            item.name, new_price, resolution.source, resolution.lowest_ever, resolution.highest_ever,
        );

        if should_alert(old_price, new_price, item.target_price) {
            let alert = PriceAlert::for_item(&apply(&item, &resolution), old_price, new_price);
            match retry_with_backoff(&self.options.retry, "price alert", || self.notifier.send_price_alert(&alert)).await {
                Ok(()) => outcome.alert_sent = true,
                Err(e) => {
                    // The price state is already committed; the alert is only reported.
                    error!(item_id = %item.id, "Price alert delivery failed: {e}");
                    outcome.errors.push(format!("{}: alert not delivered: {e}", item.name));
                }
            }
        }

        Ok(outcome)
    }

    async fn fetch(&self, reference: &PriceReference) -> Result<PriceObservation> {
        let started = std::time::Instant::now();
        let result = retry_with_backoff(&self.options.retry, "price fetch", || self.source.fetch_price(reference)).await;
        let source = reference.marketplace.map_or(DIRECT_SOURCE_TAG.to_string(), |m| m.to_string());
        self.latency.record(&source, started.elapsed());
        result
    }

    /// An observation that names the listing it came from is only used when
    /// the matcher does not reject that listing as a different product.
    async fn gate(&self, item: &TrackedItem, reference: &PriceReference, obs: PriceObservation) -> Result<PriceObservation> {
        let (Some(title), Some(marketplace)) = (obs.title.as_deref(), reference.marketplace) else {
            return Ok(obs);
        };
        let candidate = Candidate {
            product: Product {
                name: title.to_string(),
                price: Some(obs.price),
                url: Some(reference.url.clone()),
                image_url: None,
            },
            marketplace,
        };
        let decision = self.matcher.match_one(&item.as_product(), &candidate).await;
        if !decision.degraded && decision_for(decision.confidence) == Decision::AutoReject {
            return Err(AppError::InvalidInput(format!(
                "observed listing '{title}' does not match ({:.2})",
                decision.confidence
            )));
        }
        Ok(obs)
    }
}

#[cfg(test)]
mod tests;
