use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::state::{MemoryStore, OwnerEdit};
use crate::test_support::{
    fast_retry, item, listing, matcher, FlakyStore, RecordingNotifier, Reply, ScriptedComparator, ScriptedSource,
};
use crate::types::Marketplace;

const HOUR_NS: i64 = 3_600 * 1_000_000_000;

fn options() -> BatchOptions {
    BatchOptions {
        max_items: 100,
        inter_request_delay: Duration::ZERO,
        retry: fast_retry(),
        max_concurrency: 1,
        stale_after: Duration::from_secs(24 * 3_600),
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    source: Arc<ScriptedSource>,
    notifier: Arc<RecordingNotifier>,
    reconciler: Arc<Reconciler>,
}

fn harness_with(
    store: Arc<MemoryStore>,
    backing: Arc<dyn Store>,
    source: ScriptedSource,
    notifier: RecordingNotifier,
    comparator: ScriptedComparator,
    options: BatchOptions,
) -> Harness {
    let source = Arc::new(source);
    let notifier = Arc::new(notifier);
    let reconciler = Reconciler::new(backing, source.clone(), Arc::new(matcher(comparator)), notifier.clone(), options);
    Harness { store, source, notifier, reconciler: Arc::new(reconciler) }
}

fn harness(options: BatchOptions) -> Harness {
    let store = MemoryStore::new();
    harness_with(
        store.clone(),
        store,
        ScriptedSource::new(),
        RecordingNotifier::new(),
        ScriptedComparator::fixed(0.9, true),
        options,
    )
}

async fn add(store: &MemoryStore, name: &str, target: f64) -> TrackedItem {
    let it = item(name, target);
    store.upsert_item(&it).await.unwrap();
    it
}

// ---------------------------------------------------------------------------
// select_due
// ---------------------------------------------------------------------------

#[test]
fn due_requires_enabled_unpurchased_resolvable_and_stale() {
    let now = 100 * HOUR_NS;
    let stale = Duration::from_secs(24 * 3_600);

    let fresh = TrackedItem { last_checked_at: Some(now - HOUR_NS), ..item("Fresh", 10.0) };
    let old = TrackedItem { last_checked_at: Some(now - 25 * HOUR_NS), ..item("Old", 10.0) };
    let never = item("Never", 10.0);
    let disabled = TrackedItem { tracking_enabled: false, ..item("Disabled", 10.0) };
    let purchased = TrackedItem { purchased: true, ..item("Purchased", 10.0) };
    let no_url = TrackedItem { url: None, ..item("No Url", 10.0) };
    let bad_url = TrackedItem { url: Some("javascript:alert(1)".into()), ..item("Bad Url", 10.0) };

    let all = vec![fresh, old, never, disabled, purchased, no_url, bad_url];
    let due: Vec<String> = select_due(&all, now, stale).into_iter().map(|i| i.name).collect();
    assert_eq!(due, vec!["Never", "Old"]);
}

#[test]
fn exactly_stale_is_due() {
    let now = 100 * HOUR_NS;
    let boundary = TrackedItem { last_checked_at: Some(now - 24 * HOUR_NS), ..item("Edge", 10.0) };
    assert_eq!(select_due(&[boundary], now, Duration::from_secs(24 * 3_600)).len(), 1);
}

#[test]
fn stalest_first() {
    let now = 100 * HOUR_NS;
    let a = TrackedItem { last_checked_at: Some(now - 30 * HOUR_NS), ..item("A", 10.0) };
    let b = TrackedItem { last_checked_at: Some(now - 90 * HOUR_NS), ..item("B", 10.0) };
    let due: Vec<String> = select_due(&[a, b], now, Duration::from_secs(3_600)).into_iter().map(|i| i.name).collect();
    assert_eq!(due, vec!["B", "A"]);
}

// ---------------------------------------------------------------------------
// run_batch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_failing_item_does_not_stop_the_batch() {
    let h = harness(options());
    let a = add(&h.store, "Item A", 50.0).await;
    let mut b = item("Item B", 50.0);
    b.current_price = Some(70.0);
    h.store.upsert_item(&b).await.unwrap();
    let c = add(&h.store, "Item C", 50.0).await;

    h.source.set("Item A", None, Reply::Price(60.0));
    h.source.set("Item B", None, Reply::Fail);
    h.source.set("Item C", None, Reply::Price(65.0));

    let report = h.reconciler.run_batch(vec![a.clone(), b.clone(), c.clone()]).await;

    assert!(report.success);
    assert_eq!((report.total, report.successful, report.failed), (3, 2, 1));
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("Item B"));

    let b_after = h.store.get_item(&b.id).await.unwrap().unwrap();
    assert!(b_after.last_checked_at.is_some());
    assert_eq!(b_after.current_price, Some(70.0));
    assert!(h.store.price_history(&b.id, 10).await.unwrap().is_empty());

    let a_after = h.store.get_item(&a.id).await.unwrap().unwrap();
    assert_eq!(a_after.current_price, Some(60.0));
    assert_eq!(h.store.price_history(&c.id, 10).await.unwrap()[0].price, 65.0);
}

#[tokio::test]
async fn excess_items_remain_due() {
    let h = harness(BatchOptions { max_items: 2, ..options() });
    let mut due = Vec::new();
    for i in 0..5 {
        let name = format!("Item {i}");
        h.source.set(&name, None, Reply::Price(20.0 + i as f64));
        due.push(add(&h.store, &name, 10.0).await);
    }

    let report = h.reconciler.run_batch(due).await;
    assert_eq!(report.total, 2);
    assert_eq!(report.successful, 2);
    assert_eq!(h.source.call_count(), 2);

    let items = h.store.tracked_items().await.unwrap();
    let still_due = select_due(&items, now_ns(), Duration::from_secs(24 * 3_600));
    assert_eq!(still_due.len(), 3);
}

#[tokio::test]
async fn fetches_are_spaced_regardless_of_outcome() {
    let delay = Duration::from_millis(40);
    let h = harness(BatchOptions { inter_request_delay: delay, retry: RetryPolicy::new(0, Duration::ZERO, Duration::from_secs(1)), ..options() });
    let mut due = Vec::new();
    for (name, reply) in [("One", Reply::Price(5.0)), ("Two", Reply::Fail), ("Three", Reply::Price(7.0))] {
        h.source.set(name, None, reply);
        due.push(add(&h.store, name, 1.0).await);
    }

    h.reconciler.run_batch(due).await;

    let calls = h.source.calls();
    assert_eq!(calls.len(), 3);
    let spread = calls[2].1.duration_since(calls[0].1);
    assert!(spread >= delay * 2 - Duration::from_millis(5), "fetches only {spread:?} apart");
}

#[tokio::test]
async fn alert_fires_once_per_drop_across_runs() {
    let h = harness(options());
    let it = add(&h.store, "Desk Lamp", 100.0).await;

    let mut alerts = Vec::new();
    for price in [120.0, 80.0, 80.0, 120.0, 70.0] {
        h.source.set("Desk Lamp", None, Reply::Price(price));
        let report = h.reconciler.run_batch(vec![it.clone()]).await;
        alerts.push(report.alerts_sent);
    }

    assert_eq!(alerts, vec![0, 1, 0, 0, 1]);
    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].old_price, Some(120.0));
    assert_eq!(sent[1].new_price, 70.0);
    assert_eq!(sent[1].savings, 30.0);
    assert_eq!(sent[1].recipient, "owner@example.com");

    let stored = h.store.get_item(&it.id).await.unwrap().unwrap();
    assert_eq!((stored.lowest_price, stored.current_price, stored.highest_price), (Some(70.0), Some(70.0), Some(120.0)));
    assert_eq!(h.store.price_history(&it.id, 30).await.unwrap().len(), 5);
}

#[tokio::test]
async fn failed_delivery_keeps_committed_price() {
    let store = MemoryStore::new();
    let h = harness_with(
        store.clone(),
        store,
        ScriptedSource::new(),
        RecordingNotifier::failing(),
        ScriptedComparator::fixed(0.9, true),
        options(),
    );
    let it = add(&h.store, "Desk Lamp", 100.0).await;
    h.source.set("Desk Lamp", None, Reply::Price(80.0));

    let report = h.reconciler.run_batch(vec![it.clone()]).await;

    assert_eq!(report.successful, 1);
    assert_eq!(report.alerts_sent, 0);
    assert!(report.errors.iter().any(|e| e.contains("alert not delivered")));
    // Initial attempt plus one retry.
    assert_eq!(h.notifier.attempts(), 2);

    let stored = h.store.get_item(&it.id).await.unwrap().unwrap();
    assert_eq!(stored.current_price, Some(80.0));
    assert_eq!(h.store.price_history(&it.id, 30).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cheapest_listing_wins_and_failed_listing_is_only_touched() {
    let h = harness(options());
    let it = add(&h.store, "Wireless Headphones X200", 30.0).await;
    for mp in [Marketplace::Amazon, Marketplace::Walmart, Marketplace::Target] {
        h.store.put_listing(&listing(&it.id, mp, Some(50.0), 1)).await.unwrap();
    }
    h.source.set(&it.name, Some(Marketplace::Amazon), Reply::Price(42.0));
    h.source.set(&it.name, Some(Marketplace::Walmart), Reply::Price(39.5));
    h.source.set(&it.name, Some(Marketplace::Target), Reply::Fail);

    let report = h.reconciler.run_batch(vec![it.clone()]).await;

    assert_eq!((report.successful, report.failed), (1, 0));
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("target"));

    let stored = h.store.get_item(&it.id).await.unwrap().unwrap();
    assert_eq!(stored.current_price, Some(39.5));
    assert_eq!(stored.primary_marketplace, Some(Marketplace::Walmart));
    assert_eq!(h.store.price_history(&it.id, 1).await.unwrap()[0].source, "walmart");

    let target = h
        .store
        .listings(&it.id)
        .await
        .unwrap()
        .into_iter()
        .find(|l| l.marketplace == Marketplace::Target)
        .unwrap();
    assert_eq!(target.last_price, Some(50.0));
    assert!(target.last_checked_at.unwrap() > 1);

    // Failed fetches are timed too.
    for mp in ["amazon", "walmart", "target"] {
        assert_eq!(h.reconciler.latency.source(mp).samples, 1, "{mp}");
    }
    assert_eq!(h.reconciler.latency.source(DIRECT_SOURCE_TAG).samples, 0);

    let references: Vec<String> = h.source.calls().into_iter().map(|(r, _)| r.url).collect();
    assert!(references.iter().all(|u| u.contains("Wireless+Headphones+X200") || u.contains("Wireless%20Headphones%20X200")));
}

#[tokio::test]
async fn stale_listing_price_used_when_its_fetch_fails() {
    let h = harness(options());
    let it = add(&h.store, "Desk Lamp", 30.0).await;
    h.store.put_listing(&listing(&it.id, Marketplace::Amazon, Some(33.0), 1)).await.unwrap();
    h.store.put_listing(&listing(&it.id, Marketplace::BestBuy, Some(44.0), 1)).await.unwrap();
    h.source.set("Desk Lamp", Some(Marketplace::Amazon), Reply::Fail);
    h.source.set("Desk Lamp", Some(Marketplace::BestBuy), Reply::Price(41.0));

    h.reconciler.run_batch(vec![it.clone()]).await;

    let stored = h.store.get_item(&it.id).await.unwrap().unwrap();
    assert_eq!(stored.current_price, Some(33.0));
    assert_eq!(stored.primary_marketplace, Some(Marketplace::Amazon));
}

#[tokio::test]
async fn mismatched_listing_observation_is_dropped() {
    let store = MemoryStore::new();
    let h = harness_with(
        store.clone(),
        store,
        ScriptedSource::new(),
        RecordingNotifier::new(),
        ScriptedComparator::fixed(0.92, true).with_title("Refurbished", 0.3),
        options(),
    );
    let it = add(&h.store, "Desk Lamp", 10.0).await;
    h.store.put_listing(&listing(&it.id, Marketplace::Amazon, None, 1)).await.unwrap();
    h.store.put_listing(&listing(&it.id, Marketplace::Walmart, None, 1)).await.unwrap();
    h.source.set("Desk Lamp", Some(Marketplace::Amazon), Reply::Titled(45.0, "Desk Lamp, Black".into()));
    h.source.set("Desk Lamp", Some(Marketplace::Walmart), Reply::Titled(12.0, "Refurbished Desk Lamp Parts".into()));

    let report = h.reconciler.run_batch(vec![it.clone()]).await;

    assert_eq!(report.successful, 1);
    assert!(report.errors.iter().any(|e| e.contains("does not match")));
    let stored = h.store.get_item(&it.id).await.unwrap().unwrap();
    assert_eq!(stored.current_price, Some(45.0));
}

#[tokio::test]
async fn invalid_item_is_skipped_without_fetch_or_mutation() {
    let h = harness(options());
    let bad = TrackedItem { target_price: -5.0, ..item("Broken", 1.0) };
    h.store.upsert_item(&bad).await.unwrap();
    h.source.set("Broken", None, Reply::Price(9.0));

    let report = h.reconciler.run_batch(vec![bad.clone()]).await;

    assert_eq!(report.failed, 1);
    assert_eq!(h.source.call_count(), 0);
    assert_eq!(h.store.get_item(&bad.id).await.unwrap().unwrap(), bad);
}

#[tokio::test]
async fn transient_source_failure_is_retried() {
    let h = harness(options());
    let it = add(&h.store, "Desk Lamp", 10.0).await;
    h.source.set("Desk Lamp", None, Reply::Price(15.0));
    h.source.flaky("Desk Lamp", None, 1);

    let report = h.reconciler.run_batch(vec![it]).await;

    assert_eq!(report.successful, 1);
    assert!(report.errors.is_empty());
    assert_eq!(h.source.call_count(), 2);
}

#[tokio::test]
async fn store_failure_aborts_remaining_items() {
    let memory = MemoryStore::new();
    let flaky = Arc::new(FlakyStore::failing_commits_after(memory.clone(), 1));
    let h = harness_with(
        memory,
        flaky,
        ScriptedSource::new(),
        RecordingNotifier::new(),
        ScriptedComparator::fixed(0.9, true),
        options(),
    );
    let mut due = Vec::new();
    for name in ["One", "Two", "Three"] {
        h.source.set(name, None, Reply::Price(10.0));
        due.push(add(&h.store, name, 1.0).await);
    }

    let report = h.reconciler.run_batch(due).await;

    assert!(!report.success);
    assert!(report.run_error.is_some());
    assert_eq!((report.successful, report.failed, report.skipped), (1, 1, 1));
    assert_eq!(h.source.call_count(), 2);
}

#[tokio::test]
async fn unreachable_store_fails_the_run() {
    let memory = MemoryStore::new();
    let h = harness_with(
        memory.clone(),
        Arc::new(FlakyStore::unreachable(memory)),
        ScriptedSource::new(),
        RecordingNotifier::new(),
        ScriptedComparator::fixed(0.9, true),
        options(),
    );

    let report = h.reconciler.run_reconciliation().await.unwrap();
    assert!(!report.success);
    assert_eq!(report.total, 0);
    assert!(!h.reconciler.health().is_running());
    assert_eq!(h.reconciler.health().last_report(), Some(report));
}

// ---------------------------------------------------------------------------
// run_reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_reconciliation_checks_only_due_items() {
    let h = harness(options());
    let due = add(&h.store, "Due", 10.0).await;
    let purchased = TrackedItem { purchased: true, ..item("Bought", 10.0) };
    h.store.upsert_item(&purchased).await.unwrap();
    h.source.set("Due", None, Reply::Price(12.0));
    h.source.set("Bought", None, Reply::Price(12.0));

    let report = h.reconciler.run_reconciliation().await.unwrap();
    assert_eq!((report.total, report.successful), (1, 1));
    assert!(h.store.get_item(&purchased.id).await.unwrap().unwrap().last_checked_at.is_none());

    // Checked moments ago, so nothing is due on an immediate re-run.
    let again = h.reconciler.run_reconciliation().await.unwrap();
    assert_eq!(again.total, 0);
    assert_eq!(h.store.get_item(&due.id).await.unwrap().unwrap().current_price, Some(12.0));
    assert_eq!(h.reconciler.health().runs_completed(), 2);
}

#[tokio::test]
async fn overlapping_run_is_rejected() {
    let store = MemoryStore::new();
    let h = harness_with(
        store.clone(),
        store,
        ScriptedSource::with_delay(Duration::from_millis(200)),
        RecordingNotifier::new(),
        ScriptedComparator::fixed(0.9, true),
        options(),
    );
    add(&h.store, "Slow", 1.0).await;
    h.source.set("Slow", None, Reply::Price(3.0));

    let first = {
        let reconciler = h.reconciler.clone();
        tokio::spawn(async move { reconciler.run_reconciliation().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(h.reconciler.run_reconciliation().await, Err(AppError::RunInProgress)));
    let report = first.await.unwrap().unwrap();
    assert_eq!(report.successful, 1);
    assert!(h.reconciler.run_reconciliation().await.is_ok());
}

#[tokio::test]
async fn cancel_lets_in_flight_item_finish() {
    let store = MemoryStore::new();
    let h = harness_with(
        store.clone(),
        store,
        ScriptedSource::with_delay(Duration::from_millis(100)),
        RecordingNotifier::new(),
        ScriptedComparator::fixed(0.9, true),
        options(),
    );
    for i in 0..4 {
        let name = format!("Item {i}");
        h.source.set(&name, None, Reply::Price(5.0));
        add(&h.store, &name, 1.0).await;
    }

    let run = {
        let reconciler = h.reconciler.clone();
        tokio::spawn(async move { reconciler.run_reconciliation().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.reconciler.cancel();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.total, 4);
    assert_eq!(report.successful, 1);
    assert_eq!(report.skipped, 3);
    assert!(report.success);
}

#[tokio::test]
async fn worker_pool_processes_every_item_once() {
    let h = harness(BatchOptions { max_concurrency: 3, ..options() });
    let mut due = Vec::new();
    for i in 0..7 {
        let name = format!("Item {i}");
        h.source.set(&name, None, Reply::Price(10.0 + i as f64));
        due.push(add(&h.store, &name, 1.0).await);
    }

    let report = h.reconciler.run_batch(due.clone()).await;

    assert_eq!((report.total, report.successful, report.skipped), (7, 7, 0));
    assert_eq!(h.source.call_count(), 7);
    for it in due {
        assert_eq!(h.store.price_history(&it.id, 10).await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn delay_is_idle_time_after_a_slow_fetch() {
    let store = MemoryStore::new();
    let delay = Duration::from_millis(80);
    let fetch_time = Duration::from_millis(120);
    let h = harness_with(
        store.clone(),
        store,
        ScriptedSource::with_delay(fetch_time),
        RecordingNotifier::new(),
        ScriptedComparator::fixed(0.9, true),
        BatchOptions { inter_request_delay: delay, retry: RetryPolicy::new(0, Duration::ZERO, Duration::from_secs(1)), ..options() },
    );
    let mut due = Vec::new();
    for (name, reply) in [("Slow One", Reply::Fail), ("Slow Two", Reply::Price(4.0))] {
        h.source.set(name, None, reply);
        due.push(add(&h.store, name, 1.0).await);
    }

    h.reconciler.run_batch(due).await;

    let calls = h.source.calls();
    assert_eq!(calls.len(), 2);
    let start_to_start = calls[1].1.duration_since(calls[0].1);
    assert!(
        start_to_start >= fetch_time + delay - Duration::from_millis(5),
        "second fetch started {start_to_start:?} after the first"
    );
}

// ---------------------------------------------------------------------------
// eligibility changes during a run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn item_purchased_after_selection_is_skipped() {
    let h = harness(options());
    let bought = add(&h.store, "Bought Lamp", 100.0).await;
    let unlinked = add(&h.store, "Unlinked Lamp", 100.0).await;
    let kept = add(&h.store, "Kept Lamp", 100.0).await;
    for name in ["Bought Lamp", "Unlinked Lamp", "Kept Lamp"] {
        h.source.set(name, None, Reply::Price(50.0));
    }
    let due = select_due(&h.store.tracked_items().await.unwrap(), now_ns(), Duration::from_secs(3_600));
    assert_eq!(due.len(), 3);

    let purchased = OwnerEdit { purchased: Some(true), ..Default::default() };
    h.store.update_owner_fields(&bought.id, &purchased).await.unwrap();
    let cleared = OwnerEdit { url: Some(None), ..Default::default() };
    h.store.update_owner_fields(&unlinked.id, &cleared).await.unwrap();

    let report = h.reconciler.run_batch(due).await;

    assert_eq!((report.total, report.successful, report.failed, report.skipped), (3, 1, 0, 2));
    assert_eq!(report.alerts_sent, 1);
    let fetched: Vec<String> = h.source.calls().into_iter().map(|(r, _)| r.name).collect();
    assert_eq!(fetched, vec!["Kept Lamp".to_string()]);
    for skipped in [&bought, &unlinked] {
        let stored = h.store.get_item(&skipped.id).await.unwrap().unwrap();
        assert_eq!(stored.last_checked_at, None);
        assert_eq!(stored.current_price, None);
    }
    assert_eq!(h.store.get_item(&kept.id).await.unwrap().unwrap().current_price, Some(50.0));
}

// ---------------------------------------------------------------------------
// check_item
// ---------------------------------------------------------------------------

#[tokio::test]
async fn on_demand_check_ignores_due_window_and_tracking_flag() {
    let h = harness(options());
    let it = add(&h.store, "Desk Lamp", 100.0).await;
    h.source.set("Desk Lamp", None, Reply::Price(120.0));
    h.reconciler.run_batch(vec![it.clone()]).await;

    let paused = OwnerEdit { tracking_enabled: Some(false), ..Default::default() };
    h.store.update_owner_fields(&it.id, &paused).await.unwrap();
    assert!(select_due(&h.store.tracked_items().await.unwrap(), now_ns(), options().stale_after).is_empty());

    h.source.set("Desk Lamp", None, Reply::Price(80.0));
    let report = h.reconciler.check_item(&it.id).await.unwrap();

    assert_eq!((report.total, report.successful, report.alerts_sent), (1, 1, 1));
    let stored = h.store.get_item(&it.id).await.unwrap().unwrap();
    assert_eq!((stored.lowest_price, stored.current_price, stored.highest_price), (Some(80.0), Some(80.0), Some(120.0)));
    let history: Vec<f64> = h.store.price_history(&it.id, 10).await.unwrap().iter().map(|e| e.price).collect();
    assert_eq!(history, vec![80.0, 120.0]);
    // Not a run: the last run report is left alone.
    assert_eq!(h.reconciler.health().runs_completed(), 0);
    assert!(!h.reconciler.health().is_running());
}

#[tokio::test]
async fn on_demand_check_reports_fetch_failure_and_missing_items() {
    let h = harness(options());
    let it = add(&h.store, "Desk Lamp", 100.0).await;
    h.source.set("Desk Lamp", None, Reply::Fail);

    let report = h.reconciler.check_item(&it.id).await.unwrap();
    assert_eq!((report.successful, report.failed), (0, 1));
    assert!(h.store.get_item(&it.id).await.unwrap().unwrap().last_checked_at.is_some());

    assert!(matches!(h.reconciler.check_item("missing").await, Err(AppError::NotFound(_))));

    let unlinked = TrackedItem { url: None, ..item("No Link", 10.0) };
    h.store.upsert_item(&unlinked).await.unwrap();
    let report = h.reconciler.check_item(&unlinked.id).await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(report.errors[0].contains("no usable product URL"));
}

#[tokio::test]
async fn on_demand_check_waits_for_no_run() {
    let h = harness(options());
    let it = add(&h.store, "Desk Lamp", 100.0).await;
    h.source.set("Desk Lamp", None, Reply::Price(90.0));

    assert!(h.reconciler.health().try_start());
    assert!(matches!(h.reconciler.check_item(&it.id).await, Err(AppError::RunInProgress)));
    h.reconciler.health().finish(None);

    assert_eq!(h.reconciler.check_item(&it.id).await.unwrap().successful, 1);
}

// ---------------------------------------------------------------------------
// primary marketplace
// ---------------------------------------------------------------------------

#[tokio::test]
async fn owner_primary_holds_until_the_next_check() {
    let h = harness(options());
    let it = add(&h.store, "Desk Lamp", 10.0).await;
    h.store.put_listing(&listing(&it.id, Marketplace::Target, Some(60.0), 1)).await.unwrap();
    h.store.put_listing(&listing(&it.id, Marketplace::Walmart, Some(40.0), 1)).await.unwrap();
    h.store.set_primary(&it.id, Some(Marketplace::Target)).await.unwrap();
    assert_eq!(h.store.get_item(&it.id).await.unwrap().unwrap().primary_marketplace, Some(Marketplace::Target));

    h.source.set("Desk Lamp", Some(Marketplace::Target), Reply::Price(60.0));
    h.source.set("Desk Lamp", Some(Marketplace::Walmart), Reply::Price(40.0));
    h.reconciler.run_batch(vec![it.clone()]).await;

    let stored = h.store.get_item(&it.id).await.unwrap().unwrap();
    assert_eq!(stored.primary_marketplace, Some(Marketplace::Walmart));
    assert_eq!(stored.current_price, Some(40.0));
}
