mod alert;
mod api;
mod config;
mod consensus;
mod db;
mod error;
mod matching;
mod registry;
mod retry;
mod scheduler;
mod source;
mod state;
mod types;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alert::{LogNotifier, Notifier, WebhookNotifier};
use crate::api::latency::FetchLatency;
use crate::api::routes::{router, ApiState};
use crate::config::{Config, StoreBackend};
use crate::db::SqliteStore;
use crate::error::Result;
use crate::matching::{Comparator, MatchingEngine, RemoteComparator, RuleComparator};
use crate::registry::MarketplaceRegistry;
use crate::retry::RetryPolicy;
use crate::scheduler::{BatchOptions, ReconcileTicker, Reconciler};
use crate::source::{HttpPriceSource, PriceSource, UnconfiguredSource};
use crate::state::{MemoryStore, Store};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Store ---
    let store: Arc<dyn Store> = match cfg.store_backend {
        StoreBackend::Sqlite => Arc::new(SqliteStore::connect(&cfg.db_path).await?),
        StoreBackend::Memory => {
            warn!("STORE_BACKEND=memory: tracked items and history are lost on restart");
            MemoryStore::new()
        }
    };

    // --- Collaborators ---
    let source: Arc<dyn PriceSource> = match &cfg.price_source_url {
        Some(url) => Arc::new(HttpPriceSource::new(url.clone(), cfg.fetch_timeout)?),
        None => {
            warn!("PRICE_SOURCE_URL not set: every fetch will fail until a price source is configured");
            Arc::new(UnconfiguredSource)
        }
    };

    let comparator: Arc<dyn Comparator> = match &cfg.matcher_url {
        Some(url) => {
            if cfg.matcher_api_key.is_none() {
                warn!("MATCHER_URL set without MATCHER_API_KEY: remote matching will degrade to manual review");
            }
            Arc::new(RemoteComparator::new(url.clone(), cfg.matcher_api_key.clone(), cfg.fetch_timeout)?)
        }
        None => Arc::new(RuleComparator::new()),
    };
    let retry = RetryPolicy::new(cfg.max_retries, cfg.retry_base_delay, cfg.fetch_timeout);
    let matcher = Arc::new(MatchingEngine::new(comparator, retry));
    info!("Matching with the {} comparator", matcher.comparator_name());

    let notifier: Arc<dyn Notifier> = match &cfg.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone(), cfg.fetch_timeout)?),
        None => {
            info!("NOTIFY_WEBHOOK_URL not set: price alerts are written to the log");
            Arc::new(LogNotifier)
        }
    };

    // --- Engine ---
    let latency = Arc::new(FetchLatency::new());
    let options = BatchOptions::from_config(&cfg);
    info!(
        "Reconciler ready: max_items={} delay={}ms retries={} concurrency={} stale_after={}h",
        options.max_items,
        options.inter_request_delay.as_millis(),
        cfg.max_retries,
        options.max_concurrency,
        options.stale_after.as_secs() / 3_600,
    );
    let reconciler = Arc::new(
        Reconciler::new(Arc::clone(&store), source, Arc::clone(&matcher), notifier, options)
            .with_latency(Arc::clone(&latency)),
    );
    let registry = Arc::new(MarketplaceRegistry::new(Arc::clone(&store), matcher));

    // Periodic trigger (background, every RECONCILE_INTERVAL_SECS)
    if cfg.reconcile_interval_secs > 0 {
        let ticker = ReconcileTicker::new(
            Arc::clone(&reconciler),
            Duration::from_secs(cfg.reconcile_interval_secs),
        );
        tokio::spawn(async move { ticker.run().await });
    } else {
        info!("RECONCILE_INTERVAL_SECS not set: runs only start from POST /reconcile");
    }

    // HTTP API server
    let api_state = ApiState { store, reconciler, registry, latency };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
