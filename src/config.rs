use std::time::Duration;

use crate::error::{AppError, Result};

/// Confidence at or above which a candidate is accepted without review.
pub const AUTO_ACCEPT_CONFIDENCE: f64 = 0.85;

/// Confidence at or above which a candidate is held for human review.
/// Anything below is rejected outright.
pub const REVIEW_CONFIDENCE: f64 = 0.70;

/// Confidence returned when the comparator cannot produce a decision.
pub const UNAVAILABLE_CONFIDENCE: f64 = 0.5;

/// Cross-marketplace price divergence (relative to the reference price) that
/// is treated as normal and does not lower the price sub-score.
pub const PRICE_TOLERANCE: f64 = 0.30;

/// Default history page size handed out by the API.
pub const DEFAULT_HISTORY_LIMIT: usize = 30;

/// Per-run defaults.
pub const DEFAULT_STALE_AFTER_HOURS: u64 = 24;
pub const DEFAULT_MAX_ITEMS_PER_RUN: usize = 100;
pub const DEFAULT_INTER_REQUEST_DELAY_MS: u64 = 2_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 2_000;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Source tag recorded for direct (non-marketplace) observations when the
/// source does not report one.
pub const DIRECT_SOURCE_TAG: &str = "direct";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub store_backend: StoreBackend,
    pub api_port: u16,
    /// Price extraction service (PRICE_SOURCE_URL).
    pub price_source_url: Option<String>,
    /// Model-backed comparator endpoint (MATCHER_URL). Rule-based matching when unset.
    pub matcher_url: Option<String>,
    pub matcher_api_key: Option<String>,
    /// Notification webhook (NOTIFY_WEBHOOK_URL). Alerts are only logged when unset.
    pub notify_webhook_url: Option<String>,
    /// Self-trigger period in seconds; 0 leaves triggering to the external scheduler.
    pub reconcile_interval_secs: u64,
    pub stale_after: Duration,
    pub max_items_per_run: usize,
    pub inter_request_delay: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub fetch_timeout: Duration,
    pub max_concurrency: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let store_backend = match std::env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "sqlite".to_string())
            .to_lowercase()
            .as_str()
        {
            "sqlite" => StoreBackend::Sqlite,
            "memory" => StoreBackend::Memory,
            other => {
                return Err(AppError::Config(format!(
                    "STORE_BACKEND must be 'sqlite' or 'memory', got '{other}'"
                )))
            }
        };

        let max_concurrency = at_least_one("MAX_CONCURRENCY", parse_or("MAX_CONCURRENCY", 1usize)?)?;
        let max_items_per_run =
            at_least_one("MAX_ITEMS_PER_RUN", parse_or("MAX_ITEMS_PER_RUN", DEFAULT_MAX_ITEMS_PER_RUN)?)?;
        let stale_after = hours(parse_or("STALE_AFTER_HOURS", DEFAULT_STALE_AFTER_HOURS)?)?;

        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "reconciler.db".to_string()),
            store_backend,
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            price_source_url: optional("PRICE_SOURCE_URL"),
            matcher_url: optional("MATCHER_URL"),
            matcher_api_key: optional("MATCHER_API_KEY"),
            notify_webhook_url: optional("NOTIFY_WEBHOOK_URL"),
            reconcile_interval_secs: parse_or("RECONCILE_INTERVAL_SECS", 0u64)?,
            stale_after,
            max_items_per_run,
            inter_request_delay: Duration::from_millis(parse_or(
                "INTER_REQUEST_DELAY_MS",
                DEFAULT_INTER_REQUEST_DELAY_MS,
            )?),
            max_retries: parse_or("MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            retry_base_delay: Duration::from_millis(parse_or(
                "RETRY_BASE_DELAY_MS",
                DEFAULT_RETRY_BASE_DELAY_MS,
            )?),
            fetch_timeout: Duration::from_secs(parse_or(
                "FETCH_TIMEOUT_SECS",
                DEFAULT_FETCH_TIMEOUT_SECS,
            )?),
            max_concurrency,
        })
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match optional(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: '{raw}'"))),
        None => Ok(default),
    }
}

fn at_least_one(key: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(AppError::Config(format!("{key} must be at least 1")));
    }
    Ok(value)
}

fn hours(h: u64) -> Result<Duration> {
    h.checked_mul(3_600)
        .map(Duration::from_secs)
        .ok_or_else(|| AppError::Config(format!("STALE_AFTER_HOURS is too large: {h}")))
}
