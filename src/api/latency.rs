//! Price fetch latency, overall and per source.
//! A sample is the wall time of one fetch including its retries.

use std::time::Duration;

use dashmap::DashMap;
use hdrhistogram::Histogram;
use serde::Serialize;

/// 1us to 10 minutes.
const HIGHEST_TRACKABLE_US: u64 = 600_000_000;
const SIGFIG: u8 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub max_ms: Option<f64>,
}

impl LatencySummary {
    fn of(h: &Histogram<u64>) -> Self {
        if h.is_empty() {
            return Self::default();
        }
        let ms = |us: u64| Some(us as f64 / 1_000.0);
        Self {
            samples: h.len(),
            p50_ms: ms(h.value_at_quantile(0.5)),
            p95_ms: ms(h.value_at_quantile(0.95)),
            p99_ms: ms(h.value_at_quantile(0.99)),
            max_ms: ms(h.max()),
        }
    }
}

/// Written by the reconciler's workers, read by `/stats/latency`.
pub struct FetchLatency {
    by_source: DashMap<String, Histogram<u64>>,
}

impl FetchLatency {
    pub fn new() -> Self {
        Self { by_source: DashMap::new() }
    }

    pub fn record(&self, source: &str, elapsed: Duration) {
        let us = elapsed.as_micros().clamp(1, u128::from(HIGHEST_TRACKABLE_US)) as u64;
        if let Some(mut h) = self.by_source.get_mut(source) {
            h.saturating_record(us);
            return;
        }
        // Bounds are constant; construction only fails on invalid bounds.
        if let Ok(mut h) = Histogram::new_with_bounds(1, HIGHEST_TRACKABLE_US, SIGFIG) {
            h.saturating_record(us);
            self.by_source
                .entry(source.to_string())
                .and_modify(|existing| existing.saturating_record(us))
                .or_insert(h);
        }
    }

    #[cfg(test)]
    pub fn source(&self, source: &str) -> LatencySummary {
        self.by_source.get(source).map(|h| LatencySummary::of(&h)).unwrap_or_default()
    }

    /// All sources merged.
    pub fn overall(&self) -> LatencySummary {
        let Ok(mut merged) = Histogram::<u64>::new_with_bounds(1, HIGHEST_TRACKABLE_US, SIGFIG) else {
            return LatencySummary::default();
        };
        for h in self.by_source.iter() {
            // Identical bounds, so adding cannot overflow the range.
            let _ = merged.add(h.value());
        }
        LatencySummary::of(&merged)
    }

    /// Per-source summaries sorted by source name.
    pub fn sources(&self) -> Vec<(String, LatencySummary)> {
        let mut out: Vec<_> = self
            .by_source
            .iter()
            .map(|entry| (entry.key().clone(), LatencySummary::of(entry.value())))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl Default for FetchLatency {
    fn default() -> Self {
        Self::new()
    }
}
