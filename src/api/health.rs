//! Shared run health for the /health endpoint.
//! Updated by the reconciler, read by the API.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::types::{now_ns, RunReport, TimestampNs};

#[derive(Default)]
pub struct RunHealth {
    /// True while a reconciliation run holds the run slot.
    running: AtomicBool,
    /// Nanosecond timestamp of the last run start (0 = never).
    last_started_at_ns: AtomicI64,
    /// Nanosecond timestamp of the last run finish (0 = never).
    last_finished_at_ns: AtomicI64,
    runs_completed: AtomicU64,
    last_report: Mutex<Option<RunReport>>,
}

impl RunHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the run slot. False if another run already holds it.
    pub fn try_start(&self) -> bool {
        let claimed = self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            self.last_started_at_ns.store(now_ns(), Ordering::Relaxed);
        }
        claimed
    }

    /// Release the run slot, keeping the report when the run produced one.
    pub fn finish(&self, report: Option<&RunReport>) {
        if let Some(report) = report {
            if let Ok(mut last) = self.last_report.lock() {
                *last = Some(report.clone());
            }
            self.runs_completed.fetch_add(1, Ordering::Relaxed);
        }
        self.last_finished_at_ns.store(now_ns(), Ordering::Relaxed);
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_started_at(&self) -> Option<TimestampNs> {
        non_zero(self.last_started_at_ns.load(Ordering::Relaxed))
    }

    pub fn last_finished_at(&self) -> Option<TimestampNs> {
        non_zero(self.last_finished_at_ns.load(Ordering::Relaxed))
    }

    pub fn runs_completed(&self) -> u64 {
        self.runs_completed.load(Ordering::Relaxed)
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.last_report.lock().ok().and_then(|r| r.clone())
    }
}

fn non_zero(ns: i64) -> Option<TimestampNs> {
    (ns != 0).then_some(ns)
}
