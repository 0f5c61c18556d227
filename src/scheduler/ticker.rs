use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::scheduler::Reconciler;

/// Background task that triggers a reconciliation run every `period`.
/// Shares the run slot with the HTTP trigger, so a tick that lands on a
/// running batch is skipped.
pub struct ReconcileTicker {
    reconciler: Arc<Reconciler>,
    period: Duration,
}

impl ReconcileTicker {
    pub fn new(reconciler: Arc<Reconciler>, period: Duration) -> Self {
        Self { reconciler, period }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // consume immediate first tick

        info!("Periodic reconciliation every {}s", self.period.as_secs());
        loop {
            ticker.tick().await;
            match self.reconciler.run_reconciliation().await {
                Ok(report) if report.success => {}
                Ok(report) => error!(
                    "Scheduled run failed: {}",
                    report.run_error.as_deref().unwrap_or("unknown error")
                ),
                Err(AppError::RunInProgress) => warn!("Scheduled run skipped: previous run still in progress"),
                Err(e) => error!("Scheduled run error: {e}"),
            }
        }
    }
}
