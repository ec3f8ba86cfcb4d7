use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::services::holds;
use crate::state::AppState;

const SWEEP_PERIOD: Duration = Duration::from_secs(20);

/// Periodic sweeper: expires overdue holds, prunes bus retention, and
/// drops stale in-memory bookkeeping. Safe to run in multiple
/// processes; every transition is a compare-and-set.
pub fn spawn(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_PERIOD);
        loop {
            interval.tick().await;
            let now = Utc::now();

            if let Err(e) = holds::expire_overdue(&state.db, &state.bus, now) {
                tracing::error!(error = %e, "hold expiration sweep failed");
            }
            if let Err(e) = state.bus.sweep_retention(now) {
                tracing::error!(error = %e, "bus retention sweep failed");
            }
            state.rate_limiter.prune(now);
            state.slot_locks.prune();
        }
    });
}
