use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Fixed-window request counter keyed by (client, path). Purely
/// in-memory: counts reset on process restart and must not be used for
/// hard quotas.
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<(String, String), Window>>,
}

struct Window {
    minute: i64,
    count: u32,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts the request and returns `Err(retry_after_secs)` once the
    /// per-minute budget is exhausted.
    pub fn check(
        &self,
        client: &str,
        path: &str,
        max_per_minute: u32,
        now: DateTime<Utc>,
    ) -> Result<(), u64> {
        let minute = now.timestamp() / 60;
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let window = windows
            .entry((client.to_string(), path.to_string()))
            .or_insert(Window { minute, count: 0 });

        if window.minute != minute {
            window.minute = minute;
            window.count = 0;
        }

        window.count += 1;
        if window.count > max_per_minute {
            Err((60 - now.timestamp().rem_euclid(60)) as u64)
        } else {
            Ok(())
        }
    }

    /// Drops windows that can no longer influence a decision.
    pub fn prune(&self, now: DateTime<Utc>) {
        let minute = now.timestamp() / 60;
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        windows.retain(|_, w| minute - w.minute <= 1);
    }
}
