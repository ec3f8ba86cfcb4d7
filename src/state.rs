use std::sync::Arc;

use crate::bus::EventBus;
use crate::config::AppConfig;
use crate::db::Db;
use crate::rate_limit::RateLimiter;
use crate::services::email::EmailProvider;
use crate::services::holds::SlotLocks;
use crate::services::signing::SigningProvider;

/// Process-wide dependencies, built once at startup and handed to every
/// handler and worker.
pub struct AppState {
    pub db: Db,
    pub config: AppConfig,
    pub bus: Arc<EventBus>,
    pub signing: Arc<dyn SigningProvider>,
    pub email: Arc<dyn EmailProvider>,
    pub rate_limiter: RateLimiter,
    pub slot_locks: SlotLocks,
}
