use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Idempotency record for an ingested provider callback, keyed by
/// (provider, webhook_id). A completed record caches the response body
/// so replays return the original answer without side effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedWebhook {
    pub provider: String,
    pub webhook_id: String,
    pub status: WebhookStatus,
    pub response_body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Processing,
    Completed,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Processing => "processing",
            WebhookStatus::Completed => "completed",
            WebhookStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => WebhookStatus::Completed,
            "failed" => WebhookStatus::Failed,
            _ => WebhookStatus::Processing,
        }
    }
}
