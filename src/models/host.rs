use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Owner of meeting types, availability rules and blackout dates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub email: String,
    /// IANA zone identifier, e.g. "America/New_York".
    pub timezone: String,
    pub created_at: DateTime<Utc>,
}
