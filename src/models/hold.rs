use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A short-lived exclusive reservation of a slot by a prospective guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hold {
    pub id: String,
    pub meeting_type_id: String,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub guest_email: String,
    pub guest_name: Option<String>,
    pub status: HoldStatus,
    pub expires_at: DateTime<Utc>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

impl Hold {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HoldStatus {
    Active,
    Converted,
    Expired,
    Released,
}

impl HoldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Active => "active",
            HoldStatus::Converted => "converted",
            HoldStatus::Expired => "expired",
            HoldStatus::Released => "released",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "converted" => HoldStatus::Converted,
            "expired" => HoldStatus::Expired,
            "released" => HoldStatus::Released,
            _ => HoldStatus::Active,
        }
    }
}
