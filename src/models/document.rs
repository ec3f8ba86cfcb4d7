use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An NDA signing workflow artifact, driven forward by e-signature webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub hold_id: String,
    pub booking_id: Option<String>,
    pub status: DocumentStatus,
    pub signer_email: String,
    pub signer_name: Option<String>,
    /// Identifier assigned by the external e-signature provider.
    pub envelope_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub signed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Sent,
    Signed,
    Expired,
    Revoked,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Sent => "sent",
            DocumentStatus::Signed => "signed",
            DocumentStatus::Expired => "expired",
            DocumentStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => DocumentStatus::Sent,
            "signed" => DocumentStatus::Signed,
            "expired" => DocumentStatus::Expired,
            "revoked" => DocumentStatus::Revoked,
            _ => DocumentStatus::Pending,
        }
    }
}
