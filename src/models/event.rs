use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Subjects carried on the event bus.
pub mod subjects {
    pub const SLOT_HELD: &str = "slot.held";
    pub const SLOT_RELEASED: &str = "slot.released";
    pub const BOOKING_CONFIRMED: &str = "booking.confirmed";
    pub const BOOKING_CANCELED: &str = "booking.canceled";
    pub const NDA_CREATED: &str = "nda.created";
    pub const NDA_SENT: &str = "nda.sent";
    pub const NDA_SIGNED: &str = "nda.signed";
    pub const NDA_EXPIRED: &str = "nda.expired";
    pub const EMAIL_REQUESTED: &str = "notify.email.requested";
    pub const EMAIL_SENT: &str = "notify.email.sent";
    pub const DLQ_PREFIX: &str = "dlq.";
}

/// The durable streams events are partitioned into, with retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Bookings,
    Documents,
    Notifications,
    DeadLetter,
}

impl Stream {
    pub fn for_subject(subject: &str) -> Stream {
        if subject.starts_with(subjects::DLQ_PREFIX) {
            Stream::DeadLetter
        } else if subject.starts_with("nda.") {
            Stream::Documents
        } else if subject.starts_with("notify.") {
            Stream::Notifications
        } else {
            Stream::Bookings
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Bookings => "BOOKINGS",
            Stream::Documents => "DOCUMENTS",
            Stream::Notifications => "NOTIFICATIONS",
            Stream::DeadLetter => "DEAD_LETTER",
        }
    }

    pub fn retention_hours(&self) -> i64 {
        match self {
            Stream::Bookings => 24 * 7,
            Stream::Documents => 24 * 30,
            Stream::Notifications => 24,
            Stream::DeadLetter => 24 * 90,
        }
    }
}

/// Envelope every bus event travels in. `event_id` doubles as the
/// publisher-side deduplication key; handlers must stay idempotent
/// because delivery is at-least-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(event_type: &str, data: &T) -> anyhow::Result<Self> {
        Ok(Envelope {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            occurred_at: Utc::now(),
            data: serde_json::to_value(data)?,
        })
    }

    pub fn payload<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn meeting_type_id(&self) -> Option<&str> {
        self.data.get("meeting_type_id").and_then(|v| v.as_str())
    }
}

// ── Event payloads ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotHeld {
    pub meeting_type_id: String,
    pub hold_id: String,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub guest_email: String,
    pub guest_name: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotReleased {
    pub meeting_type_id: String,
    pub hold_id: String,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    /// One of "expired", "canceled", "converted".
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingConfirmed {
    pub meeting_type_id: String,
    pub booking_id: String,
    pub hold_id: String,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub guest_email: String,
    pub guest_name: String,
    pub guest_timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingCanceled {
    pub meeting_type_id: String,
    pub booking_id: String,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdaCreated {
    pub meeting_type_id: String,
    pub document_id: String,
    pub hold_id: String,
    pub envelope_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdaSent {
    pub document_id: String,
    pub hold_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdaSigned {
    pub document_id: String,
    pub hold_id: String,
    pub signed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdaExpired {
    pub document_id: String,
    pub hold_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRequested {
    pub booking_id: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSent {
    pub booking_id: String,
    pub to: String,
}

/// Payload published on `dlq.<subject>` when a message exhausts its
/// retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original_subject: String,
    pub original_event: Envelope,
    pub last_error: String,
    pub attempts: i64,
}
