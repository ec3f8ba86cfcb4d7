use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bookable meeting kind published at /book/{slug}.
///
/// Duration and buffers are treated as immutable once live holds
/// reference the type; changing them would silently invalidate
/// outstanding reservations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingType {
    pub id: String,
    pub host_id: String,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub duration_minutes: i64,
    pub buffer_before_minutes: i64,
    pub buffer_after_minutes: i64,
    pub location: Option<String>,
    pub requires_nda: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}
