use chrono::{DateTime, Utc};

use crate::bus::EventBus;
use crate::db::{queries, Db};
use crate::models::event::{BookingCanceled, BookingConfirmed};
use crate::models::{
    subjects, Booking, BookingStatus, DocumentStatus, Envelope, Hold, HoldStatus,
};
use crate::services::holds;

#[derive(Debug, thiserror::Error)]
pub enum ConfirmError {
    #[error("hold not found")]
    HoldNotFound,

    #[error("Hold has expired")]
    HoldExpired,

    #[error("hold is no longer active")]
    HoldNotActive,

    #[error("NDA must be signed")]
    NdaRequired,

    #[error("Slot already booked")]
    SlotUnavailable,

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

pub struct ConfirmRequest {
    pub hold_id: String,
    pub guest_name: String,
    pub guest_timezone: String,
    pub guest_notes: Option<String>,
    pub idempotency_key: String,
}

enum Outcome {
    Replayed(Booking),
    Confirmed(Booking, Vec<Envelope>),
    ExpiredHold(Envelope),
}

/// Converts a valid hold into a durable booking. Steps run in one
/// transaction; events are published only after it commits.
pub fn confirm_booking(
    db: &Db,
    bus: &EventBus,
    req: ConfirmRequest,
    now: DateTime<Utc>,
) -> Result<Booking, ConfirmError> {
    let outcome = {
        let mut conn = holds::lock_db(db);
        let tx = conn.transaction().map_err(anyhow::Error::from)?;

        if let Some(existing) = queries::get_booking_by_key(&tx, &req.idempotency_key)? {
            Outcome::Replayed(existing)
        } else {
            let hold = queries::get_hold(&tx, &req.hold_id)?.ok_or(ConfirmError::HoldNotFound)?;
            if hold.status != HoldStatus::Active {
                return Err(ConfirmError::HoldNotActive);
            }
            if hold.is_expired(now) {
                queries::transition_hold(&tx, &hold.id, HoldStatus::Expired)?;
                tx.commit().map_err(anyhow::Error::from)?;
                let event = holds::release_event(&hold, "expired")?;
                Outcome::ExpiredHold(event)
            } else {
                let (booking, events) = confirm_active_hold(&tx, hold, &req, now)?;
                tx.commit().map_err(anyhow::Error::from)?;
                Outcome::Confirmed(booking, events)
            }
        }
    };

    match outcome {
        Outcome::Replayed(booking) => Ok(booking),
        Outcome::Confirmed(booking, events) => {
            bus.publish_all(&events);
            Ok(booking)
        }
        Outcome::ExpiredHold(event) => {
            bus.publish_all(&[event]);
            Err(ConfirmError::HoldExpired)
        }
    }
}

fn confirm_active_hold(
    tx: &rusqlite::Connection,
    hold: Hold,
    req: &ConfirmRequest,
    now: DateTime<Utc>,
) -> Result<(Booking, Vec<Envelope>), ConfirmError> {
    let meeting_type = queries::get_meeting_type(tx, &hold.meeting_type_id)?
        .ok_or(ConfirmError::HoldNotFound)?;

    let document = queries::get_document_by_hold(tx, &hold.id)?;
    if meeting_type.requires_nda
        && document
            .as_ref()
            .map(|d| d.status != DocumentStatus::Signed)
            .unwrap_or(true)
    {
        return Err(ConfirmError::NdaRequired);
    }

    // The overlap re-query is the booking table's exclusion invariant:
    // a concurrent confirm of a different hold over the same window
    // loses here, inside the same transaction as the insert.
    if queries::find_overlapping_booking(tx, &hold.meeting_type_id, hold.slot_start, hold.slot_end)?
        .is_some()
    {
        return Err(ConfirmError::SlotUnavailable);
    }

    let booking = Booking {
        id: uuid::Uuid::new_v4().to_string(),
        meeting_type_id: hold.meeting_type_id.clone(),
        host_id: meeting_type.host_id.clone(),
        hold_id: hold.id.clone(),
        slot_start: hold.slot_start,
        slot_end: hold.slot_end,
        guest_email: hold.guest_email.clone(),
        guest_name: req.guest_name.clone(),
        guest_timezone: req.guest_timezone.clone(),
        guest_notes: req.guest_notes.clone(),
        status: BookingStatus::Confirmed,
        idempotency_key: req.idempotency_key.clone(),
        created_at: now,
        updated_at: now,
    };
    queries::insert_booking(tx, &booking)?;

    // Single-shot conversion; the hold was verified active above
    if !queries::transition_hold(tx, &hold.id, HoldStatus::Converted)? {
        return Err(ConfirmError::Db(anyhow::anyhow!(
            "hold changed state during confirmation"
        )));
    }

    if let Some(ref document) = document {
        queries::link_document_booking(tx, &document.id, &booking.id)?;
    }

    let events = vec![
        Envelope::new(
            subjects::BOOKING_CONFIRMED,
            &BookingConfirmed {
                meeting_type_id: booking.meeting_type_id.clone(),
                booking_id: booking.id.clone(),
                hold_id: booking.hold_id.clone(),
                slot_start: booking.slot_start,
                slot_end: booking.slot_end,
                guest_email: booking.guest_email.clone(),
                guest_name: booking.guest_name.clone(),
                guest_timezone: booking.guest_timezone.clone(),
            },
        )?,
        holds::release_event(&hold, "converted")?,
    ];

    Ok((booking, events))
}

#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    #[error("booking not found")]
    NotFound,

    #[error("booking is not cancelable")]
    NotCancelable,

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

/// Host- or guest-initiated cancellation of a confirmed booking.
pub fn cancel_booking(
    db: &Db,
    bus: &EventBus,
    booking_id: &str,
    now: DateTime<Utc>,
) -> Result<Booking, CancelError> {
    let (booking, event) = {
        let conn = holds::lock_db(db);
        let booking = queries::get_booking(&conn, booking_id)?.ok_or(CancelError::NotFound)?;
        if !queries::transition_booking(&conn, booking_id, BookingStatus::Canceled, now)? {
            return Err(CancelError::NotCancelable);
        }
        let event = Envelope::new(
            subjects::BOOKING_CANCELED,
            &BookingCanceled {
                meeting_type_id: booking.meeting_type_id.clone(),
                booking_id: booking.id.clone(),
                slot_start: booking.slot_start,
                slot_end: booking.slot_end,
            },
        )?;
        (booking, event)
    };

    bus.publish_all(&[event]);
    Ok(Booking {
        status: BookingStatus::Canceled,
        ..booking
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{Document, Host, MeetingType};
    use crate::services::holds::{create_hold, CreateHoldRequest, SlotLocks};
    use chrono::Duration;
    use rusqlite::params;
    use std::sync::Arc;

    fn setup(requires_nda: bool) -> (Db, Arc<EventBus>, SlotLocks) {
        let db = db::open_shared(":memory:").unwrap();
        {
            let conn = holds::lock_db(&db);
            let host = Host {
                id: "host1".to_string(),
                name: "Avery".to_string(),
                email: "avery@example.com".to_string(),
                timezone: "America/New_York".to_string(),
                created_at: Utc::now(),
            };
            queries::insert_host(&conn, &host).unwrap();
            let mt = MeetingType {
                id: "mt1".to_string(),
                host_id: host.id,
                slug: "intro-call".to_string(),
                name: "Intro call".to_string(),
                description: None,
                duration_minutes: 30,
                buffer_before_minutes: 0,
                buffer_after_minutes: 0,
                location: None,
                requires_nda,
                active: true,
                created_at: Utc::now(),
            };
            queries::insert_meeting_type(&conn, &mt).unwrap();
        }
        let bus = Arc::new(EventBus::new(db.clone()));
        (db, bus, SlotLocks::new())
    }

    async fn held(db: &Db, bus: &EventBus, locks: &SlotLocks, key: &str) -> crate::models::Hold {
        let slot = db::parse_ts("2025-04-08 13:00:00");
        create_hold(
            db,
            bus,
            locks,
            CreateHoldRequest {
                meeting_type_id: "mt1".to_string(),
                slot_start: slot,
                slot_end: slot + Duration::minutes(30),
                guest_email: "guest@example.com".to_string(),
                guest_name: None,
                idempotency_key: key.to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap()
    }

    fn confirm_request(hold_id: &str, key: &str) -> ConfirmRequest {
        ConfirmRequest {
            hold_id: hold_id.to_string(),
            guest_name: "Guest".to_string(),
            guest_timezone: "UTC".to_string(),
            guest_notes: None,
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_confirm_converts_hold_and_emits() {
        let (db, bus, locks) = setup(false);
        let hold = held(&db, &bus, &locks, "k1").await;

        let booking =
            confirm_booking(&db, &bus, confirm_request(&hold.id, "b1"), Utc::now()).unwrap();

        assert_eq!(booking.status, BookingStatus::Confirmed);
        assert_eq!(booking.hold_id, hold.id);

        let conn = holds::lock_db(&db);
        let stored = queries::get_hold(&conn, &hold.id).unwrap().unwrap();
        assert_eq!(stored.status, HoldStatus::Converted);
        drop(conn);

        assert_eq!(bus.events_with_subject(subjects::BOOKING_CONFIRMED).len(), 1);
        let released = bus.events_with_subject(subjects::SLOT_RELEASED);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].data["reason"], "converted");
    }

    #[tokio::test]
    async fn test_confirm_is_idempotent() {
        let (db, bus, locks) = setup(false);
        let hold = held(&db, &bus, &locks, "k1").await;

        let first =
            confirm_booking(&db, &bus, confirm_request(&hold.id, "b1"), Utc::now()).unwrap();
        let second =
            confirm_booking(&db, &bus, confirm_request(&hold.id, "b1"), Utc::now()).unwrap();

        assert_eq!(first.id, second.id);
        let conn = holds::lock_db(&db);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM bookings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        drop(conn);
        assert_eq!(bus.events_with_subject(subjects::BOOKING_CONFIRMED).len(), 1);
    }

    #[tokio::test]
    async fn test_confirm_missing_hold() {
        let (db, bus, _) = setup(false);
        let result = confirm_booking(&db, &bus, confirm_request("missing", "b1"), Utc::now());
        assert!(matches!(result, Err(ConfirmError::HoldNotFound)));
    }

    #[tokio::test]
    async fn test_confirm_expired_hold_expires_it() {
        let (db, bus, locks) = setup(false);
        let hold = held(&db, &bus, &locks, "k1").await;
        {
            let conn = holds::lock_db(&db);
            conn.execute(
                "UPDATE holds SET expires_at = ?1 WHERE id = ?2",
                params![db::fmt_ts(Utc::now() - Duration::seconds(1)), hold.id],
            )
            .unwrap();
        }

        let result = confirm_booking(&db, &bus, confirm_request(&hold.id, "b1"), Utc::now());
        assert!(matches!(result, Err(ConfirmError::HoldExpired)));

        let conn = holds::lock_db(&db);
        let stored = queries::get_hold(&conn, &hold.id).unwrap().unwrap();
        assert_eq!(stored.status, HoldStatus::Expired);
        drop(conn);

        let released = bus.events_with_subject(subjects::SLOT_RELEASED);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].data["reason"], "expired");
    }

    #[tokio::test]
    async fn test_confirm_released_hold_is_rejected() {
        let (db, bus, locks) = setup(false);
        let hold = held(&db, &bus, &locks, "k1").await;
        crate::services::holds::release_hold(&db, &bus, &hold.id).unwrap();

        let result = confirm_booking(&db, &bus, confirm_request(&hold.id, "b1"), Utc::now());
        assert!(matches!(result, Err(ConfirmError::HoldNotActive)));
    }

    #[tokio::test]
    async fn test_nda_gating() {
        let (db, bus, locks) = setup(true);
        let hold = held(&db, &bus, &locks, "k1").await;

        // No document yet
        let result = confirm_booking(&db, &bus, confirm_request(&hold.id, "b1"), Utc::now());
        assert!(matches!(result, Err(ConfirmError::NdaRequired)));

        // Pending document is not enough
        let now = Utc::now();
        {
            let conn = holds::lock_db(&db);
            let doc = Document {
                id: "d1".to_string(),
                hold_id: hold.id.clone(),
                booking_id: None,
                status: DocumentStatus::Pending,
                signer_email: hold.guest_email.clone(),
                signer_name: None,
                envelope_id: Some("env_1".to_string()),
                created_at: now,
                sent_at: None,
                signed_at: None,
                updated_at: now,
            };
            queries::insert_document(&conn, &doc).unwrap();
        }
        let result = confirm_booking(&db, &bus, confirm_request(&hold.id, "b2"), Utc::now());
        assert!(matches!(result, Err(ConfirmError::NdaRequired)));

        // Signed document unlocks the confirm and gets linked
        {
            let conn = holds::lock_db(&db);
            use DocumentStatus::*;
            queries::transition_document(&conn, "d1", &[Pending, Sent], Signed, now, None).unwrap();
        }
        let booking =
            confirm_booking(&db, &bus, confirm_request(&hold.id, "b3"), Utc::now()).unwrap();

        let conn = holds::lock_db(&db);
        let doc = queries::get_document_by_hold(&conn, &hold.id).unwrap().unwrap();
        assert_eq!(doc.booking_id.as_deref(), Some(booking.id.as_str()));
    }

    #[tokio::test]
    async fn test_overlapping_confirm_loses() {
        let (db, bus, locks) = setup(false);
        let hold = held(&db, &bus, &locks, "k1").await;
        confirm_booking(&db, &bus, confirm_request(&hold.id, "b1"), Utc::now()).unwrap();

        // Force a second active hold over the same window to simulate
        // a race the hold layer would normally prevent
        let other = crate::models::Hold {
            id: "h2".to_string(),
            idempotency_key: "k2".to_string(),
            status: HoldStatus::Active,
            ..hold.clone()
        };
        {
            let conn = holds::lock_db(&db);
            queries::insert_hold(&conn, &other).unwrap();
        }

        let result = confirm_booking(&db, &bus, confirm_request("h2", "b2"), Utc::now());
        assert!(matches!(result, Err(ConfirmError::SlotUnavailable)));
    }

    #[tokio::test]
    async fn test_cancel_booking_is_monotone() {
        let (db, bus, locks) = setup(false);
        let hold = held(&db, &bus, &locks, "k1").await;
        let booking =
            confirm_booking(&db, &bus, confirm_request(&hold.id, "b1"), Utc::now()).unwrap();

        let canceled = cancel_booking(&db, &bus, &booking.id, Utc::now()).unwrap();
        assert_eq!(canceled.status, BookingStatus::Canceled);
        assert_eq!(bus.events_with_subject(subjects::BOOKING_CANCELED).len(), 1);

        let result = cancel_booking(&db, &bus, &booking.id, Utc::now());
        assert!(matches!(result, Err(CancelError::NotCancelable)));
    }
}
