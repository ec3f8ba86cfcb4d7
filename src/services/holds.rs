use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::bus::EventBus;
use crate::db::{queries, Db};
use crate::models::event::{SlotHeld, SlotReleased};
use crate::models::{subjects, Envelope, Hold, HoldStatus};

pub const HOLD_TTL_MINUTES: i64 = 15;

#[derive(Debug, thiserror::Error)]
pub enum HoldError {
    #[error("Slot already held")]
    SlotHeld,

    #[error("Slot already booked")]
    SlotBooked,

    #[error("a previous hold for this key is no longer active")]
    PreviousHoldDead,

    #[error("meeting type not found")]
    MeetingTypeNotFound,

    #[error("hold not found")]
    HoldNotFound,

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

/// Per-slot mutex registry. Two concurrent attempts at the identical
/// `(meeting_type, slot_start)` are linearized here before either
/// touches the database.
#[derive(Default)]
pub struct SlotLocks {
    inner: std::sync::Mutex<HashMap<(String, i64), Arc<AsyncMutex<()>>>>,
}

impl SlotLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(
        &self,
        meeting_type_id: &str,
        slot_start: DateTime<Utc>,
    ) -> OwnedMutexGuard<()> {
        let cell = {
            let mut map = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.entry((meeting_type_id.to_string(), slot_start.timestamp()))
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        cell.lock_owned().await
    }

    /// Drops entries nobody is holding or waiting on.
    pub fn prune(&self) {
        let mut map = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.retain(|_, cell| Arc::strong_count(cell) > 1);
    }
}

pub struct CreateHoldRequest {
    pub meeting_type_id: String,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub guest_email: String,
    pub guest_name: Option<String>,
    pub idempotency_key: String,
}

/// Creates a hold with mutual exclusion. Exactly one of two racing
/// requests for the same slot wins; an idempotent replay returns the
/// prior hold without a second row or a second event.
pub async fn create_hold(
    db: &Db,
    bus: &EventBus,
    locks: &SlotLocks,
    req: CreateHoldRequest,
    now: DateTime<Utc>,
) -> Result<Hold, HoldError> {
    let _slot_guard = locks.acquire(&req.meeting_type_id, req.slot_start).await;

    let (hold, event) = {
        let mut conn = lock_db(db);
        let tx = conn.transaction().map_err(anyhow::Error::from)?;

        // Idempotency short-circuit: a key is spent by its first hold
        if let Some(existing) = queries::get_hold_by_key(&tx, &req.idempotency_key)? {
            return if existing.status == HoldStatus::Active && !existing.is_expired(now) {
                Ok(existing)
            } else {
                Err(HoldError::PreviousHoldDead)
            };
        }

        let meeting_type = queries::get_meeting_type(&tx, &req.meeting_type_id)?
            .filter(|mt| mt.active)
            .ok_or(HoldError::MeetingTypeNotFound)?;

        if req.slot_end - req.slot_start != Duration::minutes(meeting_type.duration_minutes) {
            return Err(HoldError::Invalid(
                "slot length does not match the meeting type duration".to_string(),
            ));
        }

        // Conflicts compare bare [start, end) intervals; buffers were
        // already enforced when the slot was offered
        if queries::find_overlapping_hold(&tx, &meeting_type.id, req.slot_start, req.slot_end)?
            .is_some()
        {
            return Err(HoldError::SlotHeld);
        }
        if queries::find_overlapping_booking(&tx, &meeting_type.id, req.slot_start, req.slot_end)?
            .is_some()
        {
            return Err(HoldError::SlotBooked);
        }

        let hold = Hold {
            id: uuid::Uuid::new_v4().to_string(),
            meeting_type_id: meeting_type.id.clone(),
            slot_start: req.slot_start,
            slot_end: req.slot_end,
            guest_email: req.guest_email,
            guest_name: req.guest_name,
            status: HoldStatus::Active,
            expires_at: now + Duration::minutes(HOLD_TTL_MINUTES),
            idempotency_key: req.idempotency_key,
            created_at: now,
        };
        queries::insert_hold(&tx, &hold)?;
        tx.commit().map_err(anyhow::Error::from)?;

        let event = Envelope::new(
            subjects::SLOT_HELD,
            &SlotHeld {
                meeting_type_id: hold.meeting_type_id.clone(),
                hold_id: hold.id.clone(),
                slot_start: hold.slot_start,
                slot_end: hold.slot_end,
                guest_email: hold.guest_email.clone(),
                guest_name: hold.guest_name.clone(),
                expires_at: hold.expires_at,
            },
        )?;
        (hold, event)
    };

    // Emission strictly after commit, with the database lock released
    bus.publish_all(&[event]);
    Ok(hold)
}

pub fn get_hold(db: &Db, hold_id: &str) -> Result<Hold, HoldError> {
    let conn = lock_db(db);
    queries::get_hold(&conn, hold_id)?.ok_or(HoldError::HoldNotFound)
}

/// Guest-initiated release of an active hold.
pub fn release_hold(db: &Db, bus: &EventBus, hold_id: &str) -> Result<Hold, HoldError> {
    let (hold, event) = {
        let conn = lock_db(db);
        let hold = queries::get_hold(&conn, hold_id)?.ok_or(HoldError::HoldNotFound)?;
        if !queries::transition_hold(&conn, hold_id, HoldStatus::Released)? {
            return Err(HoldError::Invalid("hold is no longer active".to_string()));
        }
        let event = release_event(&hold, "canceled")?;
        (hold, event)
    };

    bus.publish_all(&[event]);
    Ok(Hold {
        status: HoldStatus::Released,
        ..hold
    })
}

/// Expires every overdue active hold. Safe to run concurrently: the
/// compare-and-set update returns only the rows this sweep
/// transitioned, so each hold is announced exactly once.
pub fn expire_overdue(db: &Db, bus: &EventBus, now: DateTime<Utc>) -> anyhow::Result<usize> {
    let events: Vec<Envelope> = {
        let conn = lock_db(db);
        let expired = queries::expire_overdue_holds(&conn, now)?;
        expired
            .iter()
            .map(|hold| release_event(hold, "expired"))
            .collect::<anyhow::Result<_>>()?
    };

    let count = events.len();
    if count > 0 {
        tracing::info!(count, "expired overdue holds");
    }
    bus.publish_all(&events);
    Ok(count)
}

pub(crate) fn release_event(hold: &Hold, reason: &str) -> anyhow::Result<Envelope> {
    Envelope::new(
        subjects::SLOT_RELEASED,
        &SlotReleased {
            meeting_type_id: hold.meeting_type_id.clone(),
            hold_id: hold.id.clone(),
            slot_start: hold.slot_start,
            slot_end: hold.slot_end,
            reason: reason.to_string(),
        },
    )
}

/// Serializes access to the shared connection. Callers must not hold
/// the guard across an await point.
pub fn lock_db(db: &Db) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
    match db.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
