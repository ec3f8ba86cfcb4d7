use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::db::queries;
use crate::errors::AppError;
use crate::models::{Booking, MeetingType};
use crate::services::availability;
use crate::services::bookings::{self, ConfirmError, ConfirmRequest};
use crate::services::holds::{self, CreateHoldRequest, HoldError};
use crate::state::AppState;

const HOLD_LIMIT_PER_MINUTE: u32 = 5;
const PUBLIC_LIMIT_PER_MINUTE: u32 = 100;
const MAX_WINDOW_DAYS: i64 = 60;

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn enforce_limit(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
    max_per_minute: u32,
) -> Result<(), AppError> {
    state
        .rate_limiter
        .check(&client_ip(headers), path, max_per_minute, Utc::now())
        .map_err(AppError::RateLimited)
}

fn resolve_meeting_type(state: &AppState, slug: &str) -> Result<MeetingType, AppError> {
    let conn = holds::lock_db(&state.db);
    queries::get_meeting_type_by_slug(&conn, slug)?
        .filter(|mt| mt.active)
        .ok_or_else(|| AppError::NotFound(format!("no bookable page at /book/{slug}")))
}

fn parse_instant(value: &str, field: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| AppError::Validation(format!("{field} must be an RFC 3339 timestamp")))
}

fn parse_key(value: &str) -> Result<String, AppError> {
    uuid::Uuid::parse_str(value)
        .map(|u| u.to_string())
        .map_err(|_| AppError::Validation("idempotencyKey must be a UUID".to_string()))
}

// GET /book/:slug
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingTypeResponse {
    id: String,
    slug: String,
    name: String,
    description: Option<String>,
    duration_minutes: i64,
    location: Option<String>,
    requires_nda: bool,
    host_name: String,
    host_timezone: String,
}

pub async fn get_meeting_type(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(slug): Path<String>,
) -> Result<Json<MeetingTypeResponse>, AppError> {
    enforce_limit(&state, &headers, &format!("/book/{slug}"), PUBLIC_LIMIT_PER_MINUTE)?;

    let mt = resolve_meeting_type(&state, &slug)?;
    let host = {
        let conn = holds::lock_db(&state.db);
        queries::get_host(&conn, &mt.host_id)?
            .ok_or_else(|| AppError::NotFound("host not found".to_string()))?
    };

    Ok(Json(MeetingTypeResponse {
        id: mt.id,
        slug: mt.slug,
        name: mt.name,
        description: mt.description,
        duration_minutes: mt.duration_minutes,
        location: mt.location,
        requires_nda: mt.requires_nda,
        host_name: host.name,
        host_timezone: host.timezone,
    }))
}

// GET /book/:slug/slots?startDate&endDate&timezone
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotsQuery {
    pub start_date: String,
    pub end_date: String,
    pub timezone: Option<String>,
}

#[derive(Serialize)]
pub struct SlotResponse {
    start: String,
    end: String,
    available: bool,
}

pub async fn get_slots(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(slug): Path<String>,
    Query(query): Query<SlotsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    enforce_limit(&state, &headers, &format!("/book/{slug}/slots"), PUBLIC_LIMIT_PER_MINUTE)?;

    let start_date = NaiveDate::parse_from_str(&query.start_date, "%Y-%m-%d")
        .map_err(|_| AppError::Validation("startDate must be YYYY-MM-DD".to_string()))?;
    let end_date = NaiveDate::parse_from_str(&query.end_date, "%Y-%m-%d")
        .map_err(|_| AppError::Validation("endDate must be YYYY-MM-DD".to_string()))?;
    if end_date < start_date {
        return Err(AppError::Validation(
            "endDate must not be before startDate".to_string(),
        ));
    }
    if (end_date - start_date).num_days() > MAX_WINDOW_DAYS {
        return Err(AppError::Validation(format!(
            "date window is limited to {MAX_WINDOW_DAYS} days"
        )));
    }

    let guest_tz: Tz = query
        .timezone
        .as_deref()
        .unwrap_or("UTC")
        .parse()
        .map_err(|_| AppError::Validation("timezone must be an IANA zone identifier".to_string()))?;

    let mt = resolve_meeting_type(&state, &slug)?;
    let slots = {
        let conn = holds::lock_db(&state.db);
        let host = queries::get_host(&conn, &mt.host_id)?
            .ok_or_else(|| AppError::NotFound("host not found".to_string()))?;
        availability::compute_slots(&conn, &mt, &host, start_date, end_date, Utc::now())?
    };

    // Guest-zone conversion is presentation only; availability was
    // decided on the absolute timeline
    let slots: Vec<SlotResponse> = slots
        .into_iter()
        .map(|s| SlotResponse {
            start: s.start.with_timezone(&guest_tz).to_rfc3339(),
            end: s.end.with_timezone(&guest_tz).to_rfc3339(),
            available: s.available,
        })
        .collect();

    Ok(Json(serde_json::json!({ "slots": slots })))
}

// POST /book/:slug/hold
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldBody {
    pub slot_start: String,
    pub slot_end: String,
    pub email: String,
    pub name: Option<String>,
    pub idempotency_key: String,
}

pub async fn create_hold(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(slug): Path<String>,
    Json(body): Json<HoldBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    enforce_limit(&state, &headers, &format!("/book/{slug}/hold"), HOLD_LIMIT_PER_MINUTE)?;

    let slot_start = parse_instant(&body.slot_start, "slotStart")?;
    let slot_end = parse_instant(&body.slot_end, "slotEnd")?;
    let email = body.email.trim().to_string();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::Validation("email is required".to_string()));
    }
    let idempotency_key = parse_key(&body.idempotency_key)?;

    let mt = resolve_meeting_type(&state, &slug)?;
    let hold = holds::create_hold(
        &state.db,
        &state.bus,
        &state.slot_locks,
        CreateHoldRequest {
            meeting_type_id: mt.id.clone(),
            slot_start,
            slot_end,
            guest_email: email,
            guest_name: body.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            idempotency_key,
        },
        Utc::now(),
    )
    .await
    .map_err(map_hold_error)?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "holdId": hold.id,
            "expiresAt": hold.expires_at.to_rfc3339(),
            "ndaRequired": mt.requires_nda,
        })),
    ))
}

// GET /book/:slug/hold/:id
pub async fn get_hold(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((slug, hold_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    enforce_limit(&state, &headers, &format!("/book/{slug}/hold/get"), PUBLIC_LIMIT_PER_MINUTE)?;

    let mt = resolve_meeting_type(&state, &slug)?;
    let hold = holds::get_hold(&state.db, &hold_id).map_err(map_hold_error)?;
    if hold.meeting_type_id != mt.id {
        return Err(AppError::NotFound("hold not found".to_string()));
    }

    Ok(Json(serde_json::json!({
        "holdId": hold.id,
        "status": hold.status,
        "slotStart": hold.slot_start.to_rfc3339(),
        "slotEnd": hold.slot_end.to_rfc3339(),
        "expiresAt": hold.expires_at.to_rfc3339(),
    })))
}

// DELETE /book/:slug/hold/:id
pub async fn release_hold(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((slug, hold_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    enforce_limit(&state, &headers, &format!("/book/{slug}/hold/release"), PUBLIC_LIMIT_PER_MINUTE)?;

    let mt = resolve_meeting_type(&state, &slug)?;
    let hold = holds::get_hold(&state.db, &hold_id).map_err(map_hold_error)?;
    if hold.meeting_type_id != mt.id {
        return Err(AppError::NotFound("hold not found".to_string()));
    }

    let released = holds::release_hold(&state.db, &state.bus, &hold_id).map_err(map_hold_error)?;
    Ok(Json(serde_json::json!({
        "holdId": released.id,
        "status": released.status,
    })))
}

// POST /book/:slug/confirm
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmBody {
    pub hold_id: String,
    pub guest_name: String,
    pub guest_timezone: String,
    pub guest_notes: Option<String>,
    pub idempotency_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingResponse {
    id: String,
    meeting_type_id: String,
    slot_start: String,
    slot_end: String,
    guest_email: String,
    guest_name: String,
    guest_timezone: String,
    guest_notes: Option<String>,
    status: String,
}

impl From<Booking> for BookingResponse {
    fn from(b: Booking) -> Self {
        Self {
            id: b.id,
            meeting_type_id: b.meeting_type_id,
            slot_start: b.slot_start.to_rfc3339(),
            slot_end: b.slot_end.to_rfc3339(),
            guest_email: b.guest_email,
            guest_name: b.guest_name,
            guest_timezone: b.guest_timezone,
            guest_notes: b.guest_notes,
            status: b.status.as_str().to_string(),
        }
    }
}

pub async fn confirm_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(slug): Path<String>,
    Json(body): Json<ConfirmBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    enforce_limit(&state, &headers, &format!("/book/{slug}/confirm"), PUBLIC_LIMIT_PER_MINUTE)?;

    let guest_name = body.guest_name.trim().to_string();
    if guest_name.is_empty() {
        return Err(AppError::Validation("guestName is required".to_string()));
    }
    body.guest_timezone
        .parse::<Tz>()
        .map_err(|_| AppError::Validation("guestTimezone must be an IANA zone identifier".to_string()))?;
    let idempotency_key = parse_key(&body.idempotency_key)?;

    let mt = resolve_meeting_type(&state, &slug)?;
    let hold = holds::get_hold(&state.db, &body.hold_id).map_err(map_hold_error)?;
    if hold.meeting_type_id != mt.id {
        return Err(AppError::NotFound("hold not found".to_string()));
    }

    let booking = bookings::confirm_booking(
        &state.db,
        &state.bus,
        ConfirmRequest {
            hold_id: body.hold_id,
            guest_name,
            guest_timezone: body.guest_timezone,
            guest_notes: body.guest_notes,
            idempotency_key,
        },
        Utc::now(),
    )
    .map_err(map_confirm_error)?;

    Ok(Json(
        serde_json::json!({ "booking": BookingResponse::from(booking) }),
    ))
}

fn map_hold_error(err: HoldError) -> AppError {
    match err {
        HoldError::SlotHeld => AppError::SlotUnavailable("Slot already held".to_string()),
        HoldError::SlotBooked => AppError::SlotUnavailable("Slot already booked".to_string()),
        HoldError::PreviousHoldDead => {
            AppError::SlotUnavailable("Hold has expired".to_string())
        }
        HoldError::MeetingTypeNotFound => AppError::NotFound("meeting type not found".to_string()),
        HoldError::HoldNotFound => AppError::NotFound("hold not found".to_string()),
        HoldError::Invalid(msg) => AppError::Validation(msg),
        HoldError::Db(e) => AppError::Transient(e),
    }
}

fn map_confirm_error(err: ConfirmError) -> AppError {
    match err {
        ConfirmError::HoldNotFound => AppError::NotFound("hold not found".to_string()),
        ConfirmError::HoldExpired => AppError::HoldExpired,
        ConfirmError::HoldNotActive => {
            AppError::Validation("Hold is no longer active".to_string())
        }
        ConfirmError::NdaRequired => AppError::NdaRequired,
        // Conflicts surface as 400 at confirm time, unlike the 409 on
        // hold creation
        ConfirmError::SlotUnavailable => {
            AppError::Validation("Slot already booked".to_string())
        }
        ConfirmError::Db(e) => AppError::Transient(e),
    }
}
