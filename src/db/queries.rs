use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{fmt_date, fmt_time, fmt_ts, parse_date, parse_time, parse_ts, parse_ts_opt};
use crate::models::{
    AvailabilityRule, BlackoutDate, Booking, BookingStatus, Document, DocumentStatus, Hold,
    HoldStatus, Host, MeetingType, ProcessedWebhook, WebhookStatus,
};

// ── Hosts ──

pub fn insert_host(conn: &Connection, host: &Host) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO hosts (id, name, email, timezone, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            host.id,
            host.name,
            host.email,
            host.timezone,
            fmt_ts(host.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_host(conn: &Connection, id: &str) -> anyhow::Result<Option<Host>> {
    let result = conn.query_row(
        "SELECT id, name, email, timezone, created_at FROM hosts WHERE id = ?1",
        params![id],
        |row| {
            Ok(Host {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                timezone: row.get(3)?,
                created_at: parse_ts(&row.get::<_, String>(4)?),
            })
        },
    );

    match result {
        Ok(host) => Ok(Some(host)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ── Meeting types ──

const MEETING_TYPE_COLS: &str = "id, host_id, slug, name, description, duration_minutes, \
     buffer_before_minutes, buffer_after_minutes, location, requires_nda, active, created_at";

fn parse_meeting_type_row(row: &rusqlite::Row) -> rusqlite::Result<MeetingType> {
    Ok(MeetingType {
        id: row.get(0)?,
        host_id: row.get(1)?,
        slug: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        duration_minutes: row.get(5)?,
        buffer_before_minutes: row.get(6)?,
        buffer_after_minutes: row.get(7)?,
        location: row.get(8)?,
        requires_nda: row.get::<_, i64>(9)? != 0,
        active: row.get::<_, i64>(10)? != 0,
        created_at: parse_ts(&row.get::<_, String>(11)?),
    })
}

pub fn insert_meeting_type(conn: &Connection, mt: &MeetingType) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO meeting_types (id, host_id, slug, name, description, duration_minutes,
             buffer_before_minutes, buffer_after_minutes, location, requires_nda, active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            mt.id,
            mt.host_id,
            mt.slug,
            mt.name,
            mt.description,
            mt.duration_minutes,
            mt.buffer_before_minutes,
            mt.buffer_after_minutes,
            mt.location,
            mt.requires_nda as i64,
            mt.active as i64,
            fmt_ts(mt.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_meeting_type(conn: &Connection, id: &str) -> anyhow::Result<Option<MeetingType>> {
    conn.query_row(
        &format!("SELECT {MEETING_TYPE_COLS} FROM meeting_types WHERE id = ?1"),
        params![id],
        parse_meeting_type_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_meeting_type_by_slug(
    conn: &Connection,
    slug: &str,
) -> anyhow::Result<Option<MeetingType>> {
    conn.query_row(
        &format!("SELECT {MEETING_TYPE_COLS} FROM meeting_types WHERE slug = ?1"),
        params![slug],
        parse_meeting_type_row,
    )
    .optional()
    .map_err(Into::into)
}

// ── Availability rules ──

fn parse_rule_row(row: &rusqlite::Row) -> rusqlite::Result<AvailabilityRule> {
    let start: String = row.get(4)?;
    let end: String = row.get(5)?;
    let from: Option<String> = row.get(6)?;
    let until: Option<String> = row.get(7)?;
    Ok(AvailabilityRule {
        id: row.get(0)?,
        host_id: row.get(1)?,
        meeting_type_id: row.get(2)?,
        day_of_week: row.get::<_, i64>(3)? as u8,
        start_time: parse_time(&start).unwrap_or_default(),
        end_time: parse_time(&end).unwrap_or_default(),
        effective_from: from.as_deref().and_then(parse_date),
        effective_until: until.as_deref().and_then(parse_date),
        active: row.get::<_, i64>(8)? != 0,
    })
}

pub fn insert_rule(conn: &Connection, rule: &AvailabilityRule) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO availability_rules (id, host_id, meeting_type_id, day_of_week,
             start_time, end_time, effective_from, effective_until, active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            rule.id,
            rule.host_id,
            rule.meeting_type_id,
            i64::from(rule.day_of_week),
            fmt_time(rule.start_time),
            fmt_time(rule.end_time),
            rule.effective_from.map(fmt_date),
            rule.effective_until.map(fmt_date),
            rule.active as i64,
        ],
    )?;
    Ok(())
}

/// Active rules for the host that are either unscoped or scoped to the
/// given meeting type, and whose effective window overlaps the date
/// window. `effective_until` is exclusive.
pub fn get_rules_for_window(
    conn: &Connection,
    host_id: &str,
    meeting_type_id: &str,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> anyhow::Result<Vec<AvailabilityRule>> {
    let mut stmt = conn.prepare(
        "SELECT id, host_id, meeting_type_id, day_of_week, start_time, end_time,
                effective_from, effective_until, active
         FROM availability_rules
         WHERE host_id = ?1 AND active = 1
           AND (meeting_type_id IS NULL OR meeting_type_id = ?2)
           AND (effective_from IS NULL OR effective_from <= ?3)
           AND (effective_until IS NULL OR effective_until > ?4)",
    )?;

    let rows = stmt.query_map(
        params![host_id, meeting_type_id, fmt_date(end_date), fmt_date(start_date)],
        parse_rule_row,
    )?;

    let mut rules = vec![];
    for row in rows {
        rules.push(row?);
    }
    Ok(rules)
}

// ── Blackout dates ──

pub fn insert_blackout(conn: &Connection, blackout: &BlackoutDate) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO blackout_dates (id, host_id, date, start_time, end_time, recurring_yearly)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            blackout.id,
            blackout.host_id,
            fmt_date(blackout.date),
            blackout.start_time.map(fmt_time),
            blackout.end_time.map(fmt_time),
            blackout.recurring_yearly as i64,
        ],
    )?;
    Ok(())
}

pub fn get_blackouts(conn: &Connection, host_id: &str) -> anyhow::Result<Vec<BlackoutDate>> {
    let mut stmt = conn.prepare(
        "SELECT id, host_id, date, start_time, end_time, recurring_yearly
         FROM blackout_dates WHERE host_id = ?1",
    )?;

    let rows = stmt.query_map(params![host_id], |row| {
        let date: String = row.get(2)?;
        let start: Option<String> = row.get(3)?;
        let end: Option<String> = row.get(4)?;
        Ok(BlackoutDate {
            id: row.get(0)?,
            host_id: row.get(1)?,
            date: parse_date(&date).unwrap_or_default(),
            start_time: start.as_deref().and_then(parse_time),
            end_time: end.as_deref().and_then(parse_time),
            recurring_yearly: row.get::<_, i64>(5)? != 0,
        })
    })?;

    let mut blackouts = vec![];
    for row in rows {
        blackouts.push(row?);
    }
    Ok(blackouts)
}

// ── Holds ──

const HOLD_COLS: &str = "id, meeting_type_id, slot_start, slot_end, guest_email, guest_name, \
     status, expires_at, idempotency_key, created_at";

fn parse_hold_row(row: &rusqlite::Row) -> rusqlite::Result<Hold> {
    Ok(Hold {
        id: row.get(0)?,
        meeting_type_id: row.get(1)?,
        slot_start: parse_ts(&row.get::<_, String>(2)?),
        slot_end: parse_ts(&row.get::<_, String>(3)?),
        guest_email: row.get(4)?,
        guest_name: row.get(5)?,
        status: HoldStatus::parse(&row.get::<_, String>(6)?),
        expires_at: parse_ts(&row.get::<_, String>(7)?),
        idempotency_key: row.get(8)?,
        created_at: parse_ts(&row.get::<_, String>(9)?),
    })
}

pub fn insert_hold(conn: &Connection, hold: &Hold) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO holds (id, meeting_type_id, slot_start, slot_end, guest_email, guest_name,
             status, expires_at, idempotency_key, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            hold.id,
            hold.meeting_type_id,
            fmt_ts(hold.slot_start),
            fmt_ts(hold.slot_end),
            hold.guest_email,
            hold.guest_name,
            hold.status.as_str(),
            fmt_ts(hold.expires_at),
            hold.idempotency_key,
            fmt_ts(hold.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_hold(conn: &Connection, id: &str) -> anyhow::Result<Option<Hold>> {
    conn.query_row(
        &format!("SELECT {HOLD_COLS} FROM holds WHERE id = ?1"),
        params![id],
        parse_hold_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_hold_by_key(conn: &Connection, idempotency_key: &str) -> anyhow::Result<Option<Hold>> {
    conn.query_row(
        &format!("SELECT {HOLD_COLS} FROM holds WHERE idempotency_key = ?1"),
        params![idempotency_key],
        parse_hold_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Any active hold overlapping [start, end) on the meeting type.
/// Intervals are half-open: touching boundaries do not conflict.
pub fn find_overlapping_hold(
    conn: &Connection,
    meeting_type_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<Option<Hold>> {
    conn.query_row(
        &format!(
            "SELECT {HOLD_COLS} FROM holds
             WHERE meeting_type_id = ?1 AND status = 'active'
               AND slot_start < ?2 AND slot_end > ?3
             LIMIT 1"
        ),
        params![meeting_type_id, fmt_ts(end), fmt_ts(start)],
        parse_hold_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_active_holds_in_range(
    conn: &Connection,
    meeting_type_id: &str,
    lo: DateTime<Utc>,
    hi: DateTime<Utc>,
) -> anyhow::Result<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
    let mut stmt = conn.prepare(
        "SELECT slot_start, slot_end FROM holds
         WHERE meeting_type_id = ?1 AND status = 'active'
           AND slot_start < ?2 AND slot_end > ?3",
    )?;

    let rows = stmt.query_map(params![meeting_type_id, fmt_ts(hi), fmt_ts(lo)], |row| {
        Ok((
            parse_ts(&row.get::<_, String>(0)?),
            parse_ts(&row.get::<_, String>(1)?),
        ))
    })?;

    let mut intervals = vec![];
    for row in rows {
        intervals.push(row?);
    }
    Ok(intervals)
}

/// Compare-and-set transition out of `active`. Returns false when the
/// hold was not active (a concurrent transition won).
pub fn transition_hold(conn: &Connection, id: &str, to: HoldStatus) -> anyhow::Result<bool> {
    let count = conn.execute(
        "UPDATE holds SET status = ?1 WHERE id = ?2 AND status = 'active'",
        params![to.as_str(), id],
    )?;
    Ok(count > 0)
}

/// Expires every overdue active hold, returning only the rows this
/// call actually transitioned so the caller emits exactly one release
/// per hold even with concurrent sweepers.
pub fn expire_overdue_holds(conn: &Connection, now: DateTime<Utc>) -> anyhow::Result<Vec<Hold>> {
    let mut stmt = conn.prepare(&format!(
        "UPDATE holds SET status = 'expired'
         WHERE status = 'active' AND expires_at < ?1
         RETURNING {HOLD_COLS}"
    ))?;

    let rows = stmt.query_map(params![fmt_ts(now)], parse_hold_row)?;

    let mut expired = vec![];
    for row in rows {
        expired.push(row?);
    }
    Ok(expired)
}

// ── Bookings ──

const BOOKING_COLS: &str = "id, meeting_type_id, host_id, hold_id, slot_start, slot_end, \
     guest_email, guest_name, guest_timezone, guest_notes, status, idempotency_key, \
     created_at, updated_at";

fn parse_booking_row(row: &rusqlite::Row) -> rusqlite::Result<Booking> {
    Ok(Booking {
        id: row.get(0)?,
        meeting_type_id: row.get(1)?,
        host_id: row.get(2)?,
        hold_id: row.get(3)?,
        slot_start: parse_ts(&row.get::<_, String>(4)?),
        slot_end: parse_ts(&row.get::<_, String>(5)?),
        guest_email: row.get(6)?,
        guest_name: row.get(7)?,
        guest_timezone: row.get(8)?,
        guest_notes: row.get(9)?,
        status: BookingStatus::parse(&row.get::<_, String>(10)?),
        idempotency_key: row.get(11)?,
        created_at: parse_ts(&row.get::<_, String>(12)?),
        updated_at: parse_ts(&row.get::<_, String>(13)?),
    })
}

pub fn insert_booking(conn: &Connection, booking: &Booking) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO bookings (id, meeting_type_id, host_id, hold_id, slot_start, slot_end,
             guest_email, guest_name, guest_timezone, guest_notes, status, idempotency_key,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            booking.id,
            booking.meeting_type_id,
            booking.host_id,
            booking.hold_id,
            fmt_ts(booking.slot_start),
            fmt_ts(booking.slot_end),
            booking.guest_email,
            booking.guest_name,
            booking.guest_timezone,
            booking.guest_notes,
            booking.status.as_str(),
            booking.idempotency_key,
            fmt_ts(booking.created_at),
            fmt_ts(booking.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_booking(conn: &Connection, id: &str) -> anyhow::Result<Option<Booking>> {
    conn.query_row(
        &format!("SELECT {BOOKING_COLS} FROM bookings WHERE id = ?1"),
        params![id],
        parse_booking_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_booking_by_key(
    conn: &Connection,
    idempotency_key: &str,
) -> anyhow::Result<Option<Booking>> {
    conn.query_row(
        &format!("SELECT {BOOKING_COLS} FROM bookings WHERE idempotency_key = ?1"),
        params![idempotency_key],
        parse_booking_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn find_overlapping_booking(
    conn: &Connection,
    meeting_type_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<Option<Booking>> {
    conn.query_row(
        &format!(
            "SELECT {BOOKING_COLS} FROM bookings
             WHERE meeting_type_id = ?1 AND status = 'confirmed'
               AND slot_start < ?2 AND slot_end > ?3
             LIMIT 1"
        ),
        params![meeting_type_id, fmt_ts(end), fmt_ts(start)],
        parse_booking_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_confirmed_bookings_in_range(
    conn: &Connection,
    meeting_type_id: &str,
    lo: DateTime<Utc>,
    hi: DateTime<Utc>,
) -> anyhow::Result<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
    let mut stmt = conn.prepare(
        "SELECT slot_start, slot_end FROM bookings
         WHERE meeting_type_id = ?1 AND status = 'confirmed'
           AND slot_start < ?2 AND slot_end > ?3",
    )?;

    let rows = stmt.query_map(params![meeting_type_id, fmt_ts(hi), fmt_ts(lo)], |row| {
        Ok((
            parse_ts(&row.get::<_, String>(0)?),
            parse_ts(&row.get::<_, String>(1)?),
        ))
    })?;

    let mut intervals = vec![];
    for row in rows {
        intervals.push(row?);
    }
    Ok(intervals)
}

/// Bookings only ever leave `confirmed`; the guard makes the state
/// machine monotone even under concurrent updates.
pub fn transition_booking(
    conn: &Connection,
    id: &str,
    to: BookingStatus,
    now: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let count = conn.execute(
        "UPDATE bookings SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'confirmed'",
        params![to.as_str(), fmt_ts(now), id],
    )?;
    Ok(count > 0)
}

// ── Documents ──

const DOCUMENT_COLS: &str = "id, hold_id, booking_id, status, signer_email, signer_name, \
     envelope_id, created_at, sent_at, signed_at, updated_at";

fn parse_document_row(row: &rusqlite::Row) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        hold_id: row.get(1)?,
        booking_id: row.get(2)?,
        status: DocumentStatus::parse(&row.get::<_, String>(3)?),
        signer_email: row.get(4)?,
        signer_name: row.get(5)?,
        envelope_id: row.get(6)?,
        created_at: parse_ts(&row.get::<_, String>(7)?),
        sent_at: parse_ts_opt(row.get(8)?),
        signed_at: parse_ts_opt(row.get(9)?),
        updated_at: parse_ts(&row.get::<_, String>(10)?),
    })
}

/// One document per hold; redelivered `slot.held` events hit the unique
/// index and return false.
pub fn insert_document(conn: &Connection, doc: &Document) -> anyhow::Result<bool> {
    let count = conn.execute(
        "INSERT OR IGNORE INTO documents (id, hold_id, booking_id, status, signer_email,
             signer_name, envelope_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            doc.id,
            doc.hold_id,
            doc.booking_id,
            doc.status.as_str(),
            doc.signer_email,
            doc.signer_name,
            doc.envelope_id,
            fmt_ts(doc.created_at),
            fmt_ts(doc.updated_at),
        ],
    )?;
    Ok(count > 0)
}

pub fn get_document_by_hold(conn: &Connection, hold_id: &str) -> anyhow::Result<Option<Document>> {
    conn.query_row(
        &format!("SELECT {DOCUMENT_COLS} FROM documents WHERE hold_id = ?1"),
        params![hold_id],
        parse_document_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Forward-only transition. `from` lists the statuses the document may
/// currently be in; anything else leaves the row untouched.
pub fn transition_document(
    conn: &Connection,
    id: &str,
    from: &[DocumentStatus],
    to: DocumentStatus,
    now: DateTime<Utc>,
    audit: Option<&str>,
) -> anyhow::Result<bool> {
    let placeholders: Vec<String> = (0..from.len()).map(|i| format!("?{}", i + 5)).collect();
    let sql = format!(
        "UPDATE documents SET status = ?1, updated_at = ?2,
             sent_at = CASE WHEN ?1 = 'sent' THEN ?2 ELSE sent_at END,
             signed_at = CASE WHEN ?1 = 'signed' THEN ?2 ELSE signed_at END,
             audit = COALESCE(?3, audit)
         WHERE id = ?4 AND status IN ({})",
        placeholders.join(", ")
    );

    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
        Box::new(to.as_str().to_string()),
        Box::new(fmt_ts(now)),
        Box::new(audit.map(|s| s.to_string())),
        Box::new(id.to_string()),
    ];
    for status in from {
        values.push(Box::new(status.as_str().to_string()));
    }
    let refs: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();

    let count = conn.execute(&sql, refs.as_slice())?;
    Ok(count > 0)
}

pub fn link_document_booking(
    conn: &Connection,
    document_id: &str,
    booking_id: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE documents SET booking_id = ?1 WHERE id = ?2",
        params![booking_id, document_id],
    )?;
    Ok(())
}

// ── Processed webhooks ──

pub fn get_processed_webhook(
    conn: &Connection,
    provider: &str,
    webhook_id: &str,
) -> anyhow::Result<Option<ProcessedWebhook>> {
    conn.query_row(
        "SELECT provider, webhook_id, status, response_body, created_at, updated_at
         FROM processed_webhooks WHERE provider = ?1 AND webhook_id = ?2",
        params![provider, webhook_id],
        |row| {
            Ok(ProcessedWebhook {
                provider: row.get(0)?,
                webhook_id: row.get(1)?,
                status: WebhookStatus::parse(&row.get::<_, String>(2)?),
                response_body: row.get(3)?,
                created_at: parse_ts(&row.get::<_, String>(4)?),
                updated_at: parse_ts(&row.get::<_, String>(5)?),
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// Records the callback as in-flight; an existing row (a retry of a
/// `processing` or `failed` attempt) is left in place.
pub fn insert_processing_webhook(
    conn: &Connection,
    provider: &str,
    webhook_id: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO processed_webhooks (provider, webhook_id, status, created_at, updated_at)
         VALUES (?1, ?2, 'processing', ?3, ?3)",
        params![provider, webhook_id, fmt_ts(now)],
    )?;
    Ok(())
}

pub fn finish_webhook(
    conn: &Connection,
    provider: &str,
    webhook_id: &str,
    status: WebhookStatus,
    response_body: Option<&str>,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE processed_webhooks SET status = ?1, response_body = ?2, updated_at = ?3
         WHERE provider = ?4 AND webhook_id = ?5",
        params![
            status.as_str(),
            response_body,
            fmt_ts(now),
            provider,
            webhook_id,
        ],
    )?;
    Ok(())
}
