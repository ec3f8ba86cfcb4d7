use anyhow::Context;
use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use rusqlite::Connection;
use serde::Serialize;

use crate::db::queries;
use crate::models::{BlackoutDate, Host, MeetingType};

/// Slots starting at or before now + MIN_LEAD_HOURS are never offered.
pub const MIN_LEAD_HOURS: i64 = 2;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub available: bool,
}

/// Candidate slots for the meeting type over `[start_date, end_date]`
/// (dates in the host's zone), sorted ascending. Availability is
/// decided on the absolute timeline; callers convert to the guest's
/// zone for presentation only. Never mutates state.
pub fn compute_slots(
    conn: &Connection,
    meeting_type: &MeetingType,
    host: &Host,
    start_date: NaiveDate,
    end_date: NaiveDate,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<Slot>> {
    let tz: Tz = host
        .timezone
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid host timezone: {}", host.timezone))?;

    let rules = queries::get_rules_for_window(
        conn,
        &meeting_type.host_id,
        &meeting_type.id,
        start_date,
        end_date,
    )?;
    let blackouts = queries::get_blackouts(conn, &meeting_type.host_id)?;

    // Occupancy over the window with a day of slack on each side; the
    // buffered-interval check below decides actual conflicts.
    let window_lo = resolve_earliest(&tz, start_date.and_time(NaiveTime::MIN))
        .context("start date is not representable in the host zone")?
        .with_timezone(&Utc)
        - Duration::days(1);
    let hi_date = end_date.succ_opt().unwrap_or(end_date);
    let window_hi = resolve_earliest(&tz, hi_date.and_time(NaiveTime::MIN))
        .context("end date is not representable in the host zone")?
        .with_timezone(&Utc)
        + Duration::days(1);

    let mut occupancy =
        queries::get_active_holds_in_range(conn, &meeting_type.id, window_lo, window_hi)?;
    occupancy.extend(queries::get_confirmed_bookings_in_range(
        conn,
        &meeting_type.id,
        window_lo,
        window_hi,
    )?);

    let mut slots = vec![];
    let mut day = start_date;
    loop {
        for rule in rules.iter().filter(|r| r.applies_to(day)) {
            for (start, end) in day_candidates(
                &tz,
                day,
                rule.start_time,
                rule.end_time,
                meeting_type.duration_minutes,
            ) {
                let available =
                    is_available(meeting_type, &tz, day, &blackouts, &occupancy, start, end, now);
                slots.push(Slot {
                    start,
                    end,
                    available,
                });
            }
        }

        if day >= end_date {
            break;
        }
        // Adding calendar days in the host zone keeps DST boundaries
        // aligned with the host's wall clock.
        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }

    slots.sort_by_key(|s| (s.start, s.end));
    slots.dedup_by(|a, b| a.start == b.start && a.end == b.end);
    Ok(slots)
}

/// Candidates for one rule on one day, stepping the meeting duration
/// on the absolute timeline. A candidate crossing a DST gap survives
/// iff both wall-clock endpoints still sit inside the rule's window;
/// during fall-back the stepping naturally yields two absolute slots
/// for the same wall label.
fn day_candidates(
    tz: &Tz,
    day: NaiveDate,
    rule_start: NaiveTime,
    rule_end: NaiveTime,
    duration_minutes: i64,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let Some(open) = resolve_earliest(tz, day.and_time(rule_start)) else {
        return vec![];
    };
    let Some(close) = resolve_latest(tz, day.and_time(rule_end)) else {
        return vec![];
    };

    let duration = Duration::minutes(duration_minutes);
    let close = close.with_timezone(&Utc);
    let mut cursor = open.with_timezone(&Utc);
    let mut out = vec![];

    while cursor + duration <= close {
        let end = cursor + duration;
        if wall_within(tz, day, rule_start, rule_end, cursor, end) {
            out.push((cursor, end));
        }
        cursor = end;
    }
    out
}

fn wall_within(
    tz: &Tz,
    day: NaiveDate,
    rule_start: NaiveTime,
    rule_end: NaiveTime,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> bool {
    let wall_start = start.with_timezone(tz);
    let wall_end = end.with_timezone(tz);
    wall_start.date_naive() == day
        && wall_start.time() >= rule_start
        && wall_end.date_naive() == day
        && wall_end.time() <= rule_end
}

#[allow(clippy::too_many_arguments)]
fn is_available(
    meeting_type: &MeetingType,
    tz: &Tz,
    day: NaiveDate,
    blackouts: &[BlackoutDate],
    occupancy: &[(DateTime<Utc>, DateTime<Utc>)],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    // Strictly later than the lead cutoff: a slot at exactly
    // now + lead is already too late to book.
    if start <= now + Duration::hours(MIN_LEAD_HOURS) {
        return false;
    }

    for blackout in blackouts.iter().filter(|b| b.matches(day)) {
        if blackout.is_full_day() {
            return false;
        }
        if let Some((b_start, b_end)) = blackout.window() {
            let resolved = (
                resolve_earliest(tz, day.and_time(b_start)),
                resolve_latest(tz, day.and_time(b_end)),
            );
            if let (Some(b_start), Some(b_end)) = resolved {
                let (b_start, b_end) = (b_start.with_timezone(&Utc), b_end.with_timezone(&Utc));
                if start < b_end && end > b_start {
                    return false;
                }
            }
        }
    }

    let buffered_start = start - Duration::minutes(meeting_type.buffer_before_minutes);
    let buffered_end = end + Duration::minutes(meeting_type.buffer_after_minutes);
    for (busy_start, busy_end) in occupancy {
        if buffered_start < *busy_end && buffered_end > *busy_start {
            return false;
        }
    }

    true
}

/// Maps a wall time to an instant, taking the earlier instant when the
/// wall time is ambiguous and probing past a DST gap when it does not
/// exist.
fn resolve_earliest(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earlier, _) => Some(earlier),
        LocalResult::None => probe_after_gap(tz, local),
    }
}

fn resolve_latest(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(_, later) => Some(later),
        LocalResult::None => probe_after_gap(tz, local),
    }
}

fn probe_after_gap(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    // DST gaps are at most a few hours; probe minute by minute
    let mut probe = local;
    for _ in 0..240 {
        probe += Duration::minutes(1);
        match tz.from_local_datetime(&probe) {
            LocalResult::Single(t) => return Some(t),
            LocalResult::Ambiguous(earlier, _) => return Some(earlier),
            LocalResult::None => {}
        }
    }
    None
}
