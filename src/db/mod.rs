pub mod migrations;
pub mod queries;

use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rusqlite::Connection;

/// Shared database handle. All access is serialized through the mutex;
/// no lock may be held across an await point.
pub type Db = Arc<Mutex<Connection>>;

pub const TS_FMT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FMT: &str = "%Y-%m-%d";
pub const TIME_FMT: &str = "%H:%M";

pub fn init_db(path: &str) -> anyhow::Result<Connection> {
    let conn = Connection::open(path).context("failed to open database")?;

    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        .context("failed to set database pragmas")?;

    migrations::run_migrations(&conn)?;

    Ok(conn)
}

pub fn open_shared(path: &str) -> anyhow::Result<Db> {
    Ok(Arc::new(Mutex::new(init_db(path)?)))
}

// ── Timestamp encoding ──
//
// Instants are stored as UTC strings in a fixed-width format so that
// lexicographic comparison in SQL matches chronological order.

pub fn fmt_ts(t: DateTime<Utc>) -> String {
    t.format(TS_FMT).to_string()
}

pub fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, TS_FMT)
        .map(|n| n.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

pub fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref()
        .and_then(|v| NaiveDateTime::parse_from_str(v, TS_FMT).ok())
        .map(|n| n.and_utc())
}

pub fn fmt_date(d: NaiveDate) -> String {
    d.format(DATE_FMT).to_string()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FMT).ok()
}

pub fn fmt_time(t: NaiveTime) -> String {
    t.format(TIME_FMT).to_string()
}

pub fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, TIME_FMT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_round_trip_drops_subseconds() {
        let now = Utc::now();
        let back = parse_ts(&fmt_ts(now));
        assert_eq!(back.timestamp(), now.timestamp());
        assert_eq!(back.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn test_ts_ordering_is_lexicographic() {
        let a = fmt_ts(parse_ts("2025-04-08 13:00:00"));
        let b = fmt_ts(parse_ts("2025-04-08 13:30:00"));
        assert!(a < b);
    }

    #[test]
    fn test_init_db_in_memory() {
        let conn = init_db(":memory:").unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM meeting_types", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
