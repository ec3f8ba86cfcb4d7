use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// A weekly recurring availability window in the host's wall clock.
/// Multiple rules per weekday union together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: String,
    pub host_id: String,
    /// None scopes the rule to every meeting type owned by the host.
    pub meeting_type_id: Option<String>,
    /// 0 = Sunday .. 6 = Saturday.
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub effective_from: Option<NaiveDate>,
    /// Exclusive upper bound of the effective window.
    pub effective_until: Option<NaiveDate>,
    pub active: bool,
}

impl AvailabilityRule {
    /// Whether the rule's effective window covers the given date.
    pub fn effective_on(&self, date: NaiveDate) -> bool {
        if let Some(from) = self.effective_from {
            if date < from {
                return false;
            }
        }
        if let Some(until) = self.effective_until {
            if date >= until {
                return false;
            }
        }
        true
    }

    pub fn applies_to(&self, date: NaiveDate) -> bool {
        use chrono::Datelike;
        self.active
            && date.weekday().num_days_from_sunday() == u32::from(self.day_of_week)
            && self.effective_on(date)
    }
}

/// A date the host is unavailable, optionally limited to a wall-clock
/// interval. `recurring_yearly` matches on month and day only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackoutDate {
    pub id: String,
    pub host_id: String,
    pub date: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub recurring_yearly: bool,
}

impl BlackoutDate {
    pub fn matches(&self, date: NaiveDate) -> bool {
        use chrono::Datelike;
        if self.recurring_yearly {
            self.date.month() == date.month() && self.date.day() == date.day()
        } else {
            self.date == date
        }
    }

    /// Whole-day blackouts carry no times; a partial blackout with
    /// start >= end is malformed and treated as absent.
    pub fn window(&self) -> Option<(NaiveTime, NaiveTime)> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) if start < end => Some((start, end)),
            _ => None,
        }
    }

    pub fn is_full_day(&self) -> bool {
        self.start_time.is_none() || self.end_time.is_none()
    }
}
