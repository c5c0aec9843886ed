//! Local-calendar conversions.
//!
//! Every place that needs "which day was this" asks [`LocalCalendar::local_date`];
//! labels, residual matching and weekday grouping all go through it so they
//! cannot disagree near midnight.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::error::DashboardError;
use crate::model::YearMonth;

const MONTH_ABBR: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCalendar {
    tz: Tz,
}

impl LocalCalendar {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn parse(name: &str) -> Result<Self, DashboardError> {
        let tz = name
            .trim()
            .parse::<Tz>()
            .map_err(|e| DashboardError::InvalidTimezone(format!("{name}: {e}")))?;
        Ok(Self { tz })
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    pub fn local_weekday(&self, instant: DateTime<Utc>) -> Weekday {
        self.local_date(instant).weekday()
    }

    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        self.local_date(now)
    }

    /// Resolves a wall-clock time to an instant. Times inside a DST gap move
    /// forward to the first valid wall-clock time.
    pub fn instant(&self, local: NaiveDateTime) -> DateTime<Utc> {
        let mut candidate = local;
        for _ in 0..8 {
            if let Some(dt) = self.tz.from_local_datetime(&candidate).earliest() {
                return dt.with_timezone(&Utc);
            }
            match candidate.checked_add_signed(Duration::minutes(30)) {
                Some(next) => candidate = next,
                None => break,
            }
        }
        Utc.from_utc_datetime(&local)
    }

    pub fn start_of_day(&self, date: NaiveDate) -> DateTime<Utc> {
        self.instant(date.and_time(chrono::NaiveTime::MIN))
    }

    /// Last millisecond of the local day.
    pub fn end_of_day(&self, date: NaiveDate) -> DateTime<Utc> {
        match date.succ_opt() {
            Some(next) => self.start_of_day(next) - Duration::milliseconds(1),
            None => self
                .start_of_day(date)
                .checked_add_signed(Duration::days(1) - Duration::milliseconds(1))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn month_label(&self, month: YearMonth) -> String {
        let idx = (month.month as usize).saturating_sub(1).min(11);
        format!("{}/{}", MONTH_ABBR[idx], month.year)
    }

    /// `DD/MM Weekday`
    pub fn day_label(&self, date: NaiveDate) -> String {
        format!(
            "{:02}/{:02} {}",
            date.day(),
            date.month(),
            weekday_name(date.weekday())
        )
    }
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Monday = 1 .. Friday = 5. Weekends have no school-day number.
pub fn school_day_number(day: Weekday) -> Option<u8> {
    match day {
        Weekday::Sat | Weekday::Sun => None,
        d => Some(d.number_from_monday() as u8),
    }
}

pub fn school_day_from_number(n: u8) -> Option<Weekday> {
    match n {
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        _ => None,
    }
}
