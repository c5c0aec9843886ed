//! Year / custom range / active month resolution into concrete instants and
//! month buckets.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;

use crate::calendar::LocalCalendar;
use crate::error::DashboardError;
use crate::model::YearMonth;

/// Years the dashboard accepts; four digits, as in the `YYYY-MM` wire form.
pub const YEARS: std::ops::RangeInclusive<i32> = 1..=9999;

pub fn validate_year(year: i32) -> Result<i32, DashboardError> {
    if YEARS.contains(&year) {
        Ok(year)
    } else {
        Err(DashboardError::InvalidYear(i64::from(year)))
    }
}

/// Inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn for_dates(cal: &LocalCalendar, first: NaiveDate, last: NaiveDate) -> Self {
        Self {
            start: cal.start_of_day(first),
            end: cal.end_of_day(last),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthBucket {
    pub month: YearMonth,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub label: String,
}

impl MonthBucket {
    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            start: self.start,
            end: self.end,
        }
    }
}

/// Custom range of local dates, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, DashboardError> {
        validate_year(start.year())?;
        validate_year(end.year())?;
        if start > end {
            return Err(DashboardError::InvalidRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self { start, end })
    }

    fn clamp(&self, first: NaiveDate, last: NaiveDate) -> (NaiveDate, NaiveDate) {
        (first.max(self.start), last.min(self.end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowInputs {
    pub year: i32,
    pub custom: Option<DateRange>,
    pub month_filter: Option<YearMonth>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedWindow {
    /// Yearly or custom window, used by the monthly facet.
    pub window: TimeWindow,
    pub buckets: Vec<MonthBucket>,
    /// Window for every other facet: the active month when one is filtered.
    pub facet_window: TimeWindow,
    /// Last local date covered by `facet_window`.
    #[serde(skip)]
    pub facet_last_day: NaiveDate,
}

pub fn resolve(cal: &LocalCalendar, inputs: &WindowInputs, today: NaiveDate) -> ResolvedWindow {
    let (first_day, last_day) = match inputs.custom {
        Some(range) => (range.start, range.end),
        None => {
            let last_month = if inputs.year == today.year() {
                YearMonth::of(today)
            } else {
                YearMonth {
                    year: inputs.year,
                    month: 12,
                }
            };
            let first_month = YearMonth {
                year: inputs.year,
                month: 1,
            };
            (first_month.first_day(), last_month.last_day())
        }
    };

    let buckets = month_buckets(cal, first_day, last_day);
    let window = TimeWindow::for_dates(cal, first_day, last_day);

    let (facet_window, facet_last_day) = match inputs.month_filter {
        Some(month) => {
            let (first, last) = match inputs.custom {
                Some(range) => range.clamp(month.first_day(), month.last_day()),
                None => (month.first_day(), month.last_day()),
            };
            (TimeWindow::for_dates(cal, first, last), last)
        }
        None => (window, last_day),
    };

    ResolvedWindow {
        window,
        buckets,
        facet_window,
        facet_last_day,
    }
}

/// One bucket per calendar month touched by `first..=last`; the outer edges
/// are the literal dates, inner edges are month boundaries.
pub fn month_buckets(cal: &LocalCalendar, first: NaiveDate, last: NaiveDate) -> Vec<MonthBucket> {
    let mut out = Vec::new();
    if first > last {
        return out;
    }
    let end_month = YearMonth::of(last);
    let mut month = YearMonth::of(first);
    while month <= end_month {
        let start = month.first_day().max(first);
        let end = month.last_day().min(last);
        out.push(MonthBucket {
            month,
            start: cal.start_of_day(start),
            end: cal.end_of_day(end),
            label: cal.month_label(month),
        });
        month = month.next();
    }
    out
}

/// ISO 8601 week selector for the weekday facet's `week` view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsoWeek {
    pub year: i32,
    pub week: u32,
}

impl IsoWeek {
    pub fn new(year: i32, week: u32) -> Result<Self, DashboardError> {
        validate_year(year)?;
        let w = Self { year, week };
        if w.monday().is_none() {
            return Err(DashboardError::InvalidWeek { year, week });
        }
        Ok(w)
    }

    pub fn containing(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }

    pub fn monday(&self) -> Option<NaiveDate> {
        NaiveDate::from_isoywd_opt(self.year, self.week, chrono::Weekday::Mon)
    }

    /// Monday 00:00 to Friday 23:59:59.999, local time.
    pub fn school_days_window(&self, cal: &LocalCalendar) -> Option<TimeWindow> {
        let monday = self.monday()?;
        let friday = monday + chrono::Duration::days(4);
        Some(TimeWindow::for_dates(cal, monday, friday))
    }
}
