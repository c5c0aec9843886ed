//! In-memory evaluation of the calendar filters that are not pushed to the
//! store: a specific local date and a school weekday.

use chrono::{DateTime, NaiveDate, Utc};

use crate::calendar::{school_day_number, LocalCalendar};
use crate::filters::FilterSet;
use crate::model::Occurrence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualFilter {
    SpecificDate(NaiveDate),
    /// Monday = 1 .. Friday = 5.
    Weekday(u8),
}

impl ResidualFilter {
    /// SpecificDate wins if both are present.
    pub fn select(specific_date: Option<NaiveDate>, weekday: Option<u8>) -> Option<Self> {
        match (specific_date, weekday) {
            (Some(d), _) => Some(ResidualFilter::SpecificDate(d)),
            (None, Some(n)) => Some(ResidualFilter::Weekday(n)),
            (None, None) => None,
        }
    }

    pub fn from_filters(filters: &FilterSet) -> Option<Self> {
        Self::select(filters.specific_date(), filters.weekday())
    }

    pub fn matches(&self, cal: &LocalCalendar, instant: DateTime<Utc>) -> bool {
        match self {
            ResidualFilter::SpecificDate(d) => cal.local_date(instant) == *d,
            ResidualFilter::Weekday(n) => school_day_number(cal.local_weekday(instant)) == Some(*n),
        }
    }
}

pub fn apply(
    cal: &LocalCalendar,
    residual: Option<ResidualFilter>,
    mut records: Vec<Occurrence>,
) -> Vec<Occurrence> {
    if let Some(filter) = residual {
        records.retain(|r| filter.matches(cal, r.occurred_at));
    }
    records
}
