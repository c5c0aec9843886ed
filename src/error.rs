use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("unknown filter dimension: {0}")]
    UnknownDimension(String),

    #[error("invalid {dimension} filter value: {value}")]
    InvalidFilterValue { dimension: String, value: String },

    #[error("custom range start {start} is after end {end}")]
    InvalidRange { start: String, end: String },

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("invalid dashboard config: {0}")]
    InvalidConfig(String),

    #[error("unknown facet: {0}")]
    UnknownFacet(String),

    #[error("facet {0} does not map clicks to filters")]
    NotClickable(String),

    #[error("no row labelled {label:?} in facet {facet}")]
    UnknownChartLabel { facet: String, label: String },

    #[error("invalid weekday view mode: {0}")]
    InvalidViewMode(String),

    #[error("year {0} is outside 1..=9999")]
    InvalidYear(i64),

    #[error("invalid ISO week {year}-W{week}")]
    InvalidWeek { year: i32, week: u32 },

    #[error("no active dashboard")]
    Inactive,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DashboardError {
    /// Stable code reported to sidecar clients.
    pub fn code(&self) -> &'static str {
        match self {
            DashboardError::UnknownDimension(_)
            | DashboardError::InvalidFilterValue { .. }
            | DashboardError::InvalidRange { .. }
            | DashboardError::InvalidTimezone(_)
            | DashboardError::InvalidConfig(_)
            | DashboardError::UnknownFacet(_)
            | DashboardError::InvalidViewMode(_)
            | DashboardError::InvalidYear(_)
            | DashboardError::InvalidWeek { .. } => "bad_params",
            DashboardError::NotClickable(_) => "not_clickable",
            DashboardError::UnknownChartLabel { .. } => "not_found",
            DashboardError::Inactive => "no_dashboard",
            DashboardError::Store(_) => "store_failed",
        }
    }
}
