//! Pure translation of dashboard inputs into the store queries of one refresh
//! cycle.

use chrono::NaiveDate;
use serde::Serialize;

use crate::aggregate::WeekdayMode;
use crate::calendar::LocalCalendar;
use crate::filters::{FilterSet, FilterValue};
use crate::model::ClassRef;
use crate::residual::ResidualFilter;
use crate::store::OccurrenceQuery;
use crate::window::{self, DateRange, IsoWeek, ResolvedWindow, WindowInputs};

/// Everything a refresh depends on, captured once per cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardInputs {
    pub institution_id: String,
    pub year: i32,
    pub custom_range: Option<DateRange>,
    pub filters: FilterSet,
    pub weekday_mode: WeekdayMode,
    pub selected_week: Option<IsoWeek>,
}

impl DashboardInputs {
    pub fn new(institution_id: impl Into<String>, year: i32) -> Self {
        Self {
            institution_id: institution_id.into(),
            year,
            custom_range: None,
            filters: FilterSet::new(),
            weekday_mode: WeekdayMode::default(),
            selected_week: None,
        }
    }

    pub fn window_inputs(&self) -> WindowInputs {
        WindowInputs {
            year: self.year,
            custom: self.custom_range,
            month_filter: self.filters.month(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekdayPlan {
    pub mode: WeekdayMode,
    /// Set in `week` mode.
    pub monday: Option<NaiveDate>,
    #[serde(skip)]
    pub query: OccurrenceQuery,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub window: ResolvedWindow,
    /// Classes of the selected year after Class/Shift/EducationLevel filters.
    pub class_scope: Vec<ClassRef>,
    /// Entity predicates plus the facet window.
    pub base: OccurrenceQuery,
    pub residual: Option<ResidualFilter>,
    /// One count query per month bucket, aligned with `window.buckets`.
    pub monthly: Vec<OccurrenceQuery>,
    pub weekday: WeekdayPlan,
}

impl QueryPlan {
    pub fn class_ids(&self) -> Vec<String> {
        self.class_scope.iter().map(|c| c.id.clone()).collect()
    }
}

pub fn effective_class_scope(filters: &FilterSet, year_classes: &[ClassRef]) -> Vec<ClassRef> {
    year_classes
        .iter()
        .filter(|c| filters.class_id().map(|id| c.id == id).unwrap_or(true))
        .filter(|c| {
            filters
                .shift_id()
                .map(|id| c.shift_id.as_deref() == Some(id))
                .unwrap_or(true)
        })
        .filter(|c| {
            filters
                .education_level_id()
                .map(|id| c.education_level_id.as_deref() == Some(id))
                .unwrap_or(true)
        })
        .cloned()
        .collect()
}

/// Store predicates shared by every facet: institution, class scope and the
/// entity filters. Calendar filters never reach the store.
fn entity_query(institution_id: &str, filters: &FilterSet, scope: &[ClassRef]) -> OccurrenceQuery {
    let mut q = OccurrenceQuery::for_institution(institution_id);
    q.class_ids = Some(scope.iter().map(|c| c.id.clone()).collect());
    for f in filters.active() {
        match &f.value {
            FilterValue::Student(id) => q.student_id = Some(id.clone()),
            FilterValue::Teacher(id) => q.teacher_id = Some(id.clone()),
            FilterValue::OccurrenceType(id) => q.occurrence_type_id = Some(id.clone()),
            // Narrowed through the class scope.
            FilterValue::Class(_) | FilterValue::Shift(_) | FilterValue::EducationLevel(_) => {}
            // Selects the facet window.
            FilterValue::Month(_) => {}
            // Evaluated in memory.
            FilterValue::SpecificDate(_) | FilterValue::Weekday(_) => {}
        }
    }
    q
}

pub fn plan(
    cal: &LocalCalendar,
    inputs: &DashboardInputs,
    year_classes: &[ClassRef],
    today: NaiveDate,
) -> QueryPlan {
    let window = window::resolve(cal, &inputs.window_inputs(), today);
    let class_scope = effective_class_scope(&inputs.filters, year_classes);
    let entities = entity_query(&inputs.institution_id, &inputs.filters, &class_scope);

    let base = entities.with_range(window.facet_window);
    let monthly = window
        .buckets
        .iter()
        .map(|b| entities.with_range(b.window()))
        .collect();

    let weekday = match inputs.weekday_mode {
        WeekdayMode::Week => {
            let week = inputs
                .selected_week
                .unwrap_or_else(|| default_week(cal, &window, today));
            match (week.monday(), week.school_days_window(cal)) {
                (Some(monday), Some(range)) => WeekdayPlan {
                    mode: WeekdayMode::Week,
                    monday: Some(monday),
                    query: entities.with_range(range),
                },
                _ => WeekdayPlan {
                    mode: WeekdayMode::Week,
                    monday: None,
                    query: base.clone(),
                },
            }
        }
        mode => WeekdayPlan {
            mode,
            monday: None,
            query: base.clone(),
        },
    };

    QueryPlan {
        residual: ResidualFilter::from_filters(&inputs.filters),
        window,
        class_scope,
        base,
        monthly,
        weekday,
    }
}

/// Today's ISO week when today lies in the facet window, else the week of the
/// window's last day.
pub fn default_week(cal: &LocalCalendar, window: &ResolvedWindow, today: NaiveDate) -> IsoWeek {
    let first = cal.local_date(window.facet_window.start);
    if today >= first && today <= window.facet_last_day {
        IsoWeek::containing(today)
    } else {
        IsoWeek::containing(window.facet_last_day)
    }
}
