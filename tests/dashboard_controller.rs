mod test_support;

use async_trait::async_trait;
use occurrenced::aggregate::{Facet, FacetRow, KpiSummary, Variance, WeekdayMode};
use occurrenced::config::DashboardConfig;
use occurrenced::controller::{ChartClick, DashboardController};
use occurrenced::db::SqliteStore;
use occurrenced::filters::{Dimension, FilterValue};
use occurrenced::model::{ClassRef, LabelRef, Occurrence, OccurrenceTypeRef, StudentRef, TeacherRef};
use occurrenced::store::{OccurrenceQuery, OccurrenceStore, StoreError, StoreResult};
use occurrenced::window::IsoWeek;
use occurrenced::DashboardError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_support::{seeded_store, INSTITUTION, TIMEZONE};
use tokio::sync::watch;

fn config(quiescence_ms: u64) -> DashboardConfig {
    DashboardConfig {
        institution_id: INSTITUTION.to_string(),
        timezone: TIMEZONE.to_string(),
        quiescence_ms,
        year: Some(2025),
        weekday_mode: WeekdayMode::Average,
    }
}

fn activate(store: Arc<dyn OccurrenceStore>, quiescence_ms: u64) -> DashboardController {
    DashboardController::activate(store, &config(quiescence_ms)).expect("activate dashboard")
}

async fn settle(dashboard: &DashboardController) {
    tokio::time::timeout(Duration::from_secs(5), dashboard.wait_until_idle())
        .await
        .expect("dashboard settles");
}

fn counts(rows: &[FacetRow]) -> Vec<(&str, u64)> {
    rows.iter().map(|r| (r.label.as_str(), r.count)).collect()
}

fn click(facet: &str, label: &str) -> ChartClick {
    ChartClick {
        facet: facet.to_string(),
        label: label.to_string(),
        index: None,
    }
}

#[tokio::test]
async fn unfiltered_year_fills_every_facet() {
    let dashboard = activate(Arc::new(seeded_store()), 10);
    settle(&dashboard).await;
    let snap = dashboard.snapshot();
    let f = &snap.facets;

    assert_eq!(snap.status.epoch, 1);
    assert!(snap.failures.is_empty());
    assert_eq!(counts(&f.class), vec![("Class A", 4), ("Class B", 2)]);
    assert_eq!(counts(&f.student), vec![("Ana", 3), ("Caio", 2), ("Bia", 1)]);
    assert_eq!(counts(&f.occurrence_type), vec![("Late (low)", 4), ("Fight (high)", 2)]);
    assert_eq!(counts(&f.teacher), vec![("Teacher One", 3), ("Teacher Two", 3)]);
    assert_eq!(counts(&f.shift), vec![("Morning", 4), ("Evening", 2)]);
    assert_eq!(counts(&f.education_level), vec![("Elementary", 4), ("Middle School", 2)]);
    assert_eq!(
        f.kpi,
        KpiSummary {
            total_occurrences: 6,
            students_with_occurrences: 3,
            students_without_occurrences: 1,
            total_students_in_scope: 4,
        }
    );

    // Past year: January through December.
    assert_eq!(f.monthly.len(), 12);
    assert_eq!(f.monthly[0].label, "Jan/2025");
    assert_eq!(
        f.monthly.iter().take(6).map(|r| r.count).collect::<Vec<_>>(),
        vec![0, 0, 4, 1, 1, 0]
    );
    assert_eq!(f.monthly[0].percent_change, None);
    assert_eq!(f.monthly[2].percent_change, Some(Variance::New));
    assert_eq!(f.monthly[3].percent_change, Some(Variance::Percent(-75.0)));

    // The 23:50 Tuesday record is a Wednesday in UTC; it must count as Tuesday.
    assert_eq!(f.weekday_mode, WeekdayMode::Average);
    assert_eq!(
        counts(&f.weekday),
        vec![("Monday", 2), ("Tuesday", 3), ("Wednesday", 1), ("Thursday", 0), ("Friday", 0)]
    );
    assert_eq!(f.weekday[0].average, Some(1.0));
    assert_eq!(f.weekday[1].average, Some(1.0));
}

#[tokio::test]
async fn class_click_narrows_students_and_clear_restores() {
    let dashboard = activate(Arc::new(seeded_store()), 10);
    settle(&dashboard).await;
    let baseline = dashboard.snapshot().facets;

    let filter = dashboard.chart_click(&click("class", "Class A")).expect("click class");
    assert_eq!(filter.value, FilterValue::Class("c-a".into()));
    assert_eq!(filter.label, "Class A");
    assert!(dashboard.has_active_filters());
    settle(&dashboard).await;

    let f = dashboard.snapshot().facets;
    assert_eq!(counts(&f.class), vec![("Class A", 4)]);
    assert_eq!(counts(&f.student), vec![("Ana", 3), ("Bia", 1)]);
    assert_eq!(f.kpi.total_students_in_scope, 2);
    assert_eq!(f.kpi.students_without_occurrences, 0);
    assert_eq!(f.monthly[2].count, 3);

    assert!(dashboard.clear_filters());
    assert!(!dashboard.has_active_filters());
    settle(&dashboard).await;
    assert_eq!(dashboard.snapshot().facets, baseline);
}

#[tokio::test]
async fn calendar_filters_apply_in_memory_and_evict_each_other() {
    let dashboard = activate(Arc::new(seeded_store()), 10);
    settle(&dashboard).await;

    dashboard
        .add_filter_raw("specificDate", "2025-03-04", "04/03 Tuesday")
        .expect("specific date");
    settle(&dashboard).await;
    let f = dashboard.snapshot().facets;
    assert_eq!(counts(&f.class), vec![("Class A", 1)]);
    assert_eq!(counts(&f.student), vec![("Bia", 1)]);
    // Monthly keeps the full context.
    assert_eq!(f.monthly[2].count, 4);

    dashboard.add_filter_raw("weekday", "3", "Wednesday").expect("weekday");
    let filters = dashboard.filters();
    assert!(filters.get(Dimension::SpecificDate).is_none());
    assert_eq!(filters.weekday(), Some(3));
    settle(&dashboard).await;
    let f = dashboard.snapshot().facets;
    assert_eq!(counts(&f.class), vec![("Class B", 1)]);
    assert_eq!(counts(&f.student), vec![("Caio", 1)]);
}

#[tokio::test]
async fn month_click_narrows_other_facets_only() {
    let dashboard = activate(Arc::new(seeded_store()), 10);
    settle(&dashboard).await;

    let filter = dashboard.chart_click(&click("monthly", "Mar/2025")).expect("click month");
    assert_eq!(filter.dimension(), Dimension::Month);
    settle(&dashboard).await;

    let snap = dashboard.snapshot();
    let f = &snap.facets;
    assert_eq!(counts(&f.student), vec![("Ana", 2), ("Bia", 1), ("Caio", 1)]);
    assert_eq!(f.kpi.total_occurrences, 4);
    assert_eq!(f.monthly.len(), 12);
    assert_eq!(f.monthly[3].count, 1);
    let window = snap.window.expect("window");
    assert_eq!(window.buckets.len(), 12);
}

#[tokio::test]
async fn week_view_lists_school_days_and_clicks_to_dates() {
    let dashboard = activate(Arc::new(seeded_store()), 10);
    settle(&dashboard).await;

    assert!(dashboard.set_weekday_mode(WeekdayMode::Week));
    assert!(dashboard.select_week(Some(IsoWeek::new(2025, 10).expect("week"))));
    settle(&dashboard).await;

    let f = dashboard.snapshot().facets;
    assert_eq!(f.weekday_mode, WeekdayMode::Week);
    assert_eq!(
        counts(&f.weekday),
        vec![
            ("03/03 Monday", 1),
            ("04/03 Tuesday", 1),
            ("05/03 Wednesday", 1),
            ("06/03 Thursday", 0),
            ("07/03 Friday", 0),
        ]
    );

    let filter = dashboard
        .chart_click(&ChartClick {
            facet: "weekday".into(),
            label: "04/03 Tuesday".into(),
            index: Some(1),
        })
        .expect("click day");
    assert_eq!(
        filter.value,
        FilterValue::SpecificDate(chrono::NaiveDate::from_ymd_opt(2025, 3, 4).expect("date"))
    );
}

#[tokio::test]
async fn rapid_changes_coalesce_into_one_cycle() {
    let dashboard = activate(Arc::new(seeded_store()), 150);
    settle(&dashboard).await;
    assert_eq!(dashboard.status().epoch, 1);

    dashboard.add_filter_raw("student", "s-ana", "Ana").expect("student");
    assert!(dashboard.set_weekday_mode(WeekdayMode::MonthDetail));
    assert!(!dashboard.set_year(2025).expect("valid year"));
    dashboard.add_filter_raw("teacher", "t-1", "Teacher One").expect("teacher");
    settle(&dashboard).await;

    let snap = dashboard.snapshot();
    assert_eq!(snap.status.epoch, 2);
    assert_eq!(snap.facets.kpi.total_occurrences, 2);
    assert_eq!(snap.facets.weekday_mode, WeekdayMode::MonthDetail);
    assert_eq!(
        counts(&snap.facets.weekday),
        vec![("03/03 Monday", 1), ("10/03 Monday", 1)]
    );
}

#[tokio::test]
async fn empty_year_scope_zeroes_every_facet() {
    let dashboard = activate(Arc::new(seeded_store()), 10);
    settle(&dashboard).await;

    assert!(dashboard.set_year(2030).expect("valid year"));
    settle(&dashboard).await;
    let snap = dashboard.snapshot();
    assert!(snap.facets.class.is_empty());
    assert!(snap.facets.student.is_empty());
    assert!(snap.facets.monthly.is_empty());
    assert_eq!(snap.facets.kpi, KpiSummary::default());
    assert!(snap.window.is_some());

    assert!(dashboard.set_year(2025).expect("valid year"));
    settle(&dashboard).await;
    assert_eq!(dashboard.snapshot().facets.kpi.total_occurrences, 6);
}

#[tokio::test]
async fn out_of_range_year_is_rejected_and_dashboard_stays_live() {
    let dashboard = activate(Arc::new(seeded_store()), 10);
    settle(&dashboard).await;

    assert!(matches!(
        dashboard.set_year(300_000),
        Err(DashboardError::InvalidYear(300_000))
    ));
    assert!(dashboard.set_year(0).is_err());
    assert_eq!(dashboard.inputs().year, 2025);
    settle(&dashboard).await;
    assert_eq!(dashboard.snapshot().facets.kpi.total_occurrences, 6);

    let mut bad = config(10);
    bad.year = Some(300_000);
    assert!(matches!(
        DashboardController::activate(Arc::new(seeded_store()), &bad),
        Err(DashboardError::InvalidYear(300_000))
    ));
}

#[tokio::test]
async fn unclickable_and_unknown_clicks_are_rejected() {
    let dashboard = activate(Arc::new(seeded_store()), 10);
    settle(&dashboard).await;

    assert!(matches!(
        dashboard.chart_click(&click("kpi", "Total")),
        Err(DashboardError::NotClickable(_))
    ));
    assert!(matches!(
        dashboard.chart_click(&click("class", "Class Z")),
        Err(DashboardError::UnknownChartLabel { .. })
    ));
    assert!(matches!(
        dashboard.chart_click(&click("bogus", "x")),
        Err(DashboardError::UnknownFacet(_))
    ));
    assert!(!dashboard.has_active_filters());
}

/// Holds `occurrences` calls for one student until the gate opens.
struct GatedStore {
    inner: SqliteStore,
    student_id: String,
    open: watch::Sender<bool>,
    blocked: AtomicUsize,
}

#[async_trait]
impl OccurrenceStore for GatedStore {
    async fn count(&self, query: &OccurrenceQuery) -> StoreResult<u64> {
        self.inner.count(query).await
    }

    async fn occurrences(&self, query: &OccurrenceQuery) -> StoreResult<Vec<Occurrence>> {
        if query.student_id.as_deref() == Some(self.student_id.as_str()) {
            self.blocked.fetch_add(1, Ordering::SeqCst);
            let mut rx = self.open.subscribe();
            let _ = rx.wait_for(|open| *open).await;
        }
        self.inner.occurrences(query).await
    }

    async fn classes(&self, institution_id: &str, school_year: i32) -> StoreResult<Vec<ClassRef>> {
        self.inner.classes(institution_id, school_year).await
    }

    async fn students(&self, class_ids: &[String]) -> StoreResult<Vec<StudentRef>> {
        self.inner.students(class_ids).await
    }

    async fn teachers(&self, institution_id: &str) -> StoreResult<Vec<TeacherRef>> {
        self.inner.teachers(institution_id).await
    }

    async fn occurrence_types(&self, institution_id: &str) -> StoreResult<Vec<OccurrenceTypeRef>> {
        self.inner.occurrence_types(institution_id).await
    }

    async fn shifts(&self) -> StoreResult<Vec<LabelRef>> {
        self.inner.shifts().await
    }

    async fn education_levels(&self) -> StoreResult<Vec<LabelRef>> {
        self.inner.education_levels().await
    }
}

#[tokio::test]
async fn late_results_of_a_stale_cycle_never_overwrite_newer_ones() {
    let (open, _) = watch::channel(false);
    let store = Arc::new(GatedStore {
        inner: seeded_store(),
        student_id: "s-ana".into(),
        open,
        blocked: AtomicUsize::new(0),
    });
    let dashboard = activate(store.clone(), 10);
    settle(&dashboard).await;
    let baseline = dashboard.snapshot().facets;

    dashboard.add_filter_raw("student", "s-ana", "Ana").expect("student");
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.blocked.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stale cycle reaches the store");

    assert!(dashboard.remove_filter(Dimension::Student));
    settle(&dashboard).await;
    let epoch = dashboard.status().epoch;
    assert_eq!(epoch, 3);
    assert_eq!(dashboard.snapshot().facets, baseline);

    store.open.send_replace(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snap = dashboard.snapshot();
    assert_eq!(snap.status.epoch, epoch);
    assert_eq!(snap.facets, baseline);
}

/// Fails `students` on demand.
struct FlakyStore {
    inner: SqliteStore,
    fail_students: AtomicBool,
}

#[async_trait]
impl OccurrenceStore for FlakyStore {
    async fn count(&self, query: &OccurrenceQuery) -> StoreResult<u64> {
        self.inner.count(query).await
    }

    async fn occurrences(&self, query: &OccurrenceQuery) -> StoreResult<Vec<Occurrence>> {
        self.inner.occurrences(query).await
    }

    async fn classes(&self, institution_id: &str, school_year: i32) -> StoreResult<Vec<ClassRef>> {
        self.inner.classes(institution_id, school_year).await
    }

    async fn students(&self, class_ids: &[String]) -> StoreResult<Vec<StudentRef>> {
        if self.fail_students.load(Ordering::SeqCst) {
            return Err(StoreError::Query("students table unavailable".into()));
        }
        self.inner.students(class_ids).await
    }

    async fn teachers(&self, institution_id: &str) -> StoreResult<Vec<TeacherRef>> {
        self.inner.teachers(institution_id).await
    }

    async fn occurrence_types(&self, institution_id: &str) -> StoreResult<Vec<OccurrenceTypeRef>> {
        self.inner.occurrence_types(institution_id).await
    }

    async fn shifts(&self) -> StoreResult<Vec<LabelRef>> {
        self.inner.shifts().await
    }

    async fn education_levels(&self) -> StoreResult<Vec<LabelRef>> {
        self.inner.education_levels().await
    }
}

#[tokio::test]
async fn failing_facet_keeps_previous_rows_and_reports() {
    let store = Arc::new(FlakyStore {
        inner: seeded_store(),
        fail_students: AtomicBool::new(false),
    });
    let dashboard = activate(store.clone(), 10);
    settle(&dashboard).await;
    let before = dashboard.snapshot().facets;

    store.fail_students.store(true, Ordering::SeqCst);
    dashboard.add_filter_raw("class", "c-b", "Class B").expect("class");
    settle(&dashboard).await;

    let snap = dashboard.snapshot();
    assert_eq!(counts(&snap.facets.class), vec![("Class B", 2)]);
    assert_eq!(snap.facets.student, before.student);
    assert_eq!(snap.facets.kpi, before.kpi);

    let mut failed: Vec<Facet> = snap.failures.iter().filter_map(|f| f.facet).collect();
    failed.sort();
    assert_eq!(failed, vec![Facet::Student, Facet::Kpi]);
    assert!(snap.failures.iter().all(|f| f.epoch == 2));
}
