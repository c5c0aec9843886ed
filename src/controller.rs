//! Debounced, epoch-guarded orchestration of the dashboard facets.
//!
//! Every input change schedules a refresh. A scheduler task waits for a quiet
//! period, then mints a new epoch, snapshots the inputs and spawns one task per
//! facet. A task commits its result only while its epoch is still the latest;
//! anything older is dropped on arrival.

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregate::{self, Facet, FacetResults, FacetRow, FacetValue, WeekdayMode};
use crate::calendar::LocalCalendar;
use crate::config::DashboardConfig;
use crate::error::DashboardError;
use crate::filters::{Dimension, Filter, FilterSet, FilterValue};
use crate::model::Occurrence;
use crate::plan::{self, DashboardInputs, QueryPlan};
use crate::residual::{self, ResidualFilter};
use crate::store::{OccurrenceQuery, OccurrenceStore, StoreResult};
use crate::window::{validate_year, DateRange, IsoWeek, ResolvedWindow};

const MAX_FAILURES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Idle,
    Loading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshStatus {
    /// Latest minted epoch; 0 before the first cycle.
    pub epoch: u64,
    pub phase: Phase,
    /// Refresh requests issued so far.
    pub requested: u64,
    /// Requests already covered by a started cycle.
    pub served: u64,
}

impl RefreshStatus {
    pub fn is_settled(&self) -> bool {
        self.phase == Phase::Idle && self.served >= self.requested
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetFailure {
    pub epoch: u64,
    /// `None` when the class scope itself could not be loaded.
    pub facet: Option<Facet>,
    pub message: String,
}

/// Inbound chart interaction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartClick {
    pub facet: String,
    pub label: String,
    #[serde(default)]
    pub index: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub status: RefreshStatus,
    pub institution_id: String,
    pub year: i32,
    pub custom_range: Option<DateRange>,
    pub filters: Vec<Filter>,
    pub weekday_mode: WeekdayMode,
    pub selected_week: Option<IsoWeek>,
    /// Window of the last committed cycle.
    pub window: Option<ResolvedWindow>,
    pub facets: FacetResults,
    pub failures: Vec<FacetFailure>,
}

#[derive(Debug, Default)]
struct Committed {
    facets: FacetResults,
    window: Option<ResolvedWindow>,
    failures: Vec<FacetFailure>,
}

impl Committed {
    fn push_failure(&mut self, failure: FacetFailure) {
        self.failures.push(failure);
        if self.failures.len() > MAX_FAILURES {
            let excess = self.failures.len() - MAX_FAILURES;
            self.failures.drain(..excess);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Shared {
    store: Arc<dyn OccurrenceStore>,
    calendar: LocalCalendar,
    quiescence: Duration,
    inputs: Mutex<DashboardInputs>,
    committed: Mutex<Committed>,
    latest_epoch: AtomicU64,
    requests: AtomicU64,
    status: watch::Sender<RefreshStatus>,
}

impl Shared {
    fn is_current(&self, epoch: u64) -> bool {
        self.latest_epoch.load(Ordering::SeqCst) == epoch
    }

    /// Minted under the commit lock so no older result can land after a newer
    /// epoch exists.
    fn mint_epoch(&self) -> u64 {
        let _guard = lock(&self.committed);
        self.latest_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn retire(&self) {
        let _guard = lock(&self.committed);
        self.latest_epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self, epoch: u64) {
        self.status.send_modify(|s| {
            if s.epoch == epoch {
                s.phase = Phase::Idle;
            }
        });
    }

    fn commit_window(&self, epoch: u64, window: ResolvedWindow) -> bool {
        let mut state = lock(&self.committed);
        if !self.is_current(epoch) {
            return false;
        }
        state.window = Some(window);
        true
    }

    fn reset(&self, epoch: u64, window: ResolvedWindow, mode: WeekdayMode) {
        let mut state = lock(&self.committed);
        if !self.is_current(epoch) {
            debug!(epoch, "stale empty-scope reset discarded");
            return;
        }
        state.facets = FacetResults {
            weekday_mode: mode,
            ..FacetResults::default()
        };
        state.window = Some(window);
    }

    fn record_scope_failure(&self, epoch: u64, message: String) {
        let mut state = lock(&self.committed);
        if self.is_current(epoch) {
            state.push_failure(FacetFailure {
                epoch,
                facet: None,
                message,
            });
        }
    }

    fn complete_facet(
        &self,
        epoch: u64,
        facet: Facet,
        outcome: StoreResult<FacetValue>,
        remaining: &AtomicUsize,
    ) {
        {
            let mut state = lock(&self.committed);
            if !self.is_current(epoch) {
                debug!(epoch, %facet, "stale facet result discarded");
                return;
            }
            match outcome {
                Ok(value) => {
                    debug!(epoch, %facet, "facet committed");
                    state.facets.apply(facet, value);
                }
                Err(e) => {
                    warn!(epoch, %facet, error = %e, "facet query failed; keeping previous value");
                    state.push_failure(FacetFailure {
                        epoch,
                        facet: Some(facet),
                        message: e.to_string(),
                    });
                }
            }
        }
        if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            info!(epoch, "refresh cycle settled");
            self.finish(epoch);
        }
    }
}

pub struct DashboardController {
    shared: Arc<Shared>,
    wake: mpsc::UnboundedSender<()>,
    scheduler: JoinHandle<()>,
}

impl DashboardController {
    /// Starts the scheduler and queues the first refresh. Must be called from
    /// within a tokio runtime.
    pub fn activate(
        store: Arc<dyn OccurrenceStore>,
        config: &DashboardConfig,
    ) -> Result<Self, DashboardError> {
        let calendar = config.calendar()?;
        let year = validate_year(
            config
                .year
                .unwrap_or_else(|| calendar.today(Utc::now()).year()),
        )?;
        let mut inputs = DashboardInputs::new(config.institution_id.clone(), year);
        inputs.weekday_mode = config.weekday_mode;

        let (status, _) = watch::channel(RefreshStatus {
            epoch: 0,
            phase: Phase::Idle,
            requested: 0,
            served: 0,
        });
        let shared = Arc::new(Shared {
            store,
            calendar,
            quiescence: config.quiescence(),
            inputs: Mutex::new(inputs),
            committed: Mutex::new(Committed::default()),
            latest_epoch: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            status,
        });
        let (wake, rx) = mpsc::unbounded_channel();
        let scheduler = tokio::spawn(run_scheduler(Arc::clone(&shared), rx));
        info!(
            institution = %config.institution_id,
            year,
            timezone = %config.timezone,
            "dashboard activated"
        );

        let controller = Self {
            shared,
            wake,
            scheduler,
        };
        controller.refresh();
        Ok(controller)
    }

    /// Stops scheduling; results still in flight are discarded.
    pub fn deactivate(self) {
        info!("dashboard deactivated");
    }

    /// Queues a refresh without changing inputs.
    pub fn refresh(&self) {
        let requested = self.shared.requests.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.status.send_modify(|s| s.requested = requested);
        if self.wake.send(()).is_err() {
            warn!("refresh scheduler is gone; request dropped");
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut DashboardInputs) -> bool) -> bool {
        let changed = {
            let mut inputs = lock(&self.shared.inputs);
            f(&mut inputs)
        };
        if changed {
            self.refresh();
        }
        changed
    }

    pub fn add_filter(&self, filter: Filter) -> bool {
        debug!(dimension = %filter.dimension(), label = %filter.label, "add filter");
        self.mutate(|i| i.filters.add(filter))
    }

    /// Parses a wire-level filter and adds it.
    pub fn add_filter_raw(&self, dimension: &str, value: &str, label: &str) -> Result<Filter, DashboardError> {
        let dimension: Dimension = dimension.parse()?;
        let filter = Filter::new(FilterValue::parse(dimension, value)?, label);
        self.add_filter(filter.clone());
        Ok(filter)
    }

    pub fn remove_filter(&self, dimension: Dimension) -> bool {
        self.mutate(|i| i.filters.remove(dimension))
    }

    pub fn clear_filters(&self) -> bool {
        self.mutate(|i| i.filters.clear())
    }

    pub fn has_active_filters(&self) -> bool {
        lock(&self.shared.inputs).filters.has_active()
    }

    pub fn filters(&self) -> FilterSet {
        lock(&self.shared.inputs).filters.clone()
    }

    pub fn inputs(&self) -> DashboardInputs {
        lock(&self.shared.inputs).clone()
    }

    pub fn set_year(&self, year: i32) -> Result<bool, DashboardError> {
        let year = validate_year(year)?;
        Ok(self.mutate(|i| std::mem::replace(&mut i.year, year) != year))
    }

    pub fn set_custom_range(&self, range: Option<DateRange>) -> bool {
        self.mutate(|i| std::mem::replace(&mut i.custom_range, range) != range)
    }

    pub fn set_weekday_mode(&self, mode: WeekdayMode) -> bool {
        self.mutate(|i| std::mem::replace(&mut i.weekday_mode, mode) != mode)
    }

    pub fn select_week(&self, week: Option<IsoWeek>) -> bool {
        self.mutate(|i| std::mem::replace(&mut i.selected_week, week) != week)
    }

    /// Maps a click on a chart element to a filter through the facet's most
    /// recently committed rows, then adds it.
    pub fn chart_click(&self, click: &ChartClick) -> Result<Filter, DashboardError> {
        let facet: Facet = click.facet.parse()?;
        let filter = {
            let state = lock(&self.shared.committed);
            let rows = state
                .facets
                .rows(facet)
                .ok_or_else(|| DashboardError::NotClickable(facet.to_string()))?;
            let row = find_clicked_row(rows, &click.label, click.index).ok_or_else(|| {
                DashboardError::UnknownChartLabel {
                    facet: facet.to_string(),
                    label: click.label.clone(),
                }
            })?;
            filter_for_row(facet, state.facets.weekday_mode, row)?
        };
        self.add_filter(filter.clone());
        Ok(filter)
    }

    pub fn status(&self) -> RefreshStatus {
        *self.shared.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RefreshStatus> {
        self.shared.status.subscribe()
    }

    /// Resolves once no refresh is queued or running. Never resolves while a
    /// facet of the latest cycle is still waiting on the store.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.shared.status.subscribe();
        let _ = rx.wait_for(|s| s.is_settled()).await;
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        let inputs = self.inputs();
        let state = lock(&self.shared.committed);
        DashboardSnapshot {
            status: self.status(),
            institution_id: inputs.institution_id.clone(),
            year: inputs.year,
            custom_range: inputs.custom_range,
            filters: inputs.filters.active().into_iter().cloned().collect(),
            weekday_mode: inputs.weekday_mode,
            selected_week: inputs.selected_week,
            window: state.window.clone(),
            facets: state.facets.clone(),
            failures: state.failures.clone(),
        }
    }
}

impl Drop for DashboardController {
    fn drop(&mut self) {
        self.scheduler.abort();
        self.shared.retire();
    }
}

fn find_clicked_row<'a>(rows: &'a [FacetRow], label: &str, index: Option<usize>) -> Option<&'a FacetRow> {
    index
        .and_then(|i| rows.get(i))
        .filter(|r| r.label == label)
        .or_else(|| rows.iter().find(|r| r.label == label))
}

fn filter_for_row(facet: Facet, weekday_mode: WeekdayMode, row: &FacetRow) -> Result<Filter, DashboardError> {
    let dimension = match facet {
        Facet::Class => Dimension::Class,
        Facet::Student => Dimension::Student,
        Facet::OccurrenceType => Dimension::OccurrenceType,
        Facet::Teacher => Dimension::Teacher,
        Facet::Shift => Dimension::Shift,
        Facet::EducationLevel => Dimension::EducationLevel,
        Facet::Monthly => Dimension::Month,
        Facet::Weekday => match weekday_mode {
            WeekdayMode::Average => Dimension::Weekday,
            WeekdayMode::Week | WeekdayMode::MonthDetail => Dimension::SpecificDate,
        },
        Facet::Kpi => return Err(DashboardError::NotClickable(facet.to_string())),
    };
    Ok(Filter::new(FilterValue::parse(dimension, &row.id)?, row.label.clone()))
}

async fn run_scheduler(shared: Arc<Shared>, mut wake: mpsc::UnboundedReceiver<()>) {
    while wake.recv().await.is_some() {
        loop {
            match tokio::time::timeout(shared.quiescence, wake.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        start_cycle(&shared);
    }
}

fn start_cycle(shared: &Arc<Shared>) {
    let served = shared.requests.load(Ordering::SeqCst);
    let inputs = lock(&shared.inputs).clone();
    let epoch = shared.mint_epoch();
    shared.status.send_modify(|s| {
        s.epoch = epoch;
        s.phase = Phase::Loading;
        s.served = s.served.max(served);
    });
    tokio::spawn(run_cycle(Arc::clone(shared), epoch, inputs));
}

async fn run_cycle(shared: Arc<Shared>, epoch: u64, inputs: DashboardInputs) {
    info!(
        epoch,
        year = inputs.year,
        filters = inputs.filters.active().len(),
        mode = ?inputs.weekday_mode,
        "refresh cycle started"
    );
    let today = shared.calendar.today(Utc::now());

    let year_classes = match shared.store.classes(&inputs.institution_id, inputs.year).await {
        Ok(classes) => classes,
        Err(e) => {
            warn!(epoch, error = %e, "class scope query failed; keeping previous facets");
            shared.record_scope_failure(epoch, e.to_string());
            shared.finish(epoch);
            return;
        }
    };
    if !shared.is_current(epoch) {
        debug!(epoch, "stale cycle dropped before fan-out");
        return;
    }

    let plan = Arc::new(plan::plan(&shared.calendar, &inputs, &year_classes, today));
    if year_classes.is_empty() {
        info!(epoch, year = inputs.year, "no classes in scope; facets reset");
        shared.reset(epoch, plan.window.clone(), inputs.weekday_mode);
        shared.finish(epoch);
        return;
    }
    if !shared.commit_window(epoch, plan.window.clone()) {
        return;
    }
    debug!(
        epoch,
        classes = plan.class_scope.len(),
        buckets = plan.window.buckets.len(),
        residual = ?plan.residual,
        "query plan ready"
    );

    let remaining = Arc::new(AtomicUsize::new(Facet::ALL.len()));
    for facet in Facet::ALL {
        let shared = Arc::clone(&shared);
        let plan = Arc::clone(&plan);
        let remaining = Arc::clone(&remaining);
        let institution_id = inputs.institution_id.clone();
        tokio::spawn(async move {
            let outcome = compute_facet(
                shared.store.as_ref(),
                &shared.calendar,
                &institution_id,
                facet,
                &plan,
            )
            .await;
            shared.complete_facet(epoch, facet, outcome, &remaining);
        });
    }
}

async fn fetch_filtered(
    store: &dyn OccurrenceStore,
    cal: &LocalCalendar,
    query: &OccurrenceQuery,
    residual_filter: Option<ResidualFilter>,
) -> StoreResult<Vec<Occurrence>> {
    let records = store.occurrences(query).await?;
    Ok(residual::apply(cal, residual_filter, records))
}

/// One facet of one cycle. Each facet issues its own store calls so facets
/// complete independently.
pub async fn compute_facet(
    store: &dyn OccurrenceStore,
    cal: &LocalCalendar,
    institution_id: &str,
    facet: Facet,
    plan: &QueryPlan,
) -> StoreResult<FacetValue> {
    let value = match facet {
        Facet::Class => {
            let records = fetch_filtered(store, cal, &plan.base, plan.residual).await?;
            FacetValue::Rows(aggregate::by_class(&records, &plan.class_scope))
        }
        Facet::Student => {
            let class_ids = plan.class_ids();
            let (records, students) = tokio::try_join!(
                fetch_filtered(store, cal, &plan.base, plan.residual),
                store.students(&class_ids)
            )?;
            FacetValue::Rows(aggregate::by_student(&records, &students))
        }
        Facet::OccurrenceType => {
            let (records, types) = tokio::try_join!(
                fetch_filtered(store, cal, &plan.base, plan.residual),
                store.occurrence_types(institution_id)
            )?;
            FacetValue::Rows(aggregate::by_occurrence_type(&records, &types))
        }
        Facet::Teacher => {
            let (records, teachers) = tokio::try_join!(
                fetch_filtered(store, cal, &plan.base, plan.residual),
                store.teachers(institution_id)
            )?;
            FacetValue::Rows(aggregate::by_teacher(&records, &teachers))
        }
        Facet::Shift => {
            let (records, shifts) = tokio::try_join!(
                fetch_filtered(store, cal, &plan.base, plan.residual),
                store.shifts()
            )?;
            FacetValue::Rows(aggregate::by_shift(&records, &plan.class_scope, &shifts))
        }
        Facet::EducationLevel => {
            let (records, levels) = tokio::try_join!(
                fetch_filtered(store, cal, &plan.base, plan.residual),
                store.education_levels()
            )?;
            FacetValue::Rows(aggregate::by_education_level(&records, &plan.class_scope, &levels))
        }
        Facet::Monthly => {
            // Full context: bucket counts ignore the month and calendar filters.
            let counts =
                futures::future::try_join_all(plan.monthly.iter().map(|q| store.count(q))).await?;
            FacetValue::Rows(aggregate::monthly_waterfall(&plan.window.buckets, &counts))
        }
        Facet::Weekday => {
            let records = fetch_filtered(store, cal, &plan.weekday.query, plan.residual).await?;
            let rows = match (plan.weekday.mode, plan.weekday.monday) {
                (WeekdayMode::Week, Some(monday)) => aggregate::weekday_week(cal, &records, monday),
                (WeekdayMode::Average, _) => aggregate::weekday_average(cal, &records),
                (WeekdayMode::MonthDetail, _) | (WeekdayMode::Week, None) => {
                    aggregate::weekday_month_detail(cal, &records)
                }
            };
            FacetValue::Weekday {
                mode: plan.weekday.mode,
                rows,
            }
        }
        Facet::Kpi => {
            let class_ids = plan.class_ids();
            let (records, students) = tokio::try_join!(
                fetch_filtered(store, cal, &plan.base, plan.residual),
                store.students(&class_ids)
            )?;
            FacetValue::Kpi(aggregate::kpi_summary(&records, &students))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, label: &str) -> FacetRow {
        FacetRow {
            label: label.into(),
            id: id.into(),
            count: 1,
            average: None,
            percent_change: None,
        }
    }

    #[test]
    fn clicked_row_prefers_index_when_label_matches() {
        let rows = vec![row("a", "Same"), row("b", "Same")];
        assert_eq!(find_clicked_row(&rows, "Same", Some(1)).map(|r| r.id.as_str()), Some("b"));
        assert_eq!(find_clicked_row(&rows, "Same", Some(7)).map(|r| r.id.as_str()), Some("a"));
        assert!(find_clicked_row(&rows, "Other", Some(0)).is_none());
    }

    #[test]
    fn weekday_rows_map_by_view_mode() {
        let f = filter_for_row(Facet::Weekday, WeekdayMode::Average, &row("2", "Tuesday")).unwrap();
        assert_eq!(f.value, FilterValue::Weekday(2));
        let f = filter_for_row(Facet::Weekday, WeekdayMode::MonthDetail, &row("2025-03-11", "11/03 Tuesday"))
            .unwrap();
        assert_eq!(f.dimension(), Dimension::SpecificDate);
        let f = filter_for_row(Facet::Monthly, WeekdayMode::Average, &row("2025-03", "Mar/2025")).unwrap();
        assert_eq!(f.dimension(), Dimension::Month);
        assert!(matches!(
            filter_for_row(Facet::Kpi, WeekdayMode::Average, &row("x", "x")),
            Err(DashboardError::NotClickable(_))
        ));
    }

    #[test]
    fn placeholder_rows_without_id_are_rejected() {
        assert!(matches!(
            filter_for_row(Facet::Shift, WeekdayMode::Average, &row("", aggregate::NO_SHIFT)),
            Err(DashboardError::InvalidFilterValue { .. })
        ));
    }

    #[test]
    fn settled_requires_idle_and_served() {
        let s = RefreshStatus {
            epoch: 3,
            phase: Phase::Idle,
            requested: 5,
            served: 4,
        };
        assert!(!s.is_settled());
        assert!(RefreshStatus { served: 5, ..s }.is_settled());
        assert!(!RefreshStatus { served: 5, phase: Phase::Loading, ..s }.is_settled());
    }
}
