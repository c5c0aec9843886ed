use crate::aggregate::WeekdayMode;
use crate::config::DashboardConfig;
use crate::controller::{ChartClick, DashboardController};
use crate::error::DashboardError;
use crate::filters::Dimension;
use crate::ipc::error::{dashboard_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::OccurrenceStore;
use crate::window::{DateRange, IsoWeek};
use chrono::NaiveDate;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_WAIT_MS: u64 = 10_000;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn required_i64(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn required_date(req: &Request, key: &str) -> Result<NaiveDate, serde_json::Value> {
    let raw = required_str(req, key)?;
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        err(
            &req.id,
            "bad_params",
            format!("{} must be YYYY-MM-DD", key),
            Some(json!({ "value": raw })),
        )
    })
}

fn dashboard<'a>(state: &'a AppState, req: &Request) -> Result<&'a DashboardController, serde_json::Value> {
    state
        .dashboard
        .as_ref()
        .ok_or_else(|| dashboard_err(&req.id, &DashboardError::Inactive))
}

fn changed(req: &Request, dashboard: &DashboardController, changed: bool) -> serde_json::Value {
    ok(
        &req.id,
        json!({ "changed": changed, "status": dashboard.status() }),
    )
}

fn handle_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let config = match DashboardConfig::from_params(&req.params) {
        Ok(v) => v,
        Err(e) => return dashboard_err(&req.id, &e),
    };
    if config.institution_id.trim().is_empty() {
        return err(&req.id, "bad_params", "missing institutionId", None);
    }

    if let Some(previous) = state.dashboard.take() {
        previous.deactivate();
    }
    let store: Arc<dyn OccurrenceStore> = store;
    match DashboardController::activate(store, &config) {
        Ok(dashboard) => {
            let result = json!({
                "institutionId": config.institution_id,
                "year": dashboard.inputs().year,
                "timezone": config.timezone,
                "quiescenceMs": config.quiescence_ms,
                "status": dashboard.status(),
            });
            state.dashboard = Some(dashboard);
            ok(&req.id, result)
        }
        Err(e) => dashboard_err(&req.id, &e),
    }
}

fn handle_deactivate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let was_active = match state.dashboard.take() {
        Some(dashboard) => {
            dashboard.deactivate();
            true
        }
        None => false,
    };
    ok(&req.id, json!({ "deactivated": was_active }))
}

fn handle_year_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let dashboard = match dashboard(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = match required_i64(req, "year") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Ok(year) = i32::try_from(year) else {
        return dashboard_err(&req.id, &DashboardError::InvalidYear(year));
    };
    match dashboard.set_year(year) {
        Ok(c) => changed(req, dashboard, c),
        Err(e) => dashboard_err(&req.id, &e),
    }
}

fn handle_range_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let dashboard = match dashboard(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start = match required_date(req, "start") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end = match required_date(req, "end") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match DateRange::new(start, end) {
        Ok(range) => changed(req, dashboard, dashboard.set_custom_range(Some(range))),
        Err(e) => dashboard_err(&req.id, &e),
    }
}

fn handle_range_clear(state: &mut AppState, req: &Request) -> serde_json::Value {
    match dashboard(state, req) {
        Ok(dashboard) => changed(req, dashboard, dashboard.set_custom_range(None)),
        Err(e) => e,
    }
}

fn handle_filters_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let dashboard = match dashboard(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let dimension = match required_str(req, "dimension") {
        Ok(v) => v,
        Err(e) => return e,
    };
    // Numbers are accepted for weekday values.
    let value = match req.params.get("value") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return err(&req.id, "bad_params", "missing value", None),
    };
    let label = req
        .params
        .get("label")
        .and_then(|v| v.as_str())
        .unwrap_or(&value)
        .to_string();

    match dashboard.add_filter_raw(&dimension, &value, &label) {
        Ok(filter) => ok(
            &req.id,
            json!({ "filter": filter, "status": dashboard.status() }),
        ),
        Err(e) => dashboard_err(&req.id, &e),
    }
}

fn handle_filters_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let dashboard = match dashboard(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let raw = match required_str(req, "dimension") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match raw.parse::<Dimension>() {
        Ok(dimension) => changed(req, dashboard, dashboard.remove_filter(dimension)),
        Err(e) => dashboard_err(&req.id, &e),
    }
}

fn handle_filters_clear(state: &mut AppState, req: &Request) -> serde_json::Value {
    match dashboard(state, req) {
        Ok(dashboard) => changed(req, dashboard, dashboard.clear_filters()),
        Err(e) => e,
    }
}

fn handle_filters_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let dashboard = match dashboard(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let filters = dashboard.filters();
    ok(
        &req.id,
        json!({
            "filters": filters.active(),
            "hasActive": filters.has_active(),
        }),
    )
}

fn handle_weekday_mode(state: &mut AppState, req: &Request) -> serde_json::Value {
    let dashboard = match dashboard(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let raw = match required_str(req, "mode") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match raw.parse::<WeekdayMode>() {
        Ok(mode) => changed(req, dashboard, dashboard.set_weekday_mode(mode)),
        Err(e) => dashboard_err(&req.id, &e),
    }
}

fn handle_week_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let dashboard = match dashboard(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    // Absent or null `week` returns to the default week.
    let week = match req.params.get("week").filter(|v| !v.is_null()) {
        None => None,
        Some(_) => {
            let year = match required_i64(req, "year") {
                Ok(v) => v,
                Err(e) => return e,
            };
            let week = match required_i64(req, "week") {
                Ok(v) => v,
                Err(e) => return e,
            };
            let (Ok(year), Ok(week)) = (i32::try_from(year), u32::try_from(week)) else {
                return err(&req.id, "bad_params", "week out of range", None);
            };
            match IsoWeek::new(year, week) {
                Ok(w) => Some(w),
                Err(e) => return dashboard_err(&req.id, &e),
            }
        }
    };
    changed(req, dashboard, dashboard.select_week(week))
}

fn handle_chart_click(state: &mut AppState, req: &Request) -> serde_json::Value {
    let dashboard = match dashboard(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let click: ChartClick = match serde_json::from_value(req.params.clone()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };
    match dashboard.chart_click(&click) {
        Ok(filter) => ok(
            &req.id,
            json!({ "filter": filter, "status": dashboard.status() }),
        ),
        Err(e) => dashboard_err(&req.id, &e),
    }
}

fn handle_snapshot(state: &mut AppState, req: &Request) -> serde_json::Value {
    match dashboard(state, req) {
        Ok(dashboard) => ok(&req.id, json!(dashboard.snapshot())),
        Err(e) => e,
    }
}

async fn handle_wait(state: &mut AppState, req: &Request) -> serde_json::Value {
    let dashboard = match dashboard(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let timeout_ms = req
        .params
        .get("timeoutMs")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_WAIT_MS);

    match tokio::time::timeout(Duration::from_millis(timeout_ms), dashboard.wait_until_idle()).await {
        Ok(()) => ok(&req.id, json!(dashboard.snapshot())),
        Err(_) => err(
            &req.id,
            "timeout",
            format!("dashboard still loading after {}ms", timeout_ms),
            Some(json!({ "status": dashboard.status() })),
        ),
    }
}

pub async fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "dashboard.activate" => handle_activate(state, req),
        "dashboard.deactivate" => handle_deactivate(state, req),
        "dashboard.year.set" => handle_year_set(state, req),
        "dashboard.range.set" => handle_range_set(state, req),
        "dashboard.range.clear" => handle_range_clear(state, req),
        "dashboard.filters.add" => handle_filters_add(state, req),
        "dashboard.filters.remove" => handle_filters_remove(state, req),
        "dashboard.filters.clear" => handle_filters_clear(state, req),
        "dashboard.filters.list" => handle_filters_list(state, req),
        "dashboard.weekday.mode" => handle_weekday_mode(state, req),
        "dashboard.week.select" => handle_week_select(state, req),
        "dashboard.chart.click" => handle_chart_click(state, req),
        "dashboard.snapshot" => handle_snapshot(state, req),
        "dashboard.wait" => handle_wait(state, req).await,
        _ => return None,
    };
    Some(resp)
}
