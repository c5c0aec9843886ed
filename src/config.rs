use serde::Deserialize;
use std::time::Duration;

use crate::aggregate::WeekdayMode;
use crate::calendar::LocalCalendar;
use crate::error::DashboardError;
use crate::window::validate_year;

const ENV_TIMEZONE: &str = "OCCURRENCED_TZ";
const ENV_QUIESCENCE_MS: &str = "OCCURRENCED_QUIESCENCE_MS";
pub const ENV_LOG: &str = "OCCURRENCED_LOG";

pub const DEFAULT_TIMEZONE: &str = "America/Sao_Paulo";
pub const DEFAULT_QUIESCENCE_MS: u64 = 250;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DashboardConfig {
    pub institution_id: String,
    pub timezone: String,
    pub quiescence_ms: u64,
    /// Initial selected year; the current local year when absent.
    pub year: Option<i32>,
    pub weekday_mode: WeekdayMode,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            institution_id: String::new(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            quiescence_ms: DEFAULT_QUIESCENCE_MS,
            year: None,
            weekday_mode: WeekdayMode::default(),
        }
    }
}

impl DashboardConfig {
    pub fn for_institution(institution_id: impl Into<String>) -> Self {
        let mut cfg = Self::default();
        apply_env_defaults(&mut cfg);
        cfg.institution_id = institution_id.into();
        cfg
    }

    /// Environment defaults first, then explicit `params` fields on top.
    pub fn from_params(params: &serde_json::Value) -> Result<Self, DashboardError> {
        let mut base = serde_json::to_value(EnvDefaults::load())
            .map_err(|e| DashboardError::InvalidConfig(e.to_string()))?;
        if let (Some(base_obj), Some(overrides)) = (base.as_object_mut(), params.as_object()) {
            for (k, v) in overrides {
                if !v.is_null() {
                    base_obj.insert(k.clone(), v.clone());
                }
            }
        }
        let cfg: Self =
            serde_json::from_value(base).map_err(|e| DashboardError::InvalidConfig(e.to_string()))?;
        if let Some(year) = cfg.year {
            validate_year(year)?;
        }
        Ok(cfg)
    }

    pub fn calendar(&self) -> Result<LocalCalendar, DashboardError> {
        LocalCalendar::parse(&self.timezone)
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvDefaults {
    timezone: String,
    quiescence_ms: u64,
}

impl EnvDefaults {
    fn load() -> Self {
        let mut cfg = DashboardConfig::default();
        apply_env_defaults(&mut cfg);
        Self {
            timezone: cfg.timezone,
            quiescence_ms: cfg.quiescence_ms,
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn apply_env_defaults(cfg: &mut DashboardConfig) {
    if let Some(tz) = env_value(ENV_TIMEZONE) {
        cfg.timezone = tz;
    }
    if let Some(ms) = env_value(ENV_QUIESCENCE_MS).and_then(|v| v.parse::<u64>().ok()) {
        cfg.quiescence_ms = ms;
    }
}
