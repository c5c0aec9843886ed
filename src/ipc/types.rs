use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::controller::DashboardController;
use crate::db::SqliteStore;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub store: Option<Arc<SqliteStore>>,
    pub dashboard: Option<DashboardController>,
}
