pub mod aggregate;
pub mod calendar;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod filters;
pub mod ipc;
pub mod model;
pub mod plan;
pub mod residual;
pub mod store;
pub mod window;

pub use controller::{ChartClick, DashboardController, DashboardSnapshot, Phase, RefreshStatus};
pub use error::DashboardError;
pub use store::{OccurrenceQuery, OccurrenceStore, StoreError, StoreResult};
