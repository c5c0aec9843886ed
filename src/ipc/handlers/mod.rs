pub mod core;
pub mod dashboard;
