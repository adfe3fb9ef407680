pub mod api;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod core;
pub mod errors;
pub mod orchestrator;
pub mod provisioning;
pub mod store;
pub mod teardown;

// Re-exports
pub use api::routes::{create_router, AppState};
pub use config::Settings;
pub use errors::{RangeError, RangeResult};
pub use orchestrator::ContestOrchestrator;
