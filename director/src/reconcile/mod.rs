//! Deployment reconciliation

pub mod engine;
pub mod state;
pub mod systemd;

pub use engine::{EngineOptions, ReconciliationEngine};
pub use state::{needs_update, redeploy_requested, DeploymentState};
