//! Wire models for the supercompose SSH proxy agent.
//!
//! The proxy exposes command, file, systemd and docker endpoints for a single
//! remote host. Callers authenticate every request with a short-lived token whose
//! claims carry the SSH target and its credentials.

pub mod models;

pub use models::*;
