//! Supercompose director
//!
//! Converges docker-compose deployments on a fleet of remote nodes and keeps
//! an observed view of their containers.

pub mod app;
pub mod authn;
pub mod cache;
pub mod containers;
pub mod context;
pub mod errors;
pub mod events;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod mqtt;
pub mod reconcile;
pub mod remote;
pub mod server;
pub mod storage;
pub mod store;
pub mod supervisor;
pub mod utils;
pub mod workers;
