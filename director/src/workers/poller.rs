//! Polling worker for time based reconciliation
//!
//! Notifications cover every operator action, but a deployment also goes
//! stale after an hour without a check. The poller catches those.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::errors::DirectorError;
use crate::reconcile::needs_update;
use crate::store::Store;
use crate::supervisor::Supervisor;

/// Poller worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Polling interval
    pub interval: Duration,

    /// Initial delay before first poll
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            initial_delay: Duration::from_secs(5),
        }
    }
}

/// Start the reconcile task of every enabled node with pending work.
/// Returns how many nodes had pending work.
pub async fn poll_once(store: &dyn Store, supervisor: &Supervisor) -> Result<usize, DirectorError> {
    let now = Utc::now();
    let mut pending = 0;
    for node in store.enabled_nodes().await? {
        if node.reconciliation_failed {
            continue;
        }
        let deployments = store.node_deployments(node.id).await?;
        if deployments.iter().any(|s| needs_update(s, now)) {
            debug!("Node {} has pending deployments", node.id);
            supervisor.ensure_running(node.id).await;
            pending += 1;
        }
    }
    Ok(pending)
}

/// Run the poller worker
pub async fn run<S, F>(
    options: &Options,
    store: &dyn Store,
    supervisor: &Supervisor,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Poller worker starting...");

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Poller worker shutting down...");
            return;
        }
        _ = sleep_fn(options.initial_delay) => {}
    }

    loop {
        debug!("Polling for stale deployments...");
        match poll_once(store, supervisor).await {
            Ok(0) => {}
            Ok(pending) => info!("{} nodes have pending deployments", pending),
            Err(e) => error!("Poll failed: {}", e),
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Poller worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}
