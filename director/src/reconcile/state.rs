//! Desired vs. last applied deployment state
//!
//! Pure functions over a [`DeploymentSnapshot`]. `needs_update` is the
//! termination condition of the node loop and is re-evaluated on every pass.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::DeploymentSnapshot;

/// Age after which an applied deployment is checked again
pub fn recheck_interval() -> Duration {
    Duration::hours(1)
}

/// Whether a deployment should run and through which mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MechanismState {
    pub enabled: bool,
    pub use_service: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeploymentState {
    pub target: MechanismState,
    pub last: MechanismState,
}

impl DeploymentState {
    pub fn calculate(snapshot: &DeploymentSnapshot) -> Self {
        let deployment = &snapshot.deployment;
        Self {
            target: MechanismState {
                enabled: deployment.enabled && snapshot.node.enabled,
                use_service: snapshot.current.service_enabled,
            },
            last: MechanismState {
                enabled: deployment.last_deployed_as_enabled.unwrap_or(false),
                use_service: snapshot
                    .last_deployed
                    .as_ref()
                    .map(|v| v.service_enabled)
                    .unwrap_or(false),
            },
        }
    }
}

/// A redeploy was requested on the deployment, its node or its last applied
/// version after the last check
pub fn redeploy_requested(snapshot: &DeploymentSnapshot) -> bool {
    let last_check = snapshot.deployment.last_check;
    [
        snapshot.deployment.redeployment_requested_at,
        snapshot.node.redeployment_requested_at,
        snapshot
            .last_deployed
            .as_ref()
            .and_then(|v| v.redeployment_requested_at),
    ]
    .into_iter()
    .flatten()
    .any(|requested| is_newer(requested, last_check))
}

/// Whether the deployment has drifted and is not latched failed
pub fn needs_update(snapshot: &DeploymentSnapshot, now: DateTime<Utc>) -> bool {
    let deployment = &snapshot.deployment;
    if deployment.reconciliation_failed {
        return false;
    }

    let target_enabled = deployment.enabled && snapshot.node.enabled;
    if Some(target_enabled) != deployment.last_deployed_as_enabled {
        return true;
    }

    deployment.enabled
        && (Some(snapshot.node.version) != deployment.last_deployed_node_version
            || Some(snapshot.compose.current_id) != deployment.last_deployed_compose_version_id
            || is_stale(deployment.last_check, now)
            || redeploy_requested(snapshot))
}

/// A missing last check is older than any instant
fn is_newer(instant: DateTime<Utc>, last_check: Option<DateTime<Utc>>) -> bool {
    match last_check {
        Some(last_check) => instant > last_check,
        None => true,
    }
}

fn is_stale(last_check: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_check {
        Some(last_check) => last_check + recheck_interval() < now,
        None => true,
    }
}
