//! Deployments bind one compose to one node

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Compose, ComposeVersion, Node};

/// The unit of convergence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,

    pub node_id: Uuid,

    pub compose_id: Uuid,

    pub enabled: bool,

    #[serde(default)]
    pub last_deployed_compose_version_id: Option<Uuid>,

    #[serde(default)]
    pub last_deployed_node_version: Option<Uuid>,

    #[serde(default)]
    pub last_deployed_as_enabled: Option<bool>,

    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,

    #[serde(default)]
    pub reconciliation_failed: bool,

    #[serde(default)]
    pub redeployment_requested_at: Option<DateTime<Utc>>,
}

/// Read-only view of a deployment with everything reconciliation needs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentSnapshot {
    pub deployment: Deployment,
    pub node: Node,
    pub compose: Compose,
    pub current: ComposeVersion,
    pub last_deployed: Option<ComposeVersion>,
}

/// Outcome persisted after a deployment converged
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedDeployment {
    pub deployment_id: Uuid,
    pub compose_version_id: Uuid,
    pub node_version: Uuid,
    pub as_enabled: bool,
    pub checked_at: DateTime<Utc>,
}
