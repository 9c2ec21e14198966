//! Observed runtime containers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DirectorError;

/// Runtime state of a container as reported by docker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl ContainerState {
    /// Map docker's lowercase status string.
    ///
    /// Unknown statuses are an error rather than silently ignored.
    pub fn from_docker_status(status: &str) -> Result<Self, DirectorError> {
        match status {
            "created" => Ok(ContainerState::Created),
            "running" => Ok(ContainerState::Running),
            "paused" => Ok(ContainerState::Paused),
            "restarting" => Ok(ContainerState::Restarting),
            "removing" => Ok(ContainerState::Removing),
            "exited" => Ok(ContainerState::Exited),
            "dead" => Ok(ContainerState::Dead),
            other => Err(DirectorError::UnknownContainerState(other.to_string())),
        }
    }
}

/// Parse a docker timestamp, treating anything at or before the epoch as unset
pub fn parse_docker_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value?.trim()).ok()?.with_timezone(&Utc);
    if parsed <= DateTime::<Utc>::UNIX_EPOCH {
        None
    } else {
        Some(parsed)
    }
}

/// Observed container row, keyed by (deployment, service, container number)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub service_name: String,
    pub container_number: u32,
    pub container_name: String,
    pub state: ContainerState,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub last_inspect_at: DateTime<Utc>,
    #[serde(default)]
    pub last_inspect: serde_json::Value,
}

impl Container {
    /// Whether anything an operator would notice differs from `other`
    pub fn differs_observably(&self, other: &Container) -> bool {
        self.container_name != other.container_name
            || self.state != other.state
            || self.started_at != other.started_at
            || self.finished_at != other.finished_at
    }
}
