//! Compose definitions and their immutable versions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named docker-compose definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compose {
    pub id: Uuid,

    #[serde(default)]
    pub tenant_id: Option<Uuid>,

    pub name: String,

    /// Version currently desired on every deployment of this compose
    pub current_id: Uuid,
}

/// Immutable snapshot of a compose definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeVersion {
    pub id: Uuid,

    pub compose_id: Uuid,

    /// Raw docker-compose.yml content
    pub content: String,

    /// Remote directory holding the compose file
    pub directory: String,

    /// Compose project name, also the systemd unit name
    pub service_name: String,

    /// Wrap the project in a systemd unit
    #[serde(default)]
    pub service_enabled: bool,

    #[serde(default)]
    pub redeployment_requested_at: Option<DateTime<Utc>>,
}

impl ComposeVersion {
    pub fn compose_path(&self) -> String {
        format!("{}/docker-compose.yml", self.directory.trim_end_matches('/'))
    }

    pub fn service_path(&self) -> String {
        format!("/etc/systemd/system/{}.service", self.service_name)
    }

    /// Unit id understood by systemctl
    pub fn service_unit(&self) -> String {
        format!("{}.service", self.service_name)
    }
}
