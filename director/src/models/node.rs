//! Managed remote hosts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Credential material as kept by the persistence layer.
///
/// Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoredSecret(String);

impl StoredSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for StoredSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoredSecret([REDACTED])")
    }
}

/// A managed remote host reachable over SSH
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,

    #[serde(default)]
    pub tenant_id: Option<Uuid>,

    pub name: String,

    pub enabled: bool,

    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub username: String,

    #[serde(default)]
    pub password: Option<StoredSecret>,

    #[serde(default)]
    pub private_key: Option<StoredSecret>,

    /// Opaque token bumped on every configuration change
    pub version: Uuid,

    #[serde(default)]
    pub reconciliation_failed: bool,

    #[serde(default)]
    pub redeployment_requested_at: Option<DateTime<Utc>>,
}

fn default_ssh_port() -> u16 {
    22
}
