//! API models

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Audience every proxy token is minted for
pub const TOKEN_AUDIENCE: &str = "proxy";

/// Problem type reported when the proxy could not reach the SSH target
pub const PROBLEM_CONNECTION: &str = "connection_err";

/// Problem type reported when a remote operation failed
pub const PROBLEM_COMMAND: &str = "command_err";

/// Error value the proxy sets when a command exceeded its deadline
pub const COMMAND_TIMEOUT: &str = "command_timeout";

/// Claims of the per-call bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyClaims {
    /// SSH target as `host:port`
    pub host: String,

    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// PEM encoded private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkey: Option<String>,

    pub aud: String,

    /// Expiration timestamp
    pub exp: i64,
}

/// Result of `GET /command`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    #[serde(rename = "command", default)]
    pub command: String,

    #[serde(default)]
    pub stdout: String,

    #[serde(default)]
    pub stderr: String,

    #[serde(default)]
    pub code: Option<i32>,

    #[serde(default)]
    pub error: Option<String>,
}

impl CommandResult {
    /// Whether the proxy gave up waiting for the command
    pub fn timed_out(&self) -> bool {
        self.error.as_deref() == Some(COMMAND_TIMEOUT)
    }
}

/// Body of `POST /files/upsert`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertFileRequest {
    pub path: String,

    #[serde(with = "base64_bytes")]
    pub contents: Vec<u8>,

    #[serde(default)]
    pub create_folder: bool,
}

/// Result of `POST /files/upsert`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertFileResponse {
    pub updated: bool,
}

/// Result of `GET /files/read`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileResponse {
    #[serde(with = "base64_bytes")]
    pub contents: Vec<u8>,

    #[serde(default)]
    pub mod_time: Option<String>,

    #[serde(default)]
    pub size: u64,
}

/// Result of `POST /files/delete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFileResponse {
    pub deleted: bool,
}

/// RFC 7807 style problem body returned on failures
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProblemResponse {
    #[serde(default)]
    pub title: String,

    #[serde(rename = "type", default)]
    pub problem_type: Option<String>,

    #[serde(default)]
    pub detail: Option<String>,

    #[serde(default)]
    pub status: Option<u16>,

    /// Underlying error text, when the proxy attached one
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl ProblemResponse {
    /// Human readable cause, preferring the attached error over the detail
    pub fn cause(&self) -> String {
        match &self.error {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => self.detail.clone().unwrap_or_else(|| self.title.clone()),
        }
    }
}

/// Entry of `GET /docker/containers/json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerListEntry {
    #[serde(rename = "Id")]
    pub id: String,

    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
}

/// Serde helpers for byte payloads carried as standard base64 strings
pub mod base64_bytes {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
