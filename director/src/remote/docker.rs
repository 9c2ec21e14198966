//! Docker payloads shared by both transports

use std::collections::HashMap;

use serde::Deserialize;

use crate::errors::DirectorError;

pub const PROJECT_LABEL: &str = "com.docker.compose.project";
pub const SERVICE_LABEL: &str = "com.docker.compose.service";
pub const CONTAINER_NUMBER_LABEL: &str = "com.docker.compose.container-number";

/// Container event actions that can change what the synchronizer records
pub const RELEVANT_ACTIONS: [&str; 13] = [
    "create", "destroy", "die", "kill", "oom", "pause", "rename", "resize", "restart", "start",
    "stop", "unpause", "update",
];

pub const LIST_CONTAINERS_COMMAND: &str =
    "docker container ls --all --format='{{json .}}' --filter='label=com.docker.compose.project'";

pub const EVENTS_COMMAND: &str = "docker events --filter='label=com.docker.compose.project' --filter='type=container' --format='{{json .}}'";

/// Entry of a container listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub labels: HashMap<String, String>,
}

impl ContainerSummary {
    pub fn project(&self) -> Option<&str> {
        self.labels.get(PROJECT_LABEL).map(String::as_str)
    }

    /// Parse one line of `docker container ls --format '{{json .}}'`
    pub fn from_cli_json(line: &str) -> Result<Self, DirectorError> {
        #[derive(Deserialize)]
        struct CliEntry {
            #[serde(rename = "ID")]
            id: String,
            #[serde(rename = "Labels", default)]
            labels: String,
        }

        let entry: CliEntry = serde_json::from_str(line)
            .map_err(|e| DirectorError::ContainerInfo(format!("Bad container listing: {}", e)))?;
        Ok(Self {
            id: entry.id,
            labels: parse_label_string(&entry.labels),
        })
    }
}

/// Parse docker's comma separated `key=value` label list
pub fn parse_label_string(labels: &str) -> HashMap<String, String> {
    labels
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

/// The parts of `docker inspect` the synchronizer uses, plus the raw payload
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    pub status: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub labels: HashMap<String, String>,
    pub raw: serde_json::Value,
}

impl ContainerInspect {
    pub fn from_value(raw: serde_json::Value) -> Result<Self, DirectorError> {
        let text = |v: &serde_json::Value| v.as_str().map(str::to_string);

        let id = text(&raw["Id"])
            .ok_or_else(|| DirectorError::ContainerInfo("inspect payload has no Id".to_string()))?;
        let status = text(&raw["State"]["Status"]).ok_or_else(|| {
            DirectorError::ContainerInfo(format!("inspect payload of {} has no State.Status", id))
        })?;
        let name = text(&raw["Name"])
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        let labels = raw["Config"]["Labels"]
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            id,
            name,
            status,
            started_at: text(&raw["State"]["StartedAt"]),
            finished_at: text(&raw["State"]["FinishedAt"]),
            labels,
            raw,
        })
    }

    pub fn from_json(line: &str) -> Result<Self, DirectorError> {
        let raw = serde_json::from_str(line)
            .map_err(|e| DirectorError::ContainerInfo(format!("Bad inspect payload: {}", e)))?;
        Self::from_value(raw)
    }

    pub fn project(&self) -> Option<&str> {
        self.labels.get(PROJECT_LABEL).map(String::as_str)
    }

    pub fn service(&self) -> Option<&str> {
        self.labels.get(SERVICE_LABEL).map(String::as_str)
    }

    pub fn container_number(&self) -> Option<u32> {
        self.labels.get(CONTAINER_NUMBER_LABEL)?.trim().parse().ok()
    }
}

/// A parsed docker event record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerEvent {
    pub action: String,
    pub attributes: HashMap<String, String>,
    pub time_nano: Option<i64>,
}

impl DockerEvent {
    pub fn from_json(line: &str) -> Result<Self, DirectorError> {
        #[derive(Deserialize)]
        struct Actor {
            #[serde(rename = "Attributes", default)]
            attributes: HashMap<String, String>,
        }

        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "Action", default)]
            action: String,
            #[serde(rename = "Actor")]
            actor: Option<Actor>,
            #[serde(rename = "timeNano")]
            time_nano: Option<i64>,
        }

        let raw: Raw = serde_json::from_str(line)
            .map_err(|e| DirectorError::ContainerInfo(format!("Bad docker event: {}", e)))?;
        Ok(Self {
            action: raw.action,
            attributes: raw.actor.map(|a| a.attributes).unwrap_or_default(),
            time_nano: raw.time_nano,
        })
    }

    /// `(project, service)` if the event can change recorded container state
    pub fn relevant_target(&self) -> Option<(String, String)> {
        // actions like "exec_start: sh -c ..." carry arguments after a colon
        let action = self.action.split(':').next().unwrap_or_default().trim();
        if !RELEVANT_ACTIONS.contains(&action) {
            return None;
        }
        let project = self.attributes.get(PROJECT_LABEL)?;
        let service = self.attributes.get(SERVICE_LABEL)?;
        Some((project.clone(), service.clone()))
    }
}
