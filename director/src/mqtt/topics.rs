//! MQTT topic definitions

use uuid::Uuid;

/// Node settings or deployments changed; payload is the bare node id
pub const NODE_CHANGED: &str = "supercompose/node_changed";

/// Container information of a node was requested; payload is the bare node id
pub const NODE_INFO: &str = "supercompose/node_info";

/// JSON encoded container change events
pub const CONTAINER_CHANGED: &str = "supercompose/container_changed";

/// An incoming node notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    NodeChanged(Uuid),
    NodeInfo(Uuid),
}

impl Notification {
    /// Decode a message received on a notification topic
    pub fn parse(topic: &str, payload: &[u8]) -> Option<Self> {
        let node_id = std::str::from_utf8(payload).ok()?.trim();
        let node_id = Uuid::parse_str(node_id.trim_matches('"')).ok()?;
        match topic {
            NODE_CHANGED => Some(Notification::NodeChanged(node_id)),
            NODE_INFO => Some(Notification::NodeInfo(node_id)),
            _ => None,
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            Notification::NodeChanged(_) => NODE_CHANGED,
            Notification::NodeInfo(_) => NODE_INFO,
        }
    }

    pub fn node_id(&self) -> Uuid {
        match self {
            Notification::NodeChanged(id) | Notification::NodeInfo(id) => *id,
        }
    }
}
