//! Container change events

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerChangeKind {
    Created,
    Changed,
    Removed,
}

/// Published after a container synchronization committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerChange {
    pub kind: ContainerChangeKind,
    pub container_id: Uuid,
    pub deployment_id: Uuid,
}

/// In-process fan-out of container changes
#[derive(Debug, Clone)]
pub struct ContainerEvents {
    tx: broadcast::Sender<ContainerChange>,
}

impl ContainerEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContainerChange> {
        self.tx.subscribe()
    }

    /// Publish changes in order. Having no subscriber is not an error.
    pub fn publish_all(&self, changes: Vec<ContainerChange>) {
        for change in changes {
            trace!("Publishing container change: {:?}", change);
            let _ = self.tx.send(change);
        }
    }
}

impl Default for ContainerEvents {
    fn default() -> Self {
        Self::new(1024)
    }
}
