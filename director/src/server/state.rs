//! Server state

use std::sync::Arc;

use crate::store::Store;
use crate::supervisor::Supervisor;
use crate::workers::notifications::NotificationSinks;

/// Server state shared across handlers
pub struct ServerState {
    pub store: Arc<dyn Store>,
    pub reconcile: Arc<Supervisor>,
    pub container_sync: Arc<Supervisor>,
    pub sinks: NotificationSinks,
}

impl ServerState {
    pub fn new(
        store: Arc<dyn Store>,
        reconcile: Arc<Supervisor>,
        container_sync: Arc<Supervisor>,
        sinks: NotificationSinks,
    ) -> Self {
        Self {
            store,
            reconcile,
            container_sync,
            sinks,
        }
    }
}
