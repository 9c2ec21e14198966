//! Application state management

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::app::options::{AppOptions, ExecutorOptions, LeaseOptions};
use crate::authn::credentials::{CredentialProvider, StoredCredentialProvider};
use crate::authn::proxy_token::ProxyTokenMinter;
use crate::containers::ContainerStateSynchronizer;
use crate::errors::DirectorError;
use crate::events::ContainerEvents;
use crate::filesys::file::File;
use crate::reconcile::ReconciliationEngine;
use crate::remote::proxy::ProxyExecutor;
use crate::remote::ssh::SshExecutor;
use crate::remote::RemoteExecutor;
use crate::store::{MemoryStore, Store};
use crate::supervisor::{
    ContainerSyncWorkload, LeaseProvider, LocalLeaseProvider, ReconcileWorkload, RedisLeaseProvider,
    Supervisor,
};
use crate::workers::notifications::NotificationSinks;

const NOTIFICATION_CAPACITY: usize = 256;

/// Receiving ends of the notification channels, consumed by the supervisors
pub struct NotificationReceivers {
    pub node_changed: mpsc::Receiver<Uuid>,
    pub node_info: mpsc::Receiver<Uuid>,
}

/// Main application state
pub struct AppState {
    pub store: Arc<MemoryStore>,

    pub executor: Arc<dyn RemoteExecutor>,

    pub events: ContainerEvents,

    /// Drives deployments, restarted on "node changed"
    pub reconcile: Arc<Supervisor>,

    /// Follows docker events, restarted on "node info requested"
    pub container_sync: Arc<Supervisor>,

    pub sinks: NotificationSinks,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<(Self, NotificationReceivers), DirectorError> {
        info!("Initializing application state...");

        let store = Arc::new(MemoryStore::load(File::new(&options.state_file)).await?);
        let executor = build_executor(&options.executor)?;
        let leases = build_lease_provider(&options.lease).await?;
        let credentials: Arc<dyn CredentialProvider> = Arc::new(StoredCredentialProvider);
        let events = ContainerEvents::default();
        let dyn_store: Arc<dyn Store> = store.clone();

        let engine = Arc::new(ReconciliationEngine::new(
            dyn_store.clone(),
            executor.clone(),
            credentials.clone(),
            options.engine.clone(),
        ));
        let synchronizer = Arc::new(ContainerStateSynchronizer::new(
            dyn_store.clone(),
            executor.clone(),
            credentials,
            events.clone(),
        ));

        let reconcile = Arc::new(Supervisor::new(
            Arc::new(ReconcileWorkload::new(engine)),
            dyn_store.clone(),
            leases.clone(),
            options.supervisor.clone(),
        ));
        let container_sync = Arc::new(Supervisor::new(
            Arc::new(ContainerSyncWorkload::new(synchronizer)),
            dyn_store,
            leases,
            options.supervisor.clone(),
        ));

        let (changed_tx, changed_rx) = mpsc::channel(NOTIFICATION_CAPACITY);
        let (info_tx, info_rx) = mpsc::channel(NOTIFICATION_CAPACITY);

        let state = Self {
            store,
            executor,
            events,
            reconcile,
            container_sync,
            sinks: NotificationSinks {
                node_changed: changed_tx,
                node_info: info_tx,
            },
        };
        let receivers = NotificationReceivers {
            node_changed: changed_rx,
            node_info: info_rx,
        };

        Ok((state, receivers))
    }

    /// Stop every node task, release transports and persist the store
    pub async fn shutdown(&self) -> Result<(), DirectorError> {
        info!("Shutting down application state...");
        self.reconcile.shutdown().await;
        self.container_sync.shutdown().await;
        self.executor.shutdown().await;
        self.store.save().await
    }
}

fn build_executor(options: &ExecutorOptions) -> Result<Arc<dyn RemoteExecutor>, DirectorError> {
    match options {
        ExecutorOptions::Ssh { ssh, connection } => {
            info!("Using the OpenSSH backend");
            Ok(Arc::new(SshExecutor::new(ssh.clone(), connection.clone())))
        }
        ExecutorOptions::Proxy {
            base_url,
            token_secret,
        } => {
            info!("Using the SSH proxy backend at {}", base_url);
            let minter = ProxyTokenMinter::new(token_secret.clone());
            Ok(Arc::new(ProxyExecutor::new(base_url, minter)?))
        }
    }
}

async fn build_lease_provider(options: &LeaseOptions) -> Result<Arc<dyn LeaseProvider>, DirectorError> {
    match options {
        LeaseOptions::Local => {
            info!("Using in-process node leases");
            Ok(Arc::new(LocalLeaseProvider::new()))
        }
        LeaseOptions::Redis { url } => Ok(Arc::new(RedisLeaseProvider::new(url).await?)),
    }
}
