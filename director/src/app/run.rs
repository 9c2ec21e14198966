//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::{AppState, NotificationReceivers};
use crate::errors::DirectorError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::store::Store;
use crate::workers::{notifications, poller};

/// Run the supercompose director
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DirectorError> {
    info!("Initializing supercompose director...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start director: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    // Shutdown
    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), DirectorError> {
    let (app_state, receivers) = AppState::init(options).await?;
    let app_state = Arc::new(app_state);
    shutdown_manager.with_app_state(app_state.clone())?;

    init_supervisors(app_state.clone(), receivers, shutdown_manager, &shutdown_tx).await?;

    if options.enable_socket_server {
        init_socket_server(
            options,
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    if options.enable_poller {
        init_poller_worker(
            options.poller.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    if options.enable_notifications {
        init_notification_worker(
            options.notifications.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    Ok(())
}

async fn init_supervisors(
    app_state: Arc<AppState>,
    receivers: NotificationReceivers,
    shutdown_manager: &mut ShutdownManager,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<(), DirectorError> {
    info!("Initializing node supervisors...");

    app_state.reconcile.start_all().await?;
    app_state.container_sync.start_all().await?;

    let listeners = [
        (app_state.reconcile.clone(), receivers.node_changed),
        (app_state.container_sync.clone(), receivers.node_info),
    ];
    for (supervisor, notifications) in listeners {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            supervisor
                .listen(
                    notifications,
                    Box::pin(async move {
                        let _ = shutdown_rx.recv().await;
                    }),
                )
                .await;
        });
        shutdown_manager.with_listener_handle(handle);
    }
    Ok(())
}

async fn init_poller_worker(
    options: poller::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DirectorError> {
    info!("Initializing poller worker...");

    let store: Arc<dyn Store> = app_state.store.clone();
    let supervisor = app_state.reconcile.clone();

    let poller_handle = tokio::spawn(async move {
        poller::run(
            &options,
            store.as_ref(),
            supervisor.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_poller_worker_handle(poller_handle)?;
    Ok(())
}

async fn init_notification_worker(
    options: notifications::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DirectorError> {
    info!("Initializing notification worker...");

    let sinks = app_state.sinks.clone();
    let events = app_state.events.clone();

    let notification_handle = tokio::spawn(async move {
        notifications::run(
            &options,
            &sinks,
            &events,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_notification_worker_handle(notification_handle)?;
    Ok(())
}

async fn init_socket_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DirectorError> {
    info!("Initializing local HTTP server...");

    let server_state = ServerState::new(
        app_state.store.clone(),
        app_state.reconcile.clone(),
        app_state.container_sync.clone(),
        app_state.sinks.clone(),
    );

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_socket_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    socket_server_handle: Option<JoinHandle<Result<(), DirectorError>>>,
    poller_worker_handle: Option<JoinHandle<()>>,
    notification_worker_handle: Option<JoinHandle<()>>,
    listener_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            socket_server_handle: None,
            poller_worker_handle: None,
            notification_worker_handle: None,
            listener_handles: Vec::new(),
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), DirectorError> {
        if self.app_state.is_some() {
            return Err(DirectorError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_listener_handle(&mut self, handle: JoinHandle<()>) {
        self.listener_handles.push(handle);
    }

    pub fn with_poller_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DirectorError> {
        if self.poller_worker_handle.is_some() {
            return Err(DirectorError::ShutdownError("poller_handle already set".to_string()));
        }
        self.poller_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_notification_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DirectorError> {
        if self.notification_worker_handle.is_some() {
            return Err(DirectorError::ShutdownError("notification_handle already set".to_string()));
        }
        self.notification_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_socket_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), DirectorError>>,
    ) -> Result<(), DirectorError> {
        if self.socket_server_handle.is_some() {
            return Err(DirectorError::ShutdownError("server_handle already set".to_string()));
        }
        self.socket_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), DirectorError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), DirectorError> {
        info!("Shutting down supercompose director...");

        // 1. Notification listeners, so no task gets restarted past this point
        for handle in self.listener_handles.drain(..) {
            handle.await.map_err(|e| DirectorError::ShutdownError(e.to_string()))?;
        }

        // 2. Poller worker
        if let Some(handle) = self.poller_worker_handle.take() {
            handle.await.map_err(|e| DirectorError::ShutdownError(e.to_string()))?;
        }

        // 3. Notification worker
        if let Some(handle) = self.notification_worker_handle.take() {
            handle.await.map_err(|e| DirectorError::ShutdownError(e.to_string()))?;
        }

        // 4. Socket server
        if let Some(handle) = self.socket_server_handle.take() {
            handle.await.map_err(|e| DirectorError::ShutdownError(e.to_string()))??;
        }

        // 5. Node tasks and the store
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
