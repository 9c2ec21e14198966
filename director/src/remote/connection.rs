//! Persistent per-node sessions
//!
//! A [`NodeConnectionManager`] keeps one session to its node alive for as long
//! as it runs: it connects with exponential backoff, reconnects right away when
//! an established session drops, and serializes every operation so that at most
//! one runs against the session at a time. Operations issued while the session
//! is (re)connecting wait for the next `Ready` transition.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{ConnectionErrorKind, DirectorError};
use crate::remote::session_fsm::{SessionEvent, SessionFsm, SessionState};
use crate::remote::CommandOutput;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Output lines of a long running remote command
pub type LineStream = BoxStream<'static, Result<String, DirectorError>>;

/// Raw result of a command run over a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl From<RawOutput> for CommandOutput {
    fn from(raw: RawOutput) -> Self {
        CommandOutput {
            stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
            exit_code: raw.exit_code,
        }
    }
}

/// An established session to a node
#[async_trait]
pub trait Session: Send + Sync {
    async fn exec(
        &self,
        command: &str,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<RawOutput, DirectorError>;

    /// Start a long running command and stream its stdout lines
    async fn stream_lines(&self, command: &str) -> Result<LineStream, DirectorError>;

    /// Resolves once the session is gone
    async fn closed(&self);

    async fn close(&self);
}

/// Opens sessions to one node
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Session>, DirectorError>;
}

/// Connection manager options
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Delay between failed connection attempts
    pub backoff: CooldownOptions,

    /// How long an operation waits for the session to become ready
    pub ready_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            backoff: CooldownOptions {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(600),
                multiplier: 2.0,
            },
            ready_timeout: Duration::from_secs(60),
        }
    }
}

/// Keeps one reconnecting session to a node
pub struct NodeConnectionManager {
    node_id: Uuid,
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    fsm: Mutex<SessionFsm>,
    last_error: Mutex<Option<(ConnectionErrorKind, String)>>,
    state_tx: watch::Sender<SessionState>,
    session: RwLock<Option<Arc<dyn Session>>>,
    op_lock: tokio::sync::Mutex<()>,
    running: CancellationToken,
    maintainer: Mutex<Option<JoinHandle<()>>>,
}

impl NodeConnectionManager {
    /// Create the manager and start maintaining its session
    pub fn start(
        node_id: Uuid,
        connector: Arc<dyn Connector>,
        options: ConnectionOptions,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Pending);
        let manager = Arc::new(Self {
            node_id,
            connector,
            options,
            fsm: Mutex::new(SessionFsm::new()),
            last_error: Mutex::new(None),
            state_tx,
            session: RwLock::new(None),
            op_lock: tokio::sync::Mutex::new(()),
            running: CancellationToken::new(),
            maintainer: Mutex::new(None),
        });

        let handle = tokio::spawn(manager.clone().maintain());
        *manager
            .maintainer
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        manager
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Run `op` against the session once it is ready.
    ///
    /// Calls are serialized: the next one starts after the previous returned.
    pub async fn with_session<T, F, Fut>(&self, op: F) -> Result<T, DirectorError>
    where
        F: FnOnce(Arc<dyn Session>) -> Fut + Send,
        Fut: Future<Output = Result<T, DirectorError>> + Send,
    {
        let _guard = self.op_lock.lock().await;
        let session = self.wait_ready().await?;

        self.transition(SessionEvent::Execute);
        let result = op(session).await;
        if self.state() == SessionState::Executing {
            self.transition(SessionEvent::Executed);
        }
        result
    }

    /// Stop reconnecting and close the session
    pub async fn stop(&self) {
        self.running.cancel();
        let handle = self
            .maintainer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn wait_ready(&self) -> Result<Arc<dyn Session>, DirectorError> {
        let mut rx = self.state_tx.subscribe();
        let deadline = tokio::time::sleep(self.options.ready_timeout);
        tokio::pin!(deadline);

        loop {
            if *rx.borrow_and_update() == SessionState::Ready {
                let session = self
                    .session
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(session) = session {
                    return Ok(session);
                }
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(DirectorError::Cancelled);
                    }
                }
                _ = self.running.cancelled() => return Err(DirectorError::Cancelled),
                _ = &mut deadline => return Err(self.not_ready_error()),
            }
        }
    }

    fn not_ready_error(&self) -> DirectorError {
        let last = self
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match last {
            Some((kind, message)) => DirectorError::connection(kind, message),
            None => DirectorError::connection(
                ConnectionErrorKind::Connection,
                format!(
                    "session to node {} not ready after {:?}",
                    self.node_id, self.options.ready_timeout
                ),
            ),
        }
    }

    fn transition(&self, event: SessionEvent) {
        let mut fsm = self.fsm.lock().unwrap_or_else(|e| e.into_inner());
        match fsm.process(event) {
            Ok(()) => {
                self.state_tx.send_replace(fsm.state());
            }
            Err(e) => debug!("Node {} session: {}", self.node_id, e),
        }
    }

    fn failures(&self) -> u32 {
        self.fsm
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .failures()
    }

    fn set_session(&self, session: Option<Arc<dyn Session>>) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = session;
    }

    async fn maintain(self: Arc<Self>) {
        while !self.running.is_cancelled() {
            self.transition(SessionEvent::Connect);

            let Some(session) = self.connect_with_backoff().await else {
                break;
            };

            self.set_session(Some(session.clone()));
            self.transition(SessionEvent::Connected);
            info!("Session to node {} is ready", self.node_id);

            tokio::select! {
                _ = session.closed() => {
                    warn!("Session to node {} closed unexpectedly, reconnecting", self.node_id);
                }
                _ = self.running.cancelled() => {
                    session.close().await;
                }
            }

            self.set_session(None);
            self.transition(SessionEvent::Closed);
        }

        self.transition(SessionEvent::Closed);
        debug!("Stopped maintaining session to node {}", self.node_id);
    }

    async fn connect_with_backoff(&self) -> Option<Arc<dyn Session>> {
        loop {
            let attempt = tokio::select! {
                result = self.connector.connect() => result,
                _ = self.running.cancelled() => return None,
            };

            match attempt {
                Ok(session) => {
                    *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
                    return Some(session);
                }
                Err(e) => {
                    let kind = e.connection_kind().unwrap_or(ConnectionErrorKind::Unknown);
                    *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some((kind, e.to_string()));

                    let delay = calc_exp_backoff(&self.options.backoff, self.failures());
                    self.transition(SessionEvent::ConnectFailed(e.to_string()));
                    warn!(
                        "Connecting to node {} failed: {}. Retrying in {:?}",
                        self.node_id, e, delay
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.running.cancelled() => return None,
                    }
                    self.transition(SessionEvent::Connect);
                }
            }
        }
    }
}

struct RegistryEntry {
    fingerprint: u64,
    manager: Arc<NodeConnectionManager>,
}

/// Connection managers keyed by node id
pub struct ConnectionRegistry {
    options: ConnectionOptions,
    managers: tokio::sync::Mutex<HashMap<Uuid, RegistryEntry>>,
}

impl ConnectionRegistry {
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            managers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Manager for `node_id`, replaced when the credentials fingerprint changed
    pub async fn manager_for<F>(
        &self,
        node_id: Uuid,
        fingerprint: u64,
        make_connector: F,
    ) -> Arc<NodeConnectionManager>
    where
        F: FnOnce() -> Arc<dyn Connector>,
    {
        let mut managers = self.managers.lock().await;
        if let Some(entry) = managers.get(&node_id) {
            if entry.fingerprint == fingerprint {
                return entry.manager.clone();
            }
        }

        let manager = NodeConnectionManager::start(node_id, make_connector(), self.options.clone());
        let previous = managers.insert(
            node_id,
            RegistryEntry {
                fingerprint,
                manager: manager.clone(),
            },
        );
        drop(managers);

        if let Some(previous) = previous {
            info!("Credentials of node {} changed, replacing its session", node_id);
            previous.manager.stop().await;
        }
        manager
    }

    pub async fn remove(&self, node_id: Uuid) {
        let entry = self.managers.lock().await.remove(&node_id);
        if let Some(entry) = entry {
            entry.manager.stop().await;
        }
    }

    pub async fn shutdown(&self) {
        let entries: Vec<RegistryEntry> = self.managers.lock().await.drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.manager.stop().await;
        }
    }
}
