//! Fakes and fixtures shared by the unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

use supercompose_director::authn::credentials::NodeCredentials;
use supercompose_director::errors::DirectorError;
use supercompose_director::models::{Compose, ComposeVersion, Deployment, Node, StoredSecret};
use supercompose_director::remote::connection::{Connector, LineStream, RawOutput, Session};
use supercompose_director::remote::docker::{ContainerInspect, ContainerSummary, PROJECT_LABEL};
use supercompose_director::remote::{CommandOutput, DockerEventStream, RemoteExecutor};
use supercompose_director::store::{FleetState, MemoryStore};

pub const COMPOSE_BINARY: &str = "/usr/bin/docker-compose";

// ================================ EXECUTOR ===================================== //

/// In-memory node: commands answer from a script, files live in a map
#[derive(Default)]
pub struct FakeExecutor {
    scripted: Mutex<Vec<(String, CommandOutput)>>,
    hanging: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    calls: Mutex<Vec<String>>,
    writes: AtomicUsize,
    containers: Mutex<Vec<serde_json::Value>>,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer commands starting with `prefix` with `exit_code`
    pub fn script(&self, prefix: &str, exit_code: i32, stderr: &str) {
        self.scripted.lock().unwrap().push((
            prefix.to_string(),
            CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code,
            },
        ));
    }

    /// Commands starting with `prefix` run past their timeout
    pub fn hang(&self, prefix: &str) {
        self.hanging.lock().unwrap().push(prefix.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Commands that change something on the node
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| {
                !c.ends_with("--version") && !c.starts_with("which ") && !c.starts_with("read ")
            })
            .collect()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn put_file(&self, path: &str, contents: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.as_bytes().to_vec());
    }

    pub fn set_containers(&self, containers: Vec<serde_json::Value>) {
        *self.containers.lock().unwrap() = containers;
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn test_connection(&self, _creds: &NodeCredentials) -> Result<(), DirectorError> {
        Ok(())
    }

    async fn run_command(
        &self,
        _creds: &NodeCredentials,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, DirectorError> {
        self.record(command.to_string());
        let hangs = self
            .hanging
            .lock()
            .unwrap()
            .iter()
            .any(|prefix| command.starts_with(prefix.as_str()));
        if hangs {
            return Err(DirectorError::CommandTimeout {
                command: command.to_string(),
                timeout,
            });
        }
        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone());
        if let Some(output) = scripted {
            return Ok(output);
        }
        if command == "which docker-compose" {
            return Ok(CommandOutput {
                stdout: format!("{}\n", COMPOSE_BINARY),
                ..Default::default()
            });
        }
        Ok(CommandOutput::default())
    }

    async fn read_file(
        &self,
        _creds: &NodeCredentials,
        path: &str,
    ) -> Result<Option<Vec<u8>>, DirectorError> {
        self.record(format!("read {}", path));
        Ok(self.files.lock().unwrap().get(path).cloned())
    }

    async fn write_file(
        &self,
        _creds: &NodeCredentials,
        path: &str,
        contents: &[u8],
        _create_parent_dirs: bool,
    ) -> Result<(), DirectorError> {
        self.record(format!("write {}", path));
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn delete_file(&self, _creds: &NodeCredentials, path: &str) -> Result<bool, DirectorError> {
        self.record(format!("delete {}", path));
        Ok(self.files.lock().unwrap().remove(path).is_some())
    }

    async fn list_containers(
        &self,
        _creds: &NodeCredentials,
    ) -> Result<Vec<ContainerSummary>, DirectorError> {
        let containers = self.containers.lock().unwrap().clone();
        Ok(containers
            .into_iter()
            .map(|raw| {
                let inspect = ContainerInspect::from_value(raw).unwrap();
                ContainerSummary {
                    id: inspect.id.clone(),
                    labels: inspect
                        .labels
                        .iter()
                        .filter(|(k, _)| k.as_str() == PROJECT_LABEL)
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                }
            })
            .collect())
    }

    async fn inspect_container(
        &self,
        _creds: &NodeCredentials,
        id: &str,
    ) -> Result<ContainerInspect, DirectorError> {
        let raw = self
            .containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c["Id"] == id)
            .cloned()
            .ok_or_else(|| DirectorError::ContainerInfo(format!("no such container {}", id)))?;
        ContainerInspect::from_value(raw)
    }

    async fn docker_events(&self, _creds: &NodeCredentials) -> Result<DockerEventStream, DirectorError> {
        Ok(stream::pending().boxed())
    }
}

/// `docker inspect` payload of a compose container
pub fn container_json(id: &str, project: &str, service: &str, number: u32, status: &str) -> serde_json::Value {
    json!({
        "Id": id,
        "Name": format!("/{}_{}_{}", project, service, number),
        "State": {
            "Status": status,
            "StartedAt": "2021-03-04T05:06:07Z",
            "FinishedAt": "0001-01-01T00:00:00Z"
        },
        "Config": {
            "Labels": {
                "com.docker.compose.project": project,
                "com.docker.compose.service": service,
                "com.docker.compose.container-number": number.to_string()
            }
        }
    })
}

// ================================= SESSIONS ==================================== //

/// Session that echoes commands and can be dropped from the outside
#[derive(Default)]
pub struct FakeSession {
    gone: Notify,
    executing: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    pub exec_delay: Duration,
}

impl FakeSession {
    pub fn drop_connection(&self) {
        self.gone.notify_waiters();
        self.gone.notify_one();
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn exec(
        &self,
        command: &str,
        _stdin: Option<Vec<u8>>,
        _timeout: Duration,
    ) -> Result<RawOutput, DirectorError> {
        let running = self.executing.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.exec_delay).await;
        self.executing.fetch_sub(1, Ordering::SeqCst);
        Ok(RawOutput {
            stdout: command.as_bytes().to_vec(),
            ..Default::default()
        })
    }

    async fn stream_lines(&self, _command: &str) -> Result<LineStream, DirectorError> {
        Ok(stream::empty().boxed())
    }

    async fn closed(&self) {
        self.gone.notified().await;
    }

    async fn close(&self) {}
}

/// Fails a scripted number of times, then hands out sessions
pub struct FakeConnector {
    failures_left: AtomicUsize,
    error: fn() -> DirectorError,
    pub attempts: AtomicUsize,
    pub sessions: Mutex<Vec<Arc<FakeSession>>>,
    exec_delay: Duration,
}

impl FakeConnector {
    pub fn new(failures: usize, error: fn() -> DirectorError) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(failures),
            error,
            attempts: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
            exec_delay: Duration::ZERO,
        })
    }

    pub fn with_exec_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(0),
            error: || DirectorError::Cancelled,
            attempts: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
            exec_delay: delay,
        })
    }

    pub fn last_session(&self) -> Arc<FakeSession> {
        self.sessions.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn Session>, DirectorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err((self.error)());
        }
        let session = Arc::new(FakeSession {
            exec_delay: self.exec_delay,
            ..Default::default()
        });
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

// ================================= FIXTURES ==================================== //

/// A store holding one node with one deployment
pub struct Fleet {
    pub store: Arc<MemoryStore>,
    pub node: Node,
    pub compose: Compose,
    pub deployment: Deployment,
}

impl Fleet {
    pub async fn new(service_enabled: bool, deployment_enabled: bool) -> Self {
        let store = Arc::new(MemoryStore::new(FleetState::default()));
        let node = node("node-1");
        store.insert_node(node.clone()).await;

        let (compose, version) = compose("web", service_enabled);
        store.insert_compose(compose.clone(), version).await.unwrap();
        let deployment = store
            .create_deployment(node.id, compose.id, deployment_enabled)
            .await
            .unwrap();

        Self {
            store,
            node,
            compose,
            deployment,
        }
    }

    pub async fn deployment(&self) -> Deployment {
        self.store.snapshot().await.deployments[&self.deployment.id].clone()
    }

    pub async fn node(&self) -> Node {
        self.store.snapshot().await.nodes[&self.node.id].clone()
    }

    pub async fn current_version(&self) -> ComposeVersion {
        let state = self.store.snapshot().await;
        let current = state.composes[&self.compose.id].current_id;
        state.compose_versions[&current].clone()
    }
}

pub fn node(name: &str) -> Node {
    Node {
        id: Uuid::new_v4(),
        tenant_id: None,
        name: name.to_string(),
        enabled: true,
        host: "10.0.0.1".to_string(),
        port: 22,
        username: "deploy".to_string(),
        password: Some(StoredSecret::new("secret")),
        private_key: None,
        version: Uuid::new_v4(),
        reconciliation_failed: false,
        redeployment_requested_at: None,
    }
}

pub fn compose(name: &str, service_enabled: bool) -> (Compose, ComposeVersion) {
    let version = ComposeVersion {
        id: Uuid::new_v4(),
        compose_id: Uuid::new_v4(),
        content: "services:\n  app:\n    image: nginx\n".to_string(),
        directory: format!("/srv/{}", name),
        service_name: name.to_string(),
        service_enabled,
        redeployment_requested_at: None,
    };
    let compose = Compose {
        id: version.compose_id,
        tenant_id: None,
        name: name.to_string(),
        current_id: version.id,
    };
    (compose, version)
}
