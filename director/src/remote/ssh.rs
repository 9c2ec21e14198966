//! Direct SSH backend
//!
//! Drives the system OpenSSH client. Every node gets one ControlMaster process
//! kept alive by a [`NodeConnectionManager`]; commands are multiplexed over its
//! control socket, one at a time.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authn::credentials::NodeCredentials;
use crate::errors::{ConnectionErrorKind, DirectorError};
use crate::filesys::dir::Dir;
use crate::remote::connection::{
    ConnectionOptions, ConnectionRegistry, Connector, LineStream, NodeConnectionManager, RawOutput,
    Session,
};
use crate::remote::docker::{
    ContainerInspect, ContainerSummary, DockerEvent, EVENTS_COMMAND, LIST_CONTAINERS_COMMAND,
};
use crate::remote::{
    classify_connection_message, shell_quote, CommandOutput, DockerEventStream, RemoteExecutor,
    CONNECTION_TEST_TIMEOUT,
};

/// Environment variable the askpass helper reads the password from
const PASSWORD_ENV: &str = "SUPERCOMPOSE_SSH_PASSWORD";

const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$SUPERCOMPOSE_SSH_PASSWORD\"\n";

/// OpenSSH exit status for connection level failures
const SSH_ERROR_EXIT: i32 = 255;

/// SSH backend options
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// ssh client binary
    pub binary: String,

    /// ssh-keygen binary, used to validate private keys
    pub keygen_binary: String,

    /// Directory holding control sockets, key files and known hosts
    pub control_dir: PathBuf,

    pub connect_timeout: Duration,

    pub command_timeout: Duration,

    /// Value of the StrictHostKeyChecking option
    pub strict_host_key_checking: String,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            keygen_binary: "ssh-keygen".to_string(),
            control_dir: PathBuf::from("/etc/supercompose/ssh"),
            connect_timeout: CONNECTION_TEST_TIMEOUT,
            command_timeout: Duration::from_secs(10),
            strict_host_key_checking: "accept-new".to_string(),
        }
    }
}

/// Files backing one master connection
struct SessionFiles {
    dir: PathBuf,
    control: PathBuf,
    identity: Option<PathBuf>,
    askpass: Option<PathBuf>,
}

/// Opens ControlMaster sessions to one node
pub struct OpenSshConnector {
    creds: NodeCredentials,
    options: Arc<SshOptions>,
    session_name: String,
}

impl OpenSshConnector {
    pub fn new(creds: NodeCredentials, options: Arc<SshOptions>) -> Self {
        let session_name = creds.node_id.to_string();
        Self {
            creds,
            options,
            session_name,
        }
    }

    /// Use a separate session directory, so probes never share the live socket
    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = name.into();
        self
    }

    async fn resolve(&self) -> Result<(), DirectorError> {
        let target = (self.creds.host.as_str(), self.creds.port);
        let lookup = tokio::time::timeout(self.options.connect_timeout, tokio::net::lookup_host(target));
        match lookup.await {
            Ok(Ok(mut addrs)) => {
                if addrs.next().is_some() {
                    Ok(())
                } else {
                    Err(DirectorError::connection(
                        ConnectionErrorKind::Dns,
                        format!("{} resolved to no addresses", self.creds.host),
                    ))
                }
            }
            Ok(Err(e)) => Err(DirectorError::connection_with(
                ConnectionErrorKind::Dns,
                format!("could not resolve {}", self.creds.host),
                e,
            )),
            Err(_) => Err(DirectorError::connection(
                ConnectionErrorKind::Dns,
                format!("resolving {} timed out", self.creds.host),
            )),
        }
    }

    async fn prepare_files(&self) -> Result<SessionFiles, DirectorError> {
        let dir = Dir::new(self.options.control_dir.join(&self.session_name));
        dir.create_private().await?;

        let control = dir.path().join("ctl");
        // a master that died uncleanly leaves its socket behind
        let _ = tokio::fs::remove_file(&control).await;

        let identity = match self.creds.private_key() {
            Some(key) => {
                let file = dir.file("id");
                let mut contents = key.replace("\r\n", "\n");
                if !contents.ends_with('\n') {
                    contents.push('\n');
                }
                file.write_bytes(contents.as_bytes()).await?;
                file.set_permissions_600().await?;
                self.check_private_key(file.path()).await?;
                Some(file.path().to_path_buf())
            }
            None => None,
        };

        let askpass = match self.creds.password() {
            Some(_) => {
                let file = dir.file("askpass");
                file.write_bytes(ASKPASS_SCRIPT.as_bytes()).await?;
                file.set_mode(0o700).await?;
                Some(file.path().to_path_buf())
            }
            None => None,
        };

        Ok(SessionFiles {
            dir: dir.path().to_path_buf(),
            control,
            identity,
            askpass,
        })
    }

    async fn check_private_key(&self, path: &Path) -> Result<(), DirectorError> {
        let output = Command::new(&self.options.keygen_binary)
            .arg("-y")
            .arg("-P")
            .arg("")
            .arg("-f")
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }
        Err(DirectorError::connection(
            ConnectionErrorKind::PrivateKeyParse,
            format!(
                "private key of {} rejected: {}",
                self.creds.endpoint(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ))
    }

    fn master_command(&self, files: &SessionFiles) -> Command {
        let mut cmd = Command::new(&self.options.binary);
        cmd.arg("-M")
            .arg("-N")
            .arg("-S")
            .arg(&files.control)
            .args(["-o", "ControlPersist=no"])
            .args(connection_args(&self.creds, &self.options, files.identity.as_deref()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let (Some(askpass), Some(password)) = (&files.askpass, self.creds.password()) {
            cmd.env("SSH_ASKPASS", askpass)
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env(PASSWORD_ENV, password);
        }
        cmd
    }

    async fn master_ready(&self, control: &Path) -> bool {
        Command::new(&self.options.binary)
            .arg("-S")
            .arg(control)
            .args(["-O", "check"])
            .arg(&self.creds.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Connector for OpenSshConnector {
    async fn connect(&self) -> Result<Arc<dyn Session>, DirectorError> {
        self.creds.validate()?;
        self.resolve().await?;
        let files = self.prepare_files().await?;

        debug!("Starting ssh master for {}", self.creds.endpoint());
        let mut child = self.master_command(&files).spawn()?;
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        // grace period on top of ssh's own ConnectTimeout
        let deadline = tokio::time::Instant::now() + self.options.connect_timeout + Duration::from_secs(1);
        loop {
            if let Some(status) = child.try_wait()? {
                let stderr = stderr_task.await.unwrap_or_default();
                let kind = match classify_connection_message(&stderr) {
                    ConnectionErrorKind::Unknown if status.code() == Some(SSH_ERROR_EXIT) => {
                        ConnectionErrorKind::Connection
                    }
                    kind => kind,
                };
                return Err(DirectorError::connection(
                    kind,
                    format!("ssh to {}: {}", self.creds.endpoint(), stderr.trim()),
                ));
            }

            if self.master_ready(&files.control).await {
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(DirectorError::connection(
                    ConnectionErrorKind::Connection,
                    format!("ssh to {} timed out", self.creds.endpoint()),
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!("SSH master for {} is up", self.creds.endpoint());
        Ok(Arc::new(OpenSshSession::spawn(
            child,
            files,
            self.creds.clone(),
            self.options.clone(),
        )))
    }
}

/// Command channel multiplexed over a running master
pub struct OpenSshSession {
    creds: NodeCredentials,
    options: Arc<SshOptions>,
    control: PathBuf,
    closed: CancellationToken,
    kill: CancellationToken,
}

impl OpenSshSession {
    fn spawn(
        mut master: Child,
        files: SessionFiles,
        creds: NodeCredentials,
        options: Arc<SshOptions>,
    ) -> Self {
        let closed = CancellationToken::new();
        let kill = CancellationToken::new();

        let endpoint = creds.endpoint();
        let watcher_closed = closed.clone();
        let watcher_kill = kill.clone();
        let dir = files.dir.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = master.wait() => {
                    warn!("SSH master for {} exited: {:?}", endpoint, status);
                }
                _ = watcher_kill.cancelled() => {
                    let _ = master.kill().await;
                    debug!("SSH master for {} stopped", endpoint);
                }
            }
            // key material does not outlive the session
            let _ = tokio::fs::remove_dir_all(&dir).await;
            watcher_closed.cancel();
        });

        Self {
            creds,
            options,
            control: files.control,
            closed,
            kill,
        }
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new(&self.options.binary);
        cmd.arg("-S")
            .arg(&self.control)
            .args(["-o", "BatchMode=yes"])
            .arg("-p")
            .arg(self.creds.port.to_string())
            .arg("-l")
            .arg(&self.creds.username)
            .arg(&self.creds.host)
            .arg("--")
            .arg(remote)
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Session for OpenSshSession {
    async fn exec(
        &self,
        command: &str,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<RawOutput, DirectorError> {
        let mut cmd = self.command(command);
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let pipe = child.stdin.take();

        let run = async move {
            let write = async move {
                if let (Some(mut pipe), Some(data)) = (pipe, stdin) {
                    pipe.write_all(&data).await?;
                    pipe.shutdown().await?;
                }
                Ok::<_, std::io::Error>(())
            };
            let (written, output) = tokio::join!(write, child.wait_with_output());
            written?;
            output
        };

        let output = match tokio::time::timeout(timeout, run).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(DirectorError::CommandTimeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code == SSH_ERROR_EXIT {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let kind = match classify_connection_message(&stderr) {
                ConnectionErrorKind::Unknown => ConnectionErrorKind::Connection,
                kind => kind,
            };
            return Err(DirectorError::connection(
                kind,
                format!("ssh to {}: {}", self.creds.endpoint(), stderr.trim()),
            ));
        }

        Ok(RawOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code,
        })
    }

    async fn stream_lines(&self, command: &str) -> Result<LineStream, DirectorError> {
        let mut child = self
            .command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DirectorError::Internal("ssh stdout not captured".to_string()))?;
        let lines = BufReader::new(stdout).lines();

        // the child rides along in the state so dropping the stream kills it
        let stream = stream::unfold(Some((lines, child)), |state| async move {
            let (mut lines, child) = state?;
            match lines.next_line().await {
                Ok(Some(line)) => Some((Ok(line), Some((lines, child)))),
                Ok(None) => None,
                Err(e) => Some((Err(DirectorError::IoError(e)), None)),
            }
        });
        Ok(stream.boxed())
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn close(&self) {
        let exit = Command::new(&self.options.binary)
            .arg("-S")
            .arg(&self.control)
            .args(["-O", "exit"])
            .arg(&self.creds.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        let _ = tokio::time::timeout(Duration::from_secs(2), exit).await;
        self.kill.cancel();
        self.closed.cancelled().await;
    }
}

/// Options shared by every ssh invocation that opens a connection
fn connection_args(creds: &NodeCredentials, options: &SshOptions, identity: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        format!(
            "BatchMode={}",
            if creds.password().is_some() { "no" } else { "yes" }
        ),
        "-o".to_string(),
        format!("StrictHostKeyChecking={}", options.strict_host_key_checking),
        "-o".to_string(),
        format!(
            "UserKnownHostsFile={}",
            options.control_dir.join("known_hosts").display()
        ),
        "-o".to_string(),
        format!("ConnectTimeout={}", options.connect_timeout.as_secs().max(1)),
        "-o".to_string(),
        "ServerAliveInterval=15".to_string(),
        "-o".to_string(),
        "ServerAliveCountMax=3".to_string(),
    ];
    if let Some(identity) = identity {
        args.extend([
            "-i".to_string(),
            identity.display().to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
        ]);
    }
    args.extend([
        "-p".to_string(),
        creds.port.to_string(),
        "-l".to_string(),
        creds.username.clone(),
        creds.host.clone(),
    ]);
    args
}

fn read_command(path: &str) -> String {
    format!("cat -- {}", shell_quote(path))
}

fn write_command(path: &str, create_parent_dirs: bool) -> String {
    let target = shell_quote(path);
    match Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) if create_parent_dirs => format!(
            "mkdir -p -- {} && cat > {}",
            shell_quote(&parent.to_string_lossy()),
            target
        ),
        _ => format!("cat > {}", target),
    }
}

fn delete_command(path: &str) -> String {
    let target = shell_quote(path);
    format!("if [ -e {0} ]; then rm -f -- {0} && echo deleted; fi", target)
}

fn inspect_command(id: &str) -> String {
    format!("docker inspect --format '{{{{json .}}}}' {}", shell_quote(id))
}

/// Identity of the credentials a live session was opened with
fn credentials_fingerprint(creds: &NodeCredentials) -> u64 {
    let mut hasher = DefaultHasher::new();
    creds.host.hash(&mut hasher);
    creds.port.hash(&mut hasher);
    creds.username.hash(&mut hasher);
    creds.password().hash(&mut hasher);
    creds.private_key().hash(&mut hasher);
    hasher.finish()
}

/// [`RemoteExecutor`] over one persistent OpenSSH session per node
pub struct SshExecutor {
    options: Arc<SshOptions>,
    registry: ConnectionRegistry,
}

impl SshExecutor {
    pub fn new(options: SshOptions, connection: ConnectionOptions) -> Self {
        Self {
            options: Arc::new(options),
            registry: ConnectionRegistry::new(connection),
        }
    }

    async fn manager(&self, creds: &NodeCredentials) -> Arc<NodeConnectionManager> {
        let options = self.options.clone();
        self.registry
            .manager_for(creds.node_id, credentials_fingerprint(creds), || {
                Arc::new(OpenSshConnector::new(creds.clone(), options))
            })
            .await
    }

    async fn exec(
        &self,
        creds: &NodeCredentials,
        command: String,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<CommandOutput, DirectorError> {
        debug!("Running '{}' on {}", command, creds.endpoint());
        let manager = self.manager(creds).await;
        let raw = manager
            .with_session(move |session| async move { session.exec(&command, stdin, timeout).await })
            .await?;
        Ok(raw.into())
    }

    /// Drop the session of a node that is no longer managed
    pub async fn forget(&self, node_id: uuid::Uuid) {
        self.registry.remove(node_id).await;
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn test_connection(&self, creds: &NodeCredentials) -> Result<(), DirectorError> {
        let mut options = (*self.options).clone();
        options.connect_timeout = CONNECTION_TEST_TIMEOUT;
        let connector = OpenSshConnector::new(creds.clone(), Arc::new(options))
            .with_session_name(format!("probe-{}", uuid::Uuid::new_v4()));

        let session = match tokio::time::timeout(
            CONNECTION_TEST_TIMEOUT + Duration::from_secs(2),
            connector.connect(),
        )
        .await
        {
            Ok(session) => session?,
            Err(_) => {
                return Err(DirectorError::connection(
                    ConnectionErrorKind::Connection,
                    format!("connecting to {} timed out", creds.endpoint()),
                ))
            }
        };
        session.close().await;
        Ok(())
    }

    async fn run_command(
        &self,
        creds: &NodeCredentials,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, DirectorError> {
        self.exec(creds, command.to_string(), None, timeout).await
    }

    async fn read_file(
        &self,
        creds: &NodeCredentials,
        path: &str,
    ) -> Result<Option<Vec<u8>>, DirectorError> {
        let command = read_command(path);
        let manager = self.manager(creds).await;
        let timeout = self.options.command_timeout;
        let raw = manager
            .with_session(move |session| async move { session.exec(&command, None, timeout).await })
            .await?;

        if raw.exit_code == 0 {
            return Ok(Some(raw.stdout));
        }
        let stderr = String::from_utf8_lossy(&raw.stderr);
        if stderr.contains("No such file or directory") {
            return Ok(None);
        }
        Err(DirectorError::DeploymentReconciliationFailed(format!(
            "reading {} on {} failed: {}",
            path,
            creds.endpoint(),
            stderr.trim()
        )))
    }

    async fn write_file(
        &self,
        creds: &NodeCredentials,
        path: &str,
        contents: &[u8],
        create_parent_dirs: bool,
    ) -> Result<(), DirectorError> {
        let output = self
            .exec(
                creds,
                write_command(path, create_parent_dirs),
                Some(contents.to_vec()),
                self.options.command_timeout,
            )
            .await?;
        if !output.success() {
            return Err(DirectorError::DeploymentReconciliationFailed(format!(
                "writing {} on {} failed: {}",
                path,
                creds.endpoint(),
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn delete_file(&self, creds: &NodeCredentials, path: &str) -> Result<bool, DirectorError> {
        let output = self
            .exec(creds, delete_command(path), None, self.options.command_timeout)
            .await?;
        if !output.success() {
            return Err(DirectorError::DeploymentReconciliationFailed(format!(
                "deleting {} on {} failed: {}",
                path,
                creds.endpoint(),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout.trim() == "deleted")
    }

    async fn list_containers(
        &self,
        creds: &NodeCredentials,
    ) -> Result<Vec<ContainerSummary>, DirectorError> {
        let output = self
            .exec(
                creds,
                LIST_CONTAINERS_COMMAND.to_string(),
                None,
                self.options.command_timeout,
            )
            .await?;
        if !output.success() {
            return Err(DirectorError::ContainerInfo(format!(
                "listing containers on {} failed: {}",
                creds.endpoint(),
                output.stderr.trim()
            )));
        }

        output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ContainerSummary::from_cli_json)
            .collect()
    }

    async fn inspect_container(
        &self,
        creds: &NodeCredentials,
        id: &str,
    ) -> Result<ContainerInspect, DirectorError> {
        let output = self
            .exec(creds, inspect_command(id), None, self.options.command_timeout)
            .await?;
        if !output.success() {
            return Err(DirectorError::ContainerInfo(format!(
                "inspecting {} on {} failed: {}",
                id,
                creds.endpoint(),
                output.stderr.trim()
            )));
        }
        ContainerInspect::from_json(output.stdout.trim())
    }

    async fn docker_events(&self, creds: &NodeCredentials) -> Result<DockerEventStream, DirectorError> {
        let manager = self.manager(creds).await;
        let lines = manager
            .with_session(|session| async move { session.stream_lines(EVENTS_COMMAND).await })
            .await?;

        let events = lines.filter_map(|line| async move {
            match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(DockerEvent::from_json(line.trim())),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(events.boxed())
    }

    async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
