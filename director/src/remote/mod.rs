//! Remote execution against managed nodes
//!
//! [`RemoteExecutor`] is the only capability the reconciliation engine and the
//! container synchronizer need from a node. Two backends implement it: the
//! HTTP proxy agent ([`proxy::ProxyExecutor`]) and a direct OpenSSH session per
//! node ([`ssh::SshExecutor`]). The backend is selected once at startup.

pub mod connection;
pub mod docker;
pub mod proxy;
pub mod session_fsm;
pub mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::debug;

use crate::authn::credentials::NodeCredentials;
use crate::errors::{ConnectionErrorKind, DirectorError};
use crate::remote::docker::{ContainerInspect, ContainerSummary, DockerEvent};
use crate::utils::normalize_newlines;

/// Timeout applied to remote calls that do not take one explicitly
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout of commands that start, stop or restart a project
pub const DEFAULT_ACTIVATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout of a connectivity probe
pub const CONNECTION_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Live, unbounded sequence of docker events. Ends when the remote stream ends.
pub type DockerEventStream = BoxStream<'static, Result<DockerEvent, DirectorError>>;

/// Result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Transport independent remote operations on a node
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Establish (or reuse) a session and report why it failed, if it did
    async fn test_connection(&self, creds: &NodeCredentials) -> Result<(), DirectorError>;

    async fn run_command(
        &self,
        creds: &NodeCredentials,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, DirectorError>;

    /// Read a file, `None` when it does not exist
    async fn read_file(
        &self,
        creds: &NodeCredentials,
        path: &str,
    ) -> Result<Option<Vec<u8>>, DirectorError>;

    /// Unconditionally write a file
    async fn write_file(
        &self,
        creds: &NodeCredentials,
        path: &str,
        contents: &[u8],
        create_parent_dirs: bool,
    ) -> Result<(), DirectorError>;

    /// Write a file only when its content differs. Returns whether it was written.
    async fn upsert_file(
        &self,
        creds: &NodeCredentials,
        path: &str,
        contents: &[u8],
        create_parent_dirs: bool,
    ) -> Result<bool, DirectorError> {
        upsert_file_via(self, creds, path, contents, create_parent_dirs).await
    }

    /// Remove a file. Returns whether something was deleted.
    async fn delete_file(&self, creds: &NodeCredentials, path: &str) -> Result<bool, DirectorError>;

    /// Start a unit. A oneshot compose unit blocks for the whole `up`.
    async fn start_service(
        &self,
        creds: &NodeCredentials,
        unit: &str,
        timeout: Duration,
    ) -> Result<(), DirectorError> {
        run_systemctl(self, creds, "start", Some(unit), timeout).await
    }

    async fn stop_service(
        &self,
        creds: &NodeCredentials,
        unit: &str,
        timeout: Duration,
    ) -> Result<(), DirectorError> {
        run_systemctl(self, creds, "stop", Some(unit), timeout).await
    }

    async fn enable_service(&self, creds: &NodeCredentials, unit: &str) -> Result<(), DirectorError> {
        run_systemctl(self, creds, "enable", Some(unit), DEFAULT_COMMAND_TIMEOUT).await
    }

    async fn disable_service(&self, creds: &NodeCredentials, unit: &str) -> Result<(), DirectorError> {
        run_systemctl(self, creds, "disable", Some(unit), DEFAULT_COMMAND_TIMEOUT).await
    }

    async fn restart_service(
        &self,
        creds: &NodeCredentials,
        unit: &str,
        timeout: Duration,
    ) -> Result<(), DirectorError> {
        run_systemctl(self, creds, "restart", Some(unit), timeout).await
    }

    /// `systemctl daemon-reload`
    async fn reload_units(&self, creds: &NodeCredentials) -> Result<(), DirectorError> {
        run_systemctl(self, creds, "daemon-reload", None, DEFAULT_COMMAND_TIMEOUT).await
    }

    /// Containers carrying a compose project label
    async fn list_containers(
        &self,
        creds: &NodeCredentials,
    ) -> Result<Vec<ContainerSummary>, DirectorError>;

    async fn inspect_container(
        &self,
        creds: &NodeCredentials,
        id: &str,
    ) -> Result<ContainerInspect, DirectorError>;

    /// Subscribe to container events of compose projects
    async fn docker_events(&self, creds: &NodeCredentials) -> Result<DockerEventStream, DirectorError>;

    /// Release transport resources held for nodes
    async fn shutdown(&self) {}
}

/// Read, compare, then write only when the bytes differ.
///
/// Existing content has `\r\n` normalized before the comparison.
pub async fn upsert_file_via<E>(
    executor: &E,
    creds: &NodeCredentials,
    path: &str,
    contents: &[u8],
    create_parent_dirs: bool,
) -> Result<bool, DirectorError>
where
    E: RemoteExecutor + ?Sized,
{
    if let Some(existing) = executor.read_file(creds, path).await? {
        if normalize_newlines(&existing) == contents {
            debug!("{} is up to date on {}", path, creds.endpoint());
            return Ok(false);
        }
    }

    executor
        .write_file(creds, path, contents, create_parent_dirs)
        .await?;
    debug!("Wrote {} on {}", path, creds.endpoint());
    Ok(true)
}

async fn run_systemctl<E>(
    executor: &E,
    creds: &NodeCredentials,
    verb: &str,
    unit: Option<&str>,
    timeout: Duration,
) -> Result<(), DirectorError>
where
    E: RemoteExecutor + ?Sized,
{
    let command = match unit {
        Some(unit) => format!("systemctl {} {}", verb, shell_quote(unit)),
        None => format!("systemctl {}", verb),
    };
    let output = executor
        .run_command(creds, &command, timeout)
        .await
        .map_err(deployment_scoped)?;
    if !output.success() {
        return Err(DirectorError::DeploymentReconciliationFailed(format!(
            "'{}' exited with {}: {}",
            command,
            output.exit_code,
            output.stderr.trim()
        )));
    }
    Ok(())
}

/// Failures of a single remote operation that only concern the deployment
/// being converged: a timed out command or a proxy rejection
pub fn deployment_scoped(err: DirectorError) -> DirectorError {
    match err {
        e @ DirectorError::CommandTimeout { .. } => {
            DirectorError::DeploymentReconciliationFailed(e.to_string())
        }
        DirectorError::Proxy { status, title } => {
            DirectorError::DeploymentReconciliationFailed(format!("{} ({})", title, status))
        }
        other => other,
    }
}

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Classify a transport error message into the connection taxonomy
pub fn classify_connection_message(message: &str) -> ConnectionErrorKind {
    let m = message.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| m.contains(n));

    if any(&[
        "could not resolve hostname",
        "no such host",
        "name or service not known",
        "temporary failure in name resolution",
        "nodename nor servname",
    ]) {
        ConnectionErrorKind::Dns
    } else if any(&[
        "load key",
        "invalid format",
        "parse private key",
        "no key found",
        "bad passphrase",
        "incorrect passphrase",
    ]) {
        ConnectionErrorKind::PrivateKeyParse
    } else if any(&[
        "permission denied",
        "unable to authenticate",
        "authentication failed",
        "too many authentication failures",
        "no supported methods remain",
    ]) {
        ConnectionErrorKind::Authentication
    } else if any(&[
        "connection refused",
        "connection timed out",
        "operation timed out",
        "i/o timeout",
        "no route to host",
        "network is unreachable",
        "connection reset",
        "connection closed",
        "broken pipe",
        "host is down",
    ]) {
        ConnectionErrorKind::Connection
    } else {
        ConnectionErrorKind::Unknown
    }
}
