//! Per-node convergence loop
//!
//! [`ReconciliationEngine::process_node_updates`] keeps applying the deployments
//! of one node until none of them needs an update. Errors are handled at two
//! scopes: a deployment that cannot be converged is latched as failed and the
//! pass moves on, while a node level failure (missing prerequisites, no
//! connection) latches the node and ends the pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::authn::credentials::{CredentialProvider, NodeCredentials};
use crate::cache::compose_path::ComposePathCache;
use crate::context::LogContext;
use crate::errors::DirectorError;
use crate::models::{AppliedDeployment, ComposeVersion, ConnectionLog, DeploymentSnapshot, LogSeverity};
use crate::reconcile::state::{needs_update, redeploy_requested, DeploymentState};
use crate::reconcile::systemd::render_unit;
use crate::remote::{
    deployment_scoped, shell_quote, RemoteExecutor, DEFAULT_ACTIVATION_TIMEOUT, DEFAULT_COMMAND_TIMEOUT,
};
use crate::store::Store;
use crate::utils::normalize_newlines;

/// Commands whose success proves a node can run deployments
const PREREQUISITES: [(&str, &str); 3] = [
    ("systemd", "systemctl --version"),
    ("docker", "docker --version"),
    ("docker-compose", "docker-compose --version"),
];

/// Engine options
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub command_timeout: Duration,

    /// Bound on bringing a project up, down or restarting it
    pub activation_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            activation_timeout: DEFAULT_ACTIVATION_TIMEOUT,
        }
    }
}

/// Which files changed while converging a deployment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilesOutcome {
    pub compose_changed: bool,
    pub unit_changed: bool,
}

/// Drives a node's deployments towards their desired state
pub struct ReconciliationEngine {
    store: Arc<dyn Store>,
    executor: Arc<dyn RemoteExecutor>,
    credentials: Arc<dyn CredentialProvider>,
    compose_paths: ComposePathCache,
    options: EngineOptions,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<dyn RemoteExecutor>,
        credentials: Arc<dyn CredentialProvider>,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            executor,
            credentials,
            compose_paths: ComposePathCache::default(),
            options,
        }
    }

    /// Converge every deployment of a node, then return
    pub async fn process_node_updates(
        &self,
        node_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), DirectorError> {
        let ctx = match self.store.get_node(node_id).await? {
            Some(node) => LogContext::for_node(&node),
            None => LogContext::for_node_id(node_id),
        };
        let span = ctx.span("process_node_updates");

        let result = self.node_loop(node_id, &ctx, cancel).instrument(span).await;
        match result {
            Ok(()) => Ok(()),
            Err(DirectorError::Cancelled) => Err(DirectorError::Cancelled),
            Err(e @ DirectorError::NodeReconciliationFailed(_))
            | Err(e @ DirectorError::ConnectionFailed { .. }) => {
                info!("Node {} reconciliation failed: {}", node_id, e);
                self.audit(ConnectionLog::new(&ctx, LogSeverity::Error, "Node reconciliation failed").with_error(&e))
                    .await;
                self.store.mark_node_failed(node_id).await?;
                Ok(())
            }
            Err(e) => {
                warn!("Unknown error when reconciling node {}: {}", node_id, e);
                self.audit(ConnectionLog::new(&ctx, LogSeverity::Error, "Unknown error").with_error(&e))
                    .await;
                if let Err(mark) = self.store.mark_node_failed(node_id).await {
                    warn!("Could not mark node {} as failed: {}", node_id, mark);
                }
                Err(e)
            }
        }
    }

    async fn node_loop(
        &self,
        node_id: Uuid,
        ctx: &LogContext,
        cancel: &CancellationToken,
    ) -> Result<(), DirectorError> {
        loop {
            checkpoint(cancel)?;

            let Some(node) = self.store.get_node(node_id).await? else {
                debug!("Node {} no longer exists", node_id);
                return Ok(());
            };
            if node.reconciliation_failed {
                debug!("Node {} is marked as failed, skipping", node_id);
                return Ok(());
            }

            let now = Utc::now();
            let pending: Vec<DeploymentSnapshot> = self
                .store
                .node_deployments(node_id)
                .await?
                .into_iter()
                .filter(|s| needs_update(s, now))
                .collect();
            if pending.is_empty() {
                debug!("Node {} has converged", node_id);
                return Ok(());
            }
            info!("Node {} has {} deployments to update", node_id, pending.len());

            let creds = self.credentials.node_credentials(&node).await?;

            if pending
                .iter()
                .any(|s| s.deployment.last_deployed_node_version != Some(node.version))
            {
                self.verify_node(&creds, ctx, cancel).await?;
            }

            for snapshot in &pending {
                checkpoint(cancel)?;
                self.apply_deployment(&creds, snapshot, ctx, cancel).await?;
            }
        }
    }

    /// Check that systemd, docker and docker-compose are usable on the node
    pub async fn verify_node(
        &self,
        creds: &NodeCredentials,
        ctx: &LogContext,
        cancel: &CancellationToken,
    ) -> Result<(), DirectorError> {
        self.audit(ConnectionLog::new(ctx, LogSeverity::Info, "Verifying node")).await;

        for (tool, command) in PREREQUISITES {
            checkpoint(cancel)?;
            let output = self
                .executor
                .run_command(creds, command, self.options.command_timeout)
                .await?;
            if !output.success() {
                debug!("{} unavailable on {}", tool, creds.endpoint());
                let message = format!("{} unavailable, stopping node configuration", tool);
                self.audit(ConnectionLog::new(ctx, LogSeverity::Error, message.clone())).await;
                return Err(DirectorError::NodeReconciliationFailed(message));
            }
        }
        Ok(())
    }

    /// Converge one deployment and record the outcome.
    ///
    /// Deployment scoped failures are latched and swallowed; anything else is
    /// returned to the node loop.
    pub async fn apply_deployment(
        &self,
        creds: &NodeCredentials,
        snapshot: &DeploymentSnapshot,
        node_ctx: &LogContext,
        cancel: &CancellationToken,
    ) -> Result<(), DirectorError> {
        let ctx = node_ctx.with_deployment(snapshot);
        let deployment_id = snapshot.deployment.id;

        let result = self
            .converge(creds, snapshot, &ctx, cancel)
            .instrument(ctx.span("apply_deployment"))
            .await;

        match result {
            Ok(state) => {
                self.store
                    .record_deployment_applied(AppliedDeployment {
                        deployment_id,
                        compose_version_id: snapshot.compose.current_id,
                        node_version: snapshot.node.version,
                        as_enabled: state.target.enabled,
                        checked_at: Utc::now(),
                    })
                    .await?;
                info!("Deployment {} applied", deployment_id);
                self.audit(ConnectionLog::new(&ctx, LogSeverity::Info, "Deployment applied successfully"))
                    .await;
                Ok(())
            }
            Err(DirectorError::DeploymentReconciliationFailed(reason)) => {
                warn!("Deployment {} reconciliation failed: {}", deployment_id, reason);
                self.audit(
                    ConnectionLog::new(&ctx, LogSeverity::Error, "Deployment reconciliation failed")
                        .with_error(&reason),
                )
                .await;
                self.store.mark_deployment_failed(deployment_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn converge(
        &self,
        creds: &NodeCredentials,
        snapshot: &DeploymentSnapshot,
        ctx: &LogContext,
        cancel: &CancellationToken,
    ) -> Result<DeploymentState, DirectorError> {
        let state = DeploymentState::calculate(snapshot);
        let target = &snapshot.current;
        debug!("Converging deployment {}: {:?}", snapshot.deployment.id, state);

        // file writes strictly precede activation commands
        let files = self
            .ensure_compose_and_service_deployment(creds, snapshot, &state, ctx)
            .await?;
        checkpoint(cancel)?;

        match &snapshot.last_deployed {
            None => {
                if state.target.enabled {
                    self.start(creds, target, state.target.use_service).await?;
                }
            }
            Some(last) => {
                let switched = mechanism_changed(last, target);
                if state.last.enabled && switched {
                    self.audit(ConnectionLog::new(ctx, LogSeverity::Info, "Stopping previous deployment mechanism"))
                        .await;
                    self.stop(creds, last, state.last.use_service).await?;
                    checkpoint(cancel)?;
                }

                if state.target.enabled {
                    self.start(creds, target, state.target.use_service).await?;
                    if state.target.use_service && state.last.enabled && !switched && files.compose_changed {
                        self.executor
                            .restart_service(creds, &target.service_unit(), self.options.activation_timeout)
                            .await?;
                    }
                } else {
                    self.stop(creds, target, state.target.use_service).await?;
                }

                if switched {
                    self.remove_previous_files(creds, last, target).await?;
                }
            }
        }

        if state.target.enabled && redeploy_requested(snapshot) {
            checkpoint(cancel)?;
            self.audit(ConnectionLog::new(ctx, LogSeverity::Info, "Redeployment requested, restarting"))
                .await;
            self.restart(creds, target, state.target.use_service).await?;
        }

        Ok(state)
    }

    /// Write the compose file and, in service mode, the unit file.
    ///
    /// Reloads systemd when the unit changed.
    pub async fn ensure_compose_and_service_deployment(
        &self,
        creds: &NodeCredentials,
        snapshot: &DeploymentSnapshot,
        state: &DeploymentState,
        ctx: &LogContext,
    ) -> Result<FilesOutcome, DirectorError> {
        let target = &snapshot.current;
        let mut outcome = FilesOutcome::default();

        self.audit(ConnectionLog::new(ctx, LogSeverity::Info, "Updating docker-compose.yml")).await;
        let contents = normalize_newlines(target.content.as_bytes());
        outcome.compose_changed = self
            .executor
            .upsert_file(creds, &target.compose_path(), &contents, true)
            .await
            .map_err(deployment_scoped)?;

        if state.target.use_service {
            let compose_path = self.docker_compose_path(creds).await?;
            let unit = render_unit(
                &snapshot.compose.name,
                &target.directory,
                &target.service_name,
                &compose_path,
            );

            self.audit(ConnectionLog::new(ctx, LogSeverity::Info, "Updating systemd service")).await;
            outcome.unit_changed = self
                .executor
                .upsert_file(creds, &target.service_path(), unit.as_bytes(), false)
                .await
                .map_err(deployment_scoped)?;
            if outcome.unit_changed {
                self.executor.reload_units(creds).await?;
            }
        }

        Ok(outcome)
    }

    async fn start(
        &self,
        creds: &NodeCredentials,
        version: &ComposeVersion,
        use_service: bool,
    ) -> Result<(), DirectorError> {
        if use_service {
            let unit = version.service_unit();
            self.executor
                .start_service(creds, &unit, self.options.activation_timeout)
                .await?;
            self.executor.enable_service(creds, &unit).await?;
            self.executor.reload_units(creds).await
        } else {
            self.compose(creds, version, "up -d --remove-orphans").await
        }
    }

    async fn stop(
        &self,
        creds: &NodeCredentials,
        version: &ComposeVersion,
        use_service: bool,
    ) -> Result<(), DirectorError> {
        if use_service {
            let unit = version.service_unit();
            self.executor
                .stop_service(creds, &unit, self.options.activation_timeout)
                .await?;
            self.executor.disable_service(creds, &unit).await?;
            self.executor.reload_units(creds).await
        } else {
            self.compose(creds, version, "down").await
        }
    }

    async fn restart(
        &self,
        creds: &NodeCredentials,
        version: &ComposeVersion,
        use_service: bool,
    ) -> Result<(), DirectorError> {
        if use_service {
            self.executor
                .restart_service(creds, &version.service_unit(), self.options.activation_timeout)
                .await
        } else {
            self.compose(creds, version, "restart").await
        }
    }

    async fn remove_previous_files(
        &self,
        creds: &NodeCredentials,
        last: &ComposeVersion,
        target: &ComposeVersion,
    ) -> Result<(), DirectorError> {
        let unit_gone = last.service_enabled
            && (!target.service_enabled || last.service_name != target.service_name);
        if unit_gone
            && self
                .executor
                .delete_file(creds, &last.service_path())
                .await
                .map_err(deployment_scoped)?
        {
            self.executor.reload_units(creds).await?;
        }

        if last.compose_path() != target.compose_path() {
            self.executor
                .delete_file(creds, &last.compose_path())
                .await
                .map_err(deployment_scoped)?;
        }
        Ok(())
    }

    async fn compose(
        &self,
        creds: &NodeCredentials,
        version: &ComposeVersion,
        args: &str,
    ) -> Result<(), DirectorError> {
        let binary = self.docker_compose_path(creds).await?;
        let command = compose_command(&binary, version, args);
        let output = self
            .executor
            .run_command(creds, &command, self.options.activation_timeout)
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

    /// Location of docker-compose on the node, resolved once per hour
    pub async fn docker_compose_path(&self, creds: &NodeCredentials) -> Result<String, DirectorError> {
        let endpoint = creds.endpoint();
        if let Some(path) = self.compose_paths.get(&endpoint) {
            return Ok(path);
        }

        let output = self
            .executor
            .run_command(creds, "which docker-compose", self.options.command_timeout)
            .await
            .map_err(deployment_scoped)?;
        let path = output.stdout.trim();
        if !output.success() || path.is_empty() {
            return Err(DirectorError::DeploymentReconciliationFailed(
                "Could not resolve docker-compose location".to_string(),
            ));
        }

        self.compose_paths.insert(&endpoint, path.to_string());
        Ok(path.to_string())
    }

    async fn audit(&self, entry: ConnectionLog) {
        if let Err(e) = self.store.append_connection_log(entry).await {
            warn!("Failed to append connection log: {}", e);
        }
    }
}

/// Mechanism identity changed between the applied and the desired version
fn mechanism_changed(last: &ComposeVersion, target: &ComposeVersion) -> bool {
    last.service_enabled != target.service_enabled
        || last.service_name != target.service_name
        || last.directory != target.directory
}

/// Compose invocation pinned to the version's project name, so container
/// labels match the service name whatever the directory is called
fn compose_command(binary: &str, version: &ComposeVersion, args: &str) -> String {
    format!(
        "{} --project-name {} --file {} {}",
        binary,
        shell_quote(&version.service_name),
        shell_quote(&version.compose_path()),
        args
    )
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), DirectorError> {
    if cancel.is_cancelled() {
        Err(DirectorError::Cancelled)
    } else {
        Ok(())
    }
}
