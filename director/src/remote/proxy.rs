//! HTTP proxy agent backend

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use proxy_api::{
    CommandResult, ContainerListEntry, DeleteFileResponse, ProblemResponse, ReadFileResponse,
    UpsertFileRequest, UpsertFileResponse, PROBLEM_CONNECTION,
};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};
use url::Url;

use crate::authn::credentials::NodeCredentials;
use crate::authn::proxy_token::ProxyTokenMinter;
use crate::errors::DirectorError;
use crate::remote::docker::{ContainerInspect, ContainerSummary, DockerEvent};
use crate::remote::{
    classify_connection_message, CommandOutput, DockerEventStream, RemoteExecutor,
    CONNECTION_TEST_TIMEOUT, DEFAULT_COMMAND_TIMEOUT,
};

/// Talks to the SSH proxy agent over HTTP
pub struct ProxyExecutor {
    client: Client,
    base_url: Url,
    minter: ProxyTokenMinter,
}

impl ProxyExecutor {
    /// Create a new proxy executor
    pub fn new(base_url: &str, minter: ProxyTokenMinter) -> Result<Self, DirectorError> {
        // no client wide timeout: the events stream is unbounded
        let client = Client::builder()
            .connect_timeout(CONNECTION_TEST_TIMEOUT)
            .build()?;

        let mut base_url = Url::parse(base_url)
            .map_err(|e| DirectorError::ConfigError(format!("Invalid proxy url {}: {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            minter,
        })
    }

    fn url(&self, path: &str) -> Result<Url, DirectorError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| DirectorError::ConfigError(format!("Invalid proxy path {}: {}", path, e)))
    }

    fn authorized(
        &self,
        request: RequestBuilder,
        creds: &NodeCredentials,
    ) -> Result<RequestBuilder, DirectorError> {
        let token = self.minter.mint(creds)?;
        Ok(request.header(header::AUTHORIZATION, format!("Bearer {}", token)))
    }

    async fn send(
        &self,
        request: RequestBuilder,
        creds: &NodeCredentials,
        timeout: Option<Duration>,
    ) -> Result<Response, DirectorError> {
        let mut request = self.authorized(request, creds)?;
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(problem_to_error(status, &body))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        creds: &NodeCredentials,
    ) -> Result<T, DirectorError> {
        let response = self
            .send(request, creds, Some(DEFAULT_COMMAND_TIMEOUT))
            .await?;
        Ok(response.json().await?)
    }

    async fn systemd(
        &self,
        creds: &NodeCredentials,
        path: &str,
        unit: Option<&str>,
        timeout: Duration,
    ) -> Result<(), DirectorError> {
        let url = self.url(path)?;
        debug!("POST {} ({:?}) on {}", url, unit, creds.endpoint());

        let mut request = self.client.post(url);
        if let Some(unit) = unit {
            request = request.query(&[("id", unit)]);
        }
        match self.send(request, creds, Some(timeout)).await {
            Ok(_) => Ok(()),
            Err(DirectorError::HttpError(e)) if e.is_timeout() => {
                Err(DirectorError::DeploymentReconciliationFailed(format!(
                    "{} {} timed out after {:?}",
                    path,
                    unit.unwrap_or_default(),
                    timeout
                )))
            }
            Err(DirectorError::Proxy { status, title }) => {
                Err(DirectorError::DeploymentReconciliationFailed(format!(
                    "{} {}: {} ({})",
                    path,
                    unit.unwrap_or_default(),
                    title,
                    status
                )))
            }
            Err(e) => Err(e),
        }
    }
}

/// Map a failed proxy response onto the error taxonomy
fn problem_to_error(status: StatusCode, body: &str) -> DirectorError {
    let problem: ProblemResponse = serde_json::from_str(body).unwrap_or_else(|_| ProblemResponse {
        title: body.to_string(),
        ..Default::default()
    });

    if problem.problem_type.as_deref() == Some(PROBLEM_CONNECTION) {
        let cause = problem.cause();
        return DirectorError::connection(classify_connection_message(&cause), cause);
    }

    error!("Proxy request failed: {} - {}", status, body);
    DirectorError::Proxy {
        status: status.as_u16(),
        title: match problem.error {
            Some(_) => format!("{}: {}", problem.title, problem.cause()),
            None => problem.title,
        },
    }
}

#[async_trait]
impl RemoteExecutor for ProxyExecutor {
    async fn test_connection(&self, creds: &NodeCredentials) -> Result<(), DirectorError> {
        self.run_command(creds, "true", CONNECTION_TEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn run_command(
        &self,
        creds: &NodeCredentials,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, DirectorError> {
        let url = self.url("command")?;
        debug!("GET {} '{}' on {}", url, command, creds.endpoint());

        let request = self.client.get(url).query(&[("command", command)]);
        let response = match self.send(request, creds, Some(timeout)).await {
            Ok(response) => response,
            Err(DirectorError::HttpError(e)) if e.is_timeout() => {
                return Err(DirectorError::CommandTimeout {
                    command: command.to_string(),
                    timeout,
                })
            }
            Err(e) => return Err(e),
        };
        let result: CommandResult = response.json().await?;

        if result.timed_out() {
            return Err(DirectorError::CommandTimeout {
                command: command.to_string(),
                timeout,
            });
        }

        Ok(match result.code {
            Some(code) => CommandOutput {
                stdout: result.stdout,
                stderr: result.stderr,
                exit_code: code,
            },
            None => CommandOutput {
                stdout: result.stdout,
                stderr: result.error.unwrap_or(result.stderr),
                exit_code: -1,
            },
        })
    }

    async fn read_file(
        &self,
        creds: &NodeCredentials,
        path: &str,
    ) -> Result<Option<Vec<u8>>, DirectorError> {
        let url = self.url("files/read")?;
        debug!("GET {} '{}' on {}", url, path, creds.endpoint());

        let request = self.client.get(url).query(&[("path", path)]);
        match self.send(request, creds, Some(DEFAULT_COMMAND_TIMEOUT)).await {
            Ok(response) => {
                let body: ReadFileResponse = response.json().await?;
                Ok(Some(body.contents))
            }
            Err(DirectorError::Proxy { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(DirectorError::Proxy { status, title }) => {
                let lowered = title.to_lowercase();
                if lowered.contains("no such file") || lowered.contains("does not exist") {
                    Ok(None)
                } else {
                    Err(DirectorError::DeploymentReconciliationFailed(format!(
                        "Reading {} failed: {} ({})",
                        path, title, status
                    )))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn write_file(
        &self,
        creds: &NodeCredentials,
        path: &str,
        contents: &[u8],
        create_parent_dirs: bool,
    ) -> Result<(), DirectorError> {
        // the proxy only offers a compare-and-write primitive
        self.upsert_file(creds, path, contents, create_parent_dirs)
            .await
            .map(|_| ())
    }

    async fn upsert_file(
        &self,
        creds: &NodeCredentials,
        path: &str,
        contents: &[u8],
        create_parent_dirs: bool,
    ) -> Result<bool, DirectorError> {
        let url = self.url("files/upsert")?;
        debug!("POST {} '{}' on {}", url, path, creds.endpoint());

        let body = UpsertFileRequest {
            path: path.to_string(),
            contents: contents.to_vec(),
            create_folder: create_parent_dirs,
        };
        match self
            .send_json::<UpsertFileResponse>(self.client.post(url).json(&body), creds)
            .await
        {
            Ok(response) => Ok(response.updated),
            Err(DirectorError::Proxy { status, title }) => {
                Err(DirectorError::DeploymentReconciliationFailed(format!(
                    "Writing {} failed: {} ({})",
                    path, title, status
                )))
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_file(&self, creds: &NodeCredentials, path: &str) -> Result<bool, DirectorError> {
        let url = self.url("files/delete")?;
        debug!("POST {} '{}' on {}", url, path, creds.endpoint());

        let request = self.client.post(url).query(&[("path", path)]);
        match self.send_json::<DeleteFileResponse>(request, creds).await {
            Ok(response) => Ok(response.deleted),
            Err(DirectorError::Proxy { status, title }) => {
                Err(DirectorError::DeploymentReconciliationFailed(format!(
                    "Deleting {} failed: {} ({})",
                    path, title, status
                )))
            }
            Err(e) => Err(e),
        }
    }

    async fn start_service(
        &self,
        creds: &NodeCredentials,
        unit: &str,
        timeout: Duration,
    ) -> Result<(), DirectorError> {
        self.systemd(creds, "systemd/service/start", Some(unit), timeout).await
    }

    async fn stop_service(
        &self,
        creds: &NodeCredentials,
        unit: &str,
        timeout: Duration,
    ) -> Result<(), DirectorError> {
        self.systemd(creds, "systemd/service/stop", Some(unit), timeout).await
    }

    async fn enable_service(&self, creds: &NodeCredentials, unit: &str) -> Result<(), DirectorError> {
        self.systemd(creds, "systemd/service/enable", Some(unit), DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    async fn disable_service(&self, creds: &NodeCredentials, unit: &str) -> Result<(), DirectorError> {
        self.systemd(creds, "systemd/service/disable", Some(unit), DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    async fn restart_service(
        &self,
        creds: &NodeCredentials,
        unit: &str,
        timeout: Duration,
    ) -> Result<(), DirectorError> {
        self.systemd(creds, "systemd/service/restart", Some(unit), timeout).await
    }

    async fn reload_units(&self, creds: &NodeCredentials) -> Result<(), DirectorError> {
        self.systemd(creds, "systemd/reload", None, DEFAULT_COMMAND_TIMEOUT).await
    }

    async fn list_containers(
        &self,
        creds: &NodeCredentials,
    ) -> Result<Vec<ContainerSummary>, DirectorError> {
        let url = self.url("docker/containers/json")?;
        debug!("GET {} on {}", url, creds.endpoint());

        let entries: Vec<ContainerListEntry> =
            match self.send_json(self.client.get(url), creds).await {
                Ok(entries) => entries,
                Err(DirectorError::Proxy { status, title }) => {
                    return Err(DirectorError::ContainerInfo(format!("{} ({})", title, status)))
                }
                Err(e) => return Err(e),
            };

        Ok(entries
            .into_iter()
            .map(|entry| ContainerSummary {
                id: entry.id,
                labels: entry.labels.unwrap_or_default(),
            })
            .filter(|summary| summary.project().is_some())
            .collect())
    }

    async fn inspect_container(
        &self,
        creds: &NodeCredentials,
        id: &str,
    ) -> Result<ContainerInspect, DirectorError> {
        let url = self.url(&format!("docker/containers/{}/json", id))?;
        debug!("GET {} on {}", url, creds.endpoint());

        match self.send_json::<serde_json::Value>(self.client.get(url), creds).await {
            Ok(raw) => ContainerInspect::from_value(raw),
            Err(DirectorError::Proxy { status, title }) => Err(DirectorError::ContainerInfo(
                format!("Inspecting {} failed: {} ({})", id, title, status),
            )),
            Err(e) => Err(e),
        }
    }

    async fn docker_events(&self, creds: &NodeCredentials) -> Result<DockerEventStream, DirectorError> {
        let url = self.url("docker/events")?;
        debug!("GET {} (stream) on {}", url, creds.endpoint());

        let request = self
            .client
            .get(url)
            .header(header::ACCEPT, "text/event-stream");
        let response = self.send(request, creds, None).await?;

        let events = sse_data_lines(response.bytes_stream()).filter_map(|line| async move {
            match line {
                Ok(data) if data.trim().is_empty() => None,
                Ok(data) => match DockerEvent::from_json(&data) {
                    Ok(event) => Some(Ok(event)),
                    Err(e) => {
                        warn!("Skipping unparsable docker event: {}", e);
                        None
                    }
                },
                Err(e) => Some(Err(e)),
            }
        });
        Ok(events.boxed())
    }
}

struct SseState<S> {
    inner: Pin<Box<S>>,
    buffer: Vec<u8>,
    done: bool,
}

/// Split a server-sent-events byte stream into its `data:` payloads
pub fn sse_data_lines<S, B, E>(bytes: S) -> BoxStream<'static, Result<String, DirectorError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<DirectorError> + Send + 'static,
{
    let state = SseState {
        inner: Box::pin(bytes),
        buffer: Vec::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end_matches(['\r', '\n']);
                if let Some(data) = line.strip_prefix("data:") {
                    return Some((Ok(data.trim_start().to_string()), state));
                }
                continue;
            }

            if state.done {
                return None;
            }

            match state.inner.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    state.done = true;
                    state.buffer.clear();
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.done = true;
                    if !state.buffer.is_empty() {
                        state.buffer.push(b'\n');
                    }
                }
            }
        }
    })
    .boxed()
}
