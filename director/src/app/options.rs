//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use uuid::Uuid;

use crate::errors::DirectorError;
use crate::mqtt::client::MqttAddress;
use crate::reconcile::EngineOptions;
use crate::remote::connection::ConnectionOptions;
use crate::remote::ssh::SshOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{ExecutorBackend, LeaseBackend, Settings};
use crate::supervisor::SupervisorOptions;
use crate::workers::{notifications, poller};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Seed file of the in-memory store
    pub state_file: PathBuf,

    /// Transport to the nodes
    pub executor: ExecutorOptions,

    /// Where node leases live
    pub lease: LeaseOptions,

    pub engine: EngineOptions,

    pub supervisor: SupervisorOptions,

    /// Enable local HTTP server
    pub enable_socket_server: bool,

    /// Enable notification worker
    pub enable_notifications: bool,

    /// Enable polling worker
    pub enable_poller: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Notification worker options
    pub notifications: notifications::Options,

    /// Poller worker options
    pub poller: poller::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        let layout = StorageLayout::default();
        Self {
            lifecycle: LifecycleOptions::default(),
            state_file: layout.state_file().path().to_path_buf(),
            executor: ExecutorOptions::default(),
            lease: LeaseOptions::Local,
            engine: EngineOptions::default(),
            supervisor: SupervisorOptions::default(),
            enable_socket_server: true,
            enable_notifications: true,
            enable_poller: true,
            server: ServerOptions::default(),
            notifications: notifications::Options::default(),
            poller: poller::Options::default(),
        }
    }
}

impl AppOptions {
    /// Resolve settings against the storage layout
    pub fn from_settings(settings: &Settings, layout: &StorageLayout) -> Result<Self, DirectorError> {
        settings.validate()?;

        let executor_settings = &settings.executor;
        let executor = match executor_settings.backend {
            ExecutorBackend::Ssh => ExecutorOptions::Ssh {
                ssh: SshOptions {
                    binary: executor_settings.ssh.binary.clone(),
                    control_dir: executor_settings
                        .ssh
                        .control_dir
                        .clone()
                        .unwrap_or_else(|| layout.ssh_dir().path().to_path_buf()),
                    connect_timeout: executor_settings.connect_timeout(),
                    command_timeout: executor_settings.command_timeout(),
                    strict_host_key_checking: executor_settings.ssh.strict_host_key_checking.clone(),
                    ..Default::default()
                },
                connection: ConnectionOptions::default(),
            },
            ExecutorBackend::Proxy => {
                let secret = executor_settings
                    .proxy
                    .token_secret
                    .as_ref()
                    .map(|s| SecretString::from(s.expose().to_string()))
                    .ok_or_else(|| DirectorError::ConfigError("Missing proxy token secret".to_string()))?;
                ExecutorOptions::Proxy {
                    base_url: executor_settings.proxy.base_url.clone(),
                    token_secret: secret,
                }
            }
        };

        let lease = match settings.lease.backend {
            LeaseBackend::Local => LeaseOptions::Local,
            LeaseBackend::Redis => LeaseOptions::Redis {
                url: settings.lease.redis_url.clone(),
            },
        };

        Ok(Self {
            state_file: settings
                .state_file
                .clone()
                .unwrap_or_else(|| layout.state_file().path().to_path_buf()),
            executor,
            lease,
            engine: EngineOptions {
                command_timeout: executor_settings.command_timeout(),
                activation_timeout: executor_settings.activation_timeout(),
            },
            enable_socket_server: settings.server.enabled,
            enable_notifications: !settings.mqtt_broker.host.is_empty(),
            enable_poller: settings.poller.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            notifications: notifications::Options {
                broker_address: MqttAddress {
                    host: settings.mqtt_broker.host.clone(),
                    port: settings.mqtt_broker.port,
                    use_tls: settings.mqtt_broker.tls,
                    ca_cert_path: settings.mqtt_broker.ca_cert_path.clone(),
                },
                client_id: format!("supercompose-director-{}", Uuid::new_v4()),
                ..Default::default()
            },
            poller: poller::Options {
                interval: Duration::from_secs(settings.poller.interval_secs),
                ..Default::default()
            },
            ..Default::default()
        })
    }
}

/// Remote execution backend, chosen once at startup
#[derive(Debug, Clone)]
pub enum ExecutorOptions {
    Ssh {
        ssh: SshOptions,
        connection: ConnectionOptions,
    },
    Proxy {
        base_url: String,
        token_secret: SecretString,
    },
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        ExecutorOptions::Ssh {
            ssh: SshOptions::default(),
            connection: ConnectionOptions::default(),
        }
    }
}

/// Lease provider selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOptions {
    Local,
    Redis { url: String },
}

/// Lifecycle options for the director
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
