//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::DirectorError;
use crate::logs::LogLevel;
use crate::models::StoredSecret;

/// Director settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Also write a daily rolling log file under the logs directory
    #[serde(default)]
    pub log_to_file: bool,

    #[serde(default)]
    pub executor: ExecutorSettings,

    #[serde(default)]
    pub lease: LeaseSettings,

    /// MQTT broker configuration
    #[serde(default)]
    pub mqtt_broker: MqttBrokerSettings,

    #[serde(default)]
    pub server: ServerSettings,

    /// Seed file of the in-memory store, `state.json` in the base directory
    /// when absent
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    #[serde(default)]
    pub poller: PollerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            executor: ExecutorSettings::default(),
            lease: LeaseSettings::default(),
            mqtt_broker: MqttBrokerSettings::default(),
            server: ServerSettings::default(),
            state_file: None,
            poller: PollerSettings::default(),
        }
    }
}

impl Settings {
    /// Reject combinations that cannot start
    pub fn validate(&self) -> Result<(), DirectorError> {
        if self.executor.backend == ExecutorBackend::Proxy {
            let proxy = &self.executor.proxy;
            if proxy.base_url.is_empty() {
                return Err(DirectorError::ConfigError(
                    "executor.proxy.base_url is required by the proxy backend".to_string(),
                ));
            }
            if proxy.token_secret.as_ref().is_none_or(|s| s.expose().is_empty()) {
                return Err(DirectorError::ConfigError(
                    "executor.proxy.token_secret is required by the proxy backend".to_string(),
                ));
            }
        }
        if self.lease.backend == LeaseBackend::Redis && self.lease.redis_url.is_empty() {
            return Err(DirectorError::ConfigError(
                "lease.redis_url is required by the redis lease backend".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorBackend {
    #[default]
    Ssh,
    Proxy,
}

/// Remote execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default)]
    pub backend: ExecutorBackend,

    #[serde(default)]
    pub proxy: ProxySettings,

    #[serde(default)]
    pub ssh: SshSettings,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Bound on commands that bring projects up or down, which may pull images
    #[serde(default = "default_activation_timeout")]
    pub activation_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    10
}

fn default_activation_timeout() -> u64 {
    600
}

fn default_connect_timeout() -> u64 {
    5
}

impl ExecutorSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.activation_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            backend: ExecutorBackend::default(),
            proxy: ProxySettings::default(),
            ssh: SshSettings::default(),
            command_timeout_secs: default_command_timeout(),
            activation_timeout_secs: default_activation_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// SSH proxy agent settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub base_url: String,

    /// HS256 secret shared with the proxy agent
    #[serde(default)]
    pub token_secret: Option<StoredSecret>,
}

/// OpenSSH client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_ssh_binary")]
    pub binary: String,

    /// `ssh` under the base directory when absent
    #[serde(default)]
    pub control_dir: Option<PathBuf>,

    #[serde(default = "default_strict_host_key_checking")]
    pub strict_host_key_checking: String,
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_strict_host_key_checking() -> String {
    "accept-new".to_string()
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            binary: default_ssh_binary(),
            control_dir: None,
            strict_host_key_checking: default_strict_host_key_checking(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseBackend {
    #[default]
    Local,
    Redis,
}

/// Node lease settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseSettings {
    #[serde(default)]
    pub backend: LeaseBackend,

    #[serde(default)]
    pub redis_url: String,
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttBrokerSettings {
    /// Broker host, empty disables notifications
    #[serde(default)]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Use TLS
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Optional path to a PEM-encoded CA certificate for broker TLS verification.
    /// When absent, the system certificate store is used.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
}

fn default_mqtt_port() -> u16 {
    8883
}

impl Default for MqttBrokerSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_mqtt_port(),
            tls: true,
            ca_cert_path: None,
        }
    }
}

/// Status server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Stale deployment poller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_polling_interval")]
    pub interval_secs: u64,
}

fn default_polling_interval() -> u64 {
    60
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_polling_interval(),
        }
    }
}
