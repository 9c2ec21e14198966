//! Node credentials

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::errors::{ConnectionErrorKind, DirectorError};
use crate::models::Node;

/// Decrypted credentials needed to reach a node
#[derive(Debug, Clone)]
pub struct NodeCredentials {
    pub node_id: Uuid,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<SecretString>,
    pub private_key: Option<SecretString>,
}

impl NodeCredentials {
    /// `username@host:port`, the cache key for per-target facts
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.expose_secret())
    }

    pub fn private_key(&self) -> Option<&str> {
        self.private_key.as_ref().map(|k| k.expose_secret())
    }

    /// Reject credentials no transport could use
    pub fn validate(&self) -> Result<(), DirectorError> {
        if self.host.trim().is_empty() {
            return Err(DirectorError::connection(ConnectionErrorKind::Dns, "host is empty"));
        }
        if self.username.trim().is_empty() {
            return Err(DirectorError::connection(
                ConnectionErrorKind::Authentication,
                "username is empty",
            ));
        }
        if self.password.is_none() && self.private_key.is_none() {
            return Err(DirectorError::connection(
                ConnectionErrorKind::Authentication,
                "neither password nor private key configured",
            ));
        }
        Ok(())
    }
}

/// Source of node credentials
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn node_credentials(&self, node: &Node) -> Result<NodeCredentials, DirectorError>;
}

/// Uses the credentials kept on the node record as-is
#[derive(Debug, Default, Clone)]
pub struct StoredCredentialProvider;

#[async_trait]
impl CredentialProvider for StoredCredentialProvider {
    async fn node_credentials(&self, node: &Node) -> Result<NodeCredentials, DirectorError> {
        let creds = NodeCredentials {
            node_id: node.id,
            host: node.host.clone(),
            port: node.port,
            username: node.username.clone(),
            password: node
                .password
                .as_ref()
                .map(|p| SecretString::from(p.expose().to_string())),
            private_key: node
                .private_key
                .as_ref()
                .map(|k| SecretString::from(k.expose().to_string())),
        };
        creds.validate()?;
        Ok(creds)
    }
}
