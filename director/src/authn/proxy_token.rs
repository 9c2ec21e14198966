//! Short-lived tokens for the SSH proxy agent

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use proxy_api::{ProxyClaims, TOKEN_AUDIENCE};
use secrecy::{ExposeSecret, SecretString};

use crate::authn::credentials::NodeCredentials;
use crate::errors::DirectorError;

/// Mints one signed token per proxy call
#[derive(Clone)]
pub struct ProxyTokenMinter {
    secret: SecretString,
    lifetime: Duration,
}

impl std::fmt::Debug for ProxyTokenMinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyTokenMinter")
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl ProxyTokenMinter {
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            lifetime: Duration::hours(2),
        }
    }

    pub fn claims(&self, creds: &NodeCredentials) -> ProxyClaims {
        ProxyClaims {
            host: creds.host_port(),
            username: creds.username.clone(),
            password: creds.password().map(str::to_string),
            pkey: creds.private_key().map(str::to_string),
            aud: TOKEN_AUDIENCE.to_string(),
            exp: (Utc::now() + self.lifetime).timestamp(),
        }
    }

    pub fn mint(&self, creds: &NodeCredentials) -> Result<String, DirectorError> {
        let token = encode(
            &Header::new(Algorithm::HS256),
            &self.claims(creds),
            &EncodingKey::from_secret(self.secret.expose_secret().as_bytes()),
        )?;
        Ok(token)
    }
}
