//! Time bounded exclusive right to work on a node
//!
//! Only the holder of a node's lease drives it. Leases are kept alive by a
//! renewal task and expire on their own when the holder disappears.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::DirectorError;

const REDIS_KEY_PREFIX: &str = "supercompose:lease:";

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Lease storage. Every call carries the owner token.
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    /// Take the lease if nobody holds it
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, DirectorError>;

    /// Push the expiry out, only if `token` still holds the lease
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, DirectorError>;

    /// Give the lease up, only if `token` still holds it
    async fn release(&self, key: &str, token: &str) -> Result<(), DirectorError>;
}

/// Lease acquisition options
#[derive(Debug, Clone)]
pub struct LeaseOptions {
    pub ttl: Duration,

    /// Upper bound of a single acquisition attempt
    pub attempt_timeout: Duration,

    /// Delay between acquisition attempts
    pub retry_interval: Duration,

    /// Give up acquiring after this long
    pub acquire_window: Duration,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            attempt_timeout: Duration::from_millis(100),
            retry_interval: Duration::from_millis(500),
            acquire_window: Duration::from_secs(1),
        }
    }
}

/// A held lease. Renewed in the background until released or dropped.
pub struct Lease {
    key: String,
    token: String,
    provider: Arc<dyn LeaseProvider>,
    lost: CancellationToken,
    renewal: JoinHandle<()>,
}

impl Lease {
    fn start(key: String, token: String, provider: Arc<dyn LeaseProvider>, ttl: Duration) -> Self {
        let lost = CancellationToken::new();
        let renewal = tokio::spawn(renew(
            key.clone(),
            token.clone(),
            provider.clone(),
            ttl,
            lost.clone(),
        ));
        Self {
            key,
            token,
            provider,
            lost,
            renewal,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Cancelled once the lease could not be renewed
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub async fn release(self) {
        self.renewal.abort();
        if let Err(e) = self.provider.release(&self.key, &self.token).await {
            // it expires on its own
            warn!("Failed to release lease {}: {}", self.key, e);
        } else {
            debug!("Released lease {}", self.key);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

async fn renew(
    key: String,
    token: String,
    provider: Arc<dyn LeaseProvider>,
    ttl: Duration,
    lost: CancellationToken,
) {
    let period = ttl / 3;
    loop {
        tokio::time::sleep(period).await;
        match tokio::time::timeout(period, provider.extend(&key, &token, ttl)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                warn!("Lease {} was taken over", key);
                break;
            }
            Ok(Err(e)) => {
                warn!("Failed to renew lease {}: {}", key, e);
                break;
            }
            Err(_) => {
                warn!("Renewing lease {} timed out", key);
                break;
            }
        }
    }
    lost.cancel();
}

/// Try to take `key` within the acquisition window.
///
/// `None` means somebody else holds it.
pub async fn acquire_lease(
    provider: Arc<dyn LeaseProvider>,
    key: &str,
    options: &LeaseOptions,
    cancel: &CancellationToken,
) -> Result<Option<Lease>, DirectorError> {
    let token = Uuid::new_v4().to_string();
    let deadline = Instant::now() + options.acquire_window;

    loop {
        let attempt = tokio::time::timeout(
            options.attempt_timeout,
            provider.try_acquire(key, &token, options.ttl),
        );
        match attempt.await {
            Ok(Ok(true)) => {
                debug!("Acquired lease {}", key);
                return Ok(Some(Lease::start(key.to_string(), token, provider, options.ttl)));
            }
            Ok(Ok(false)) => debug!("Lease {} is held elsewhere", key),
            Ok(Err(e)) => warn!("Lease attempt for {} failed: {}", key, e),
            Err(_) => debug!("Lease attempt for {} timed out", key),
        }

        if Instant::now() + options.retry_interval > deadline {
            return Ok(None);
        }
        tokio::select! {
            _ = tokio::time::sleep(options.retry_interval) => {}
            _ = cancel.cancelled() => return Err(DirectorError::Cancelled),
        }
    }
}

/// In-process leases, for a single director instance
#[derive(Default)]
pub struct LocalLeaseProvider {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl LocalLeaseProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseProvider for LocalLeaseProvider {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, DirectorError> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match leases.get(key) {
            Some((_, expires)) if *expires > now => Ok(false),
            _ => {
                leases.insert(key.to_string(), (token.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, DirectorError> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match leases.get_mut(key) {
            Some((holder, expires)) if holder == token && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), DirectorError> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if leases.get(key).is_some_and(|(holder, _)| holder == token) {
            leases.remove(key);
        }
        Ok(())
    }
}

/// Leases shared by every director instance through Redis
pub struct RedisLeaseProvider {
    pool: Pool,
}

impl std::fmt::Debug for RedisLeaseProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLeaseProvider").finish()
    }
}

impl RedisLeaseProvider {
    pub async fn new(url: &str) -> Result<Self, DirectorError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| DirectorError::LeaseError(format!("Failed to create Redis pool: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| DirectorError::LeaseError(format!("Failed to connect to Redis: {}", e)))?;
        redis::cmd("PING").query_async::<_, String>(&mut *conn).await?;

        info!("Redis lease provider connected");
        Ok(Self { pool })
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, DirectorError> {
        self.pool
            .get()
            .await
            .map_err(|e| DirectorError::LeaseError(format!("Failed to get Redis connection: {}", e)))
    }
}

#[async_trait]
impl LeaseProvider for RedisLeaseProvider {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, DirectorError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(format!("{}{}", REDIS_KEY_PREFIX, key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, DirectorError> {
        let mut conn = self.connection().await?;
        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(format!("{}{}", REDIS_KEY_PREFIX, key))
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut *conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), DirectorError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(format!("{}{}", REDIS_KEY_PREFIX, key))
            .arg(token)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }
}
