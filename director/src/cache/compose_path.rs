//! docker-compose location cache

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tokio::time::Instant;

/// How long a resolved location stays valid
pub const COMPOSE_PATH_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct ComposePathEntry {
    path: String,
    cached_at: Instant,
}

/// Resolved `docker-compose` binary per `username@host:port`
pub struct ComposePathCache {
    entries: RwLock<HashMap<String, ComposePathEntry>>,
    ttl: Duration,
}

impl ComposePathCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Cached location, unless it expired
    pub fn get(&self, endpoint: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(endpoint)
            .filter(|e| e.cached_at.elapsed() < self.ttl)
            .map(|e| e.path.clone())
    }

    pub fn insert(&self, endpoint: &str, path: String) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        // expired entries are only dropped on write
        let ttl = self.ttl;
        entries.retain(|_, e| e.cached_at.elapsed() < ttl);

        entries.insert(
            endpoint.to_string(),
            ComposePathEntry {
                path,
                cached_at: Instant::now(),
            },
        );
    }
}

impl Default for ComposePathCache {
    fn default() -> Self {
        Self::new(COMPOSE_PATH_TTL)
    }
}
