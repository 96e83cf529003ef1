//! Best-effort key-value cache.
//!
//! Rule latches, action logs and the reboot debounce key survive process
//! restarts when a Redis instance is reachable. When it is not, an
//! in-process map stands in so the control paths never notice; latches
//! then simply reconstruct as `false` on the next cold start.

use crate::error::{AppResult, ControlError};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[async_trait]
pub trait KvCache: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()>;
    async fn get(&self, key: &str) -> AppResult<Option<String>>;
    async fn exists(&self, key: &str) -> AppResult<bool>;
    async fn delete(&self, key: &str) -> AppResult<()>;
}

pub struct RedisCache {
    manager: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> AppResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| ControlError::Backend(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| ControlError::Backend(e.to_string()))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl KvCache for RedisCache {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        let mut conn = self.manager.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| ControlError::Backend(e.to_string())),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| ControlError::Backend(e.to_string())),
        }
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.manager.clone();
        conn.get(key)
            .await
            .map_err(|e| ControlError::Backend(e.to_string()))
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        let mut conn = self.manager.clone();
        conn.exists(key)
            .await
            .map_err(|e| ControlError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| ControlError::Backend(e.to_string()))
    }
}

/// In-process fallback with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Option<Instant>)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        let (value, deadline) = entry.value();
        match deadline {
            Some(deadline) if Instant::now() >= *deadline => {
                drop(entry);
                self.entries.remove(key);
                None
            }
            _ => Some(value.clone()),
        }
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.live(key))
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        Ok(self.live(key).is_some())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Connect to Redis, or fall back to the in-process cache with a warning.
pub async fn connect_cache(url: Option<&str>) -> Arc<dyn KvCache> {
    if let Some(url) = url {
        match RedisCache::connect(url).await {
            Ok(cache) => {
                info!(url, "connected to cache");
                return Arc::new(cache);
            }
            Err(e) => {
                warn!(url, error = %e, "cache unreachable, using in-process fallback");
            }
        }
    }
    Arc::new(MemoryCache::new())
}
