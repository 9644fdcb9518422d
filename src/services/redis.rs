//! Redis-backed cache

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tokio::sync::OnceCell;

use crate::error::{AppError, AppResult};

use super::cache::Cache;

/// Reconnect attempts made while establishing the shared connection
const CONNECT_RETRIES: usize = 1;

#[derive(Clone)]
pub struct RedisCache {
    client: Client,
    manager: Arc<OnceCell<ConnectionManager>>,
}

impl RedisCache {
    /// Create a new Redis cache.
    ///
    /// Only the URL has to be valid: an unreachable server at startup is
    /// logged and the cache runs degraded until Redis comes back.
    pub async fn new(url: &str) -> AppResult<Self> {
        let client = Client::open(url)
            .map_err(|e| AppError::Internal(format!("Failed to create Redis client: {}", e)))?;

        let cache = Self {
            client,
            manager: Arc::new(OnceCell::new()),
        };
        match cache.ping().await {
            Ok(()) => tracing::info!("Connected to Redis"),
            Err(e) => tracing::warn!("Redis not reachable at startup, cache degraded: {}", e),
        }

        Ok(cache)
    }

    /// Shared connection, established on first use. The manager reconnects
    /// on its own once it exists; a failed first attempt is retried on the
    /// next call.
    async fn connection(&self) -> AppResult<ConnectionManager> {
        self.manager
            .get_or_try_init(|| {
                ConnectionManager::new_with_backoff(self.client.clone(), 2, 100, CONNECT_RETRIES)
            })
            .await
            .cloned()
            .map_err(|e| AppError::DependencyDegraded(format!("Failed to get Redis connection: {}", e)))
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.connection().await?;
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(|e| AppError::DependencyDegraded(format!("Failed to read {} from Redis: {}", key, e)))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let mut conn = self.connection().await?;
        // SETEX rejects a zero expiry
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, seconds)
            .await
            .map_err(|e| AppError::DependencyDegraded(format!("Failed to store {} in Redis: {}", key, e)))
    }

    async fn delete(&self, keys: &[String]) -> AppResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(keys.to_vec())
            .await
            .map_err(|e| AppError::DependencyDegraded(format!("Failed to delete keys from Redis: {}", e)))
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        let mut conn = self.connection().await?;
        conn.exists::<_, bool>(key)
            .await
            .map_err(|e| AppError::DependencyDegraded(format!("Failed to check {} in Redis: {}", key, e)))
    }

    async fn ping(&self) -> AppResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| AppError::DependencyDegraded(format!("Redis ping failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_server_degrades_instead_of_failing() {
        let cache = RedisCache::new("redis://127.0.0.1:1").await.unwrap();

        assert!(matches!(cache.get("book:1").await, Err(AppError::DependencyDegraded(_))));
        assert!(matches!(cache.ping().await, Err(AppError::DependencyDegraded(_))));
        assert!(!cache.manager.initialized());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        assert!(matches!(
            RedisCache::new("not a url").await,
            Err(AppError::Internal(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Needs Redis on localhost:6379. Run with: cargo test -- --ignored
    async fn test_operations_share_one_connection() {
        let cache = RedisCache::new("redis://127.0.0.1:6379").await.unwrap();
        assert!(cache.manager.initialized());

        let twin = cache.clone();
        cache
            .set("bookloan:test", "value", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(twin.get("bookloan:test").await.unwrap().as_deref(), Some("value"));
        twin.delete(&["bookloan:test".to_string()]).await.unwrap();
        assert!(!cache.exists("bookloan:test").await.unwrap());
        assert!(Arc::ptr_eq(&cache.manager, &twin.manager));
    }
}
