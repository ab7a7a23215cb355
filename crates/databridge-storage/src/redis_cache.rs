//! Redis-backed stamp cache

use async_trait::async_trait;
use databridge_core::{BridgeError, BridgeResult, StampCache};
use deadpool_redis::{Config as PoolConfig, Connection as PooledConnection, Pool, Runtime};
use redis::{AsyncCommands, ErrorKind as RedisErrorKind, RedisError};
use tracing::{debug, info};

const BACKEND: &str = "redis";

/// Sanitize Redis errors before they reach logs
fn sanitize_error(error: &RedisError) -> String {
    match error.kind() {
        RedisErrorKind::AuthenticationFailed => "Authentication failed".to_string(),
        RedisErrorKind::TypeError => "Data type error".to_string(),
        RedisErrorKind::BusyLoadingError => "Redis is loading data".to_string(),
        RedisErrorKind::ReadOnly => "Redis is read-only".to_string(),
        _ if error.is_connection_refusal() || error.is_connection_dropped() => {
            "Connection error".to_string()
        }
        _ if error.is_timeout() => "Operation timeout".to_string(),
        _ => "Redis operation failed".to_string(),
    }
}

fn redis_error(error: RedisError) -> BridgeError {
    BridgeError::storage(BACKEND, sanitize_error(&error))
}

/// Stamp cache keyed by record id, shared through a connection pool
#[derive(Clone)]
pub struct RedisStampCache {
    pool: Pool,
}

impl std::fmt::Debug for RedisStampCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStampCache")
            .field("status", &self.pool.status())
            .finish()
    }
}

impl RedisStampCache {
    /// Build the pool and verify connectivity with a `PING`
    pub async fn connect(url: &str) -> BridgeResult<Self> {
        let pool = PoolConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| {
                BridgeError::storage(BACKEND, format!("Failed to create connection pool: {}", e))
            })?;
        let cache = Self { pool };

        let mut conn = cache.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        info!(url = %url, "Connected to stamp cache");
        Ok(cache)
    }

    async fn connection(&self) -> BridgeResult<PooledConnection> {
        self.pool.get().await.map_err(|e| {
            BridgeError::storage(BACKEND, format!("Failed to get connection from pool: {}", e))
        })
    }
}

#[async_trait]
impl StampCache for RedisStampCache {
    async fn get(&self, id: &str) -> BridgeResult<Option<String>> {
        let mut conn = self.connection().await?;
        conn.get(id).await.map_err(redis_error)
    }

    async fn put(&self, id: &str, stamp: &str) -> BridgeResult<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.set(id, stamp).await.map_err(redis_error)?;
        debug!(resource_id = %id, stamp = %stamp, "Stamp cached");
        Ok(())
    }

    async fn has(&self, id: &str) -> BridgeResult<bool> {
        let mut conn = self.connection().await?;
        conn.exists(id).await.map_err(redis_error)
    }
}
