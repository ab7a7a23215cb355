//! # Databridge Storage
//!
//! Target store drivers and the stamp cache, selected from the
//! `storage_config` section at startup.

pub mod couchdb;
pub mod elasticsearch;
mod http;
#[cfg(feature = "redis")]
pub mod redis_cache;

pub use couchdb::CouchDbStore;
pub use elasticsearch::ElasticsearchStore;
#[cfg(feature = "redis")]
pub use redis_cache::RedisStampCache;

use databridge_core::config::{BridgeConfig, StorageKind};
use databridge_core::{BridgeResult, DocumentStore, InMemoryCache, InMemoryStore, StampCache};
use std::sync::Arc;
use tracing::info;

/// Default search index alias
pub const DEFAULT_ALIAS: &str = "bridge";

/// Build the document store named by `storage_config.storage_type`
pub async fn build_store(config: &BridgeConfig) -> BridgeResult<Arc<dyn DocumentStore>> {
    let storage = &config.storage_config;
    let store: Arc<dyn DocumentStore> = match storage.storage_type {
        StorageKind::Couchdb => Arc::new(
            CouchDbStore::connect(&storage.base_url(), &storage.db_name, config.resource.clone())
                .await?,
        ),
        StorageKind::Elasticsearch => Arc::new(
            ElasticsearchStore::connect(
                &storage.base_url(),
                storage.db_name.clone(),
                storage.alias.clone().unwrap_or_else(|| DEFAULT_ALIAS.to_string()),
            )
            .await?,
        ),
        StorageKind::Memory => Arc::new(InMemoryStore::new()),
    };
    info!(backend = store.backend(), "Document store ready");
    Ok(store)
}

/// Build the stamp cache: Redis when `cache_host` is set, in-process otherwise
pub async fn build_cache(config: &BridgeConfig) -> BridgeResult<Arc<dyn StampCache>> {
    match config.storage_config.cache_url() {
        Some(url) => connect_cache(&url).await,
        None => {
            info!("Using in-process stamp cache");
            Ok(Arc::new(InMemoryCache::new()))
        }
    }
}

#[cfg(feature = "redis")]
async fn connect_cache(url: &str) -> BridgeResult<Arc<dyn StampCache>> {
    Ok(Arc::new(RedisStampCache::connect(url).await?))
}

#[cfg(not(feature = "redis"))]
async fn connect_cache(_url: &str) -> BridgeResult<Arc<dyn StampCache>> {
    tracing::warn!("cache_host configured but built without the `redis` feature, using in-process stamp cache");
    Ok(Arc::new(InMemoryCache::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backends() {
        let mut config = BridgeConfig::default();
        config.storage_config.storage_type = StorageKind::Memory;

        let store = build_store(&config).await.unwrap();
        assert_eq!(store.backend(), "memory");

        let cache = build_cache(&config).await.unwrap();
        cache.put("a", "2024").await.unwrap();
        assert!(cache.has("a").await.unwrap());
    }
}
