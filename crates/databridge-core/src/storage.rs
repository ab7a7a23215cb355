//! Storage contracts implemented by the target-store drivers

use crate::error::BridgeResult;
use crate::types::{BulkWrite, ResourceItem, compare_stamps};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

/// Target store receiving synchronized records
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Backend name used in logs and errors
    fn backend(&self) -> &str;

    /// Fetch a stored document
    async fn get(&self, id: &str) -> BridgeResult<Option<Value>>;

    /// Fetch a stored document, falling back to `default`
    async fn get_or(&self, id: &str, default: Value) -> BridgeResult<Value> {
        Ok(self.get(id).await?.unwrap_or(default))
    }

    /// Store a single document
    async fn put(&self, item: &ResourceItem) -> BridgeResult<()>;

    /// Store many documents, reporting the outcome per record
    ///
    /// A record rejected because the store already holds a newer stamp is
    /// reported as `WriteOutcome::Skipped`, which counts as success.
    async fn save_bulk(&self, items: Vec<ResourceItem>) -> BridgeResult<Vec<BulkWrite>>;

    /// Resolve candidate `id -> stamp` pairs to the stamps the store holds
    ///
    /// Ids unknown to the store may be absent from the result.
    async fn filter_bulk(
        &self,
        candidates: &HashMap<String, String>,
    ) -> BridgeResult<HashMap<String, String>>;
}

/// Per-record cache of the last stamp written
#[async_trait]
pub trait StampCache: Send + Sync {
    async fn get(&self, id: &str) -> BridgeResult<Option<String>>;

    async fn put(&self, id: &str, stamp: &str) -> BridgeResult<()>;

    async fn has(&self, id: &str) -> BridgeResult<bool>;
}

/// Record `stamp` unless the cache already holds the same or a newer one
pub async fn put_if_newer(cache: &dyn StampCache, id: &str, stamp: &str) -> BridgeResult<bool> {
    if let Some(cached) = cache.get(id).await?
        && compare_stamps(&cached, stamp) != Ordering::Less
    {
        debug!(resource_id = %id, cached = %cached, "Cache already holds a current stamp");
        return Ok(false);
    }
    cache.put(id, stamp).await?;
    Ok(true)
}
