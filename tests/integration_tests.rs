//! End-to-end pipeline tests
//!
//! These tests run the whole bridge against a scripted feed, in-process
//! API sessions and the in-memory store, then stop it cooperatively.

use async_trait::async_trait;
use databridge::core::config::StorageKind;
use databridge::core::metrics::Counter;
use databridge::core::{ClientFactory, FeedStream, InMemoryStore, ResourceClient, ShutdownTrigger};
use databridge::{
    BridgeConfig, BridgeError, BridgeResult, DataBridge, ResourceFeeder, ResourceItem, Shutdown,
};
use futures::StreamExt;
use futures::stream;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Feed that yields a fixed list of stubs, then stays open
struct ScriptedFeeder {
    stubs: Vec<(Option<i64>, ResourceItem)>,
}

impl ResourceFeeder for ScriptedFeeder {
    fn get_resource_items(&self) -> FeedStream {
        let stubs: Vec<BridgeResult<_>> = self.stubs.iter().cloned().map(Ok).collect();
        stream::iter(stubs).chain(stream::pending()).boxed()
    }
}

/// Upstream records by id; anything absent is gone
struct UpstreamClient {
    user_agent: String,
    records: Arc<HashMap<String, ResourceItem>>,
}

#[async_trait]
impl ResourceClient for UpstreamClient {
    fn user_agent(&self) -> &str {
        &self.user_agent
    }

    async fn get_item(&self, id: &str) -> BridgeResult<ResourceItem> {
        self.records
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::Gone(id.to_string()))
    }

    async fn extract_credentials(&self, id: &str) -> BridgeResult<Value> {
        Ok(json!({"id": id}))
    }
}

struct UpstreamFactory {
    records: Arc<HashMap<String, ResourceItem>>,
}

#[async_trait]
impl ClientFactory for UpstreamFactory {
    async fn create(&self, user_agent: &str) -> BridgeResult<Arc<dyn ResourceClient>> {
        Ok(Arc::new(UpstreamClient {
            user_agent: user_agent.to_string(),
            records: Arc::clone(&self.records),
        }))
    }
}

fn fast_config() -> BridgeConfig {
    let mut config = BridgeConfig {
        resources_api_server: "http://api.example.test".to_string(),
        workers_min: 1,
        workers_max: 2,
        retry_workers_min: 1,
        retry_workers_max: 1,
        watch_interval: 0.2,
        queues_controller_timeout: 0.2,
        performance_window: 1.0,
        ..BridgeConfig::default()
    };
    config.storage_config.storage_type = StorageKind::Memory;
    config.storage_config.bulk_query_interval = 0.05;
    config.worker_config.bulk_save_interval = 0.05;
    config.worker_config.queue_timeout = 0.05;
    config.worker_config.worker_sleep = 0.05;
    config.worker_config.retry_default_timeout = 0.05;
    config.worker_config.retries_count = 2;
    config
}

fn record(id: &str, stamp: &str) -> ResourceItem {
    ResourceItem::new(id, stamp).with_field("status", json!("active"))
}

async fn start(
    stubs: Vec<(Option<i64>, ResourceItem)>,
    upstream: Vec<ResourceItem>,
    store: InMemoryStore,
) -> (
    Arc<DataBridge>,
    ShutdownTrigger,
    tokio::task::JoinHandle<BridgeResult<()>>,
) {
    let records = upstream.into_iter().map(|r| (r.id.clone(), r)).collect();
    let bridge = Arc::new(
        DataBridge::new(
            fast_config(),
            Arc::new(ScriptedFeeder { stubs }),
            Arc::new(UpstreamFactory {
                records: Arc::new(records),
            }),
            Arc::new(store),
        )
        .expect("Valid configuration"),
    );
    let (trigger, shutdown) = Shutdown::channel();
    let handle = tokio::spawn({
        let bridge = Arc::clone(&bridge);
        async move { bridge.run(shutdown).await }
    });
    (bridge, trigger, handle)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Condition not reached in time");
}

#[tokio::test]
async fn test_changed_records_reach_the_store() {
    let store = InMemoryStore::new();
    store
        .insert(record("current", "2024-01-05T00:00:00Z"))
        .expect("Seed store");
    store
        .insert(record("outdated", "2024-01-01T00:00:00Z"))
        .expect("Seed store");

    let stubs = vec![
        (Some(1), ResourceItem::new("new", "2024-01-02T00:00:00Z")),
        (Some(1), ResourceItem::new("current", "2024-01-03T00:00:00Z")),
        (Some(0), ResourceItem::new("outdated", "2024-01-04T00:00:00Z")),
    ];
    let upstream = vec![
        record("new", "2024-01-02T00:00:00Z"),
        record("current", "2024-01-05T00:00:00Z"),
        record("outdated", "2024-01-04T00:00:00Z"),
    ];

    let (bridge, trigger, handle) = start(stubs, upstream, store.clone()).await;

    wait_until(|| {
        store.stamp("new").is_some()
            && store.stamp("outdated").as_deref() == Some("2024-01-04T00:00:00Z")
            && bridge.pending().is_empty()
    })
    .await;

    trigger.trigger();
    handle.await.expect("Bridge task").expect("Bridge run");

    let metrics = bridge.metrics();
    assert_eq!(metrics.get(Counter::Created), 1);
    assert_eq!(metrics.get(Counter::Updated), 1);
    assert_eq!(metrics.get(Counter::FilterSkipped), 1);
    assert_eq!(
        store.stamp("current").as_deref(),
        Some("2024-01-05T00:00:00Z")
    );
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn test_gone_records_are_dropped_and_released() {
    let store = InMemoryStore::new();
    let stubs = vec![
        (Some(0), ResourceItem::new("removed", "2024-01-02T00:00:00Z")),
        (Some(0), ResourceItem::new("kept", "2024-01-02T00:00:00Z")),
    ];
    let upstream = vec![record("kept", "2024-01-02T00:00:00Z")];

    let (bridge, trigger, handle) = start(stubs, upstream, store.clone()).await;

    wait_until(|| {
        store.stamp("kept").is_some()
            && bridge.metrics().get(Counter::Dropped) == 1
            && bridge.pending().is_empty()
    })
    .await;

    trigger.trigger();
    handle.await.expect("Bridge task").expect("Bridge run");

    assert!(store.stamp("removed").is_none());
    assert_eq!(bridge.metrics().get(Counter::Retried), 0);
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected() {
    let config = BridgeConfig {
        resources_api_server: String::new(),
        ..fast_config()
    };
    let result = DataBridge::new(
        config,
        Arc::new(ScriptedFeeder { stubs: Vec::new() }),
        Arc::new(UpstreamFactory {
            records: Arc::new(HashMap::new()),
        }),
        Arc::new(InMemoryStore::new()),
    );
    assert!(matches!(
        result,
        Err(BridgeError::Config { ref key, .. }) if key == "resources_api_server"
    ));
}

#[tokio::test]
async fn test_shutdown_before_any_work() {
    let (bridge, trigger, handle) = start(Vec::new(), Vec::new(), InMemoryStore::new()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    trigger.trigger();

    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("Bridge stops promptly")
        .expect("Bridge task")
        .expect("Bridge run");
    assert_eq!(bridge.metrics().snapshot().created, 0);
}
