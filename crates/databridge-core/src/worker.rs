//! Fetch-and-store workers for the main and retry pools

use crate::backoff::Backoff;
use crate::clients::ApiClientPool;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::metrics::{BridgeMetrics, Counter};
use crate::pool::{WorkerFactory, WorkerSlot};
use crate::queue::{ResourceItemsQueue, WorkItem};
use crate::shutdown::Shutdown;
use crate::storage::{DocumentStore, StampCache, put_if_newer};
use crate::types::{
    FlowTag, RETRY_PRIORITY_BASE, ResourceItem, WriteOutcome, compare_stamps,
};
use futures::future::BoxFuture;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Collaborators shared by every worker of both pools
pub struct WorkerContext {
    pub config: Arc<BridgeConfig>,
    pub clients: Arc<ApiClientPool>,
    pub store: Arc<dyn DocumentStore>,
    pub cache: Option<Arc<dyn StampCache>>,
    pub retry_queue: Arc<ResourceItemsQueue>,
    pub metrics: Arc<BridgeMetrics>,
    pub shutdown: Shutdown,
}

impl WorkerContext {
    /// Move `work` to the retry flow, or drop it once its retries are spent
    ///
    /// The claim stays held while the record waits out its delay, so the id
    /// cannot be enqueued again in the meantime.
    pub fn schedule_retry(&self, mut work: WorkItem, reason: impl Into<String>) {
        let reason = reason.into();
        work.attempts += 1;
        work.last_error = Some(reason.clone());

        if work.attempts > self.config.worker_config.retries_count {
            self.metrics.record(Counter::Dropped);
            error!(
                message_id = "dropped",
                resource_id = %work.id(),
                attempts = work.attempts,
                reason = %reason,
                "Permanently failed after exhausting retries"
            );
            return;
        }

        work.claim.retag(FlowTag::Retry);
        self.metrics.record(Counter::Retried);
        let delay = self.config.worker_config.retry_delay(work.attempts);
        let priority = Some(RETRY_PRIORITY_BASE + i64::from(work.attempts));
        info!(
            message_id = "add_to_retry",
            resource_id = %work.id(),
            attempts = work.attempts,
            delay_secs = delay.as_secs_f64(),
            reason = %reason,
            "Put to retry queue"
        );

        let queue = Arc::clone(&self.retry_queue);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if shutdown.sleep(delay).await {
                queue.push(priority, work).await;
            }
        });
    }
}

/// Spawns [`ResourceItemWorker`]s consuming one queue
pub struct ItemWorkers {
    context: Arc<WorkerContext>,
    queue: Arc<ResourceItemsQueue>,
}

impl ItemWorkers {
    pub fn new(context: Arc<WorkerContext>, queue: Arc<ResourceItemsQueue>) -> Self {
        Self { context, queue }
    }
}

impl WorkerFactory for ItemWorkers {
    fn worker(&self, slot: WorkerSlot) -> BoxFuture<'static, ()> {
        let worker = ResourceItemWorker::new(Arc::clone(&self.context), Arc::clone(&self.queue), slot);
        Box::pin(worker.run())
    }
}

/// Pulls claimed records, fetches them upstream and writes them in bulks
pub struct ResourceItemWorker {
    context: Arc<WorkerContext>,
    queue: Arc<ResourceItemsQueue>,
    slot: WorkerSlot,
    bulk: Vec<(WorkItem, ResourceItem)>,
    bulk_opened: Instant,
    save_backoff: Backoff,
}

impl ResourceItemWorker {
    pub fn new(context: Arc<WorkerContext>, queue: Arc<ResourceItemsQueue>, slot: WorkerSlot) -> Self {
        Self {
            context,
            queue,
            slot,
            bulk: Vec::new(),
            bulk_opened: Instant::now(),
            save_backoff: Backoff::BULK_SAVE,
        }
    }

    fn bulk_due(&self) -> bool {
        let config = &self.context.config.worker_config;
        !self.bulk.is_empty()
            && (self.bulk.len() >= config.bulk_save_limit
                || self.bulk_opened.elapsed() >= config.bulk_save_interval())
    }

    pub async fn run(mut self) {
        let config = self.context.config.worker_config.clone();
        let shutdown = self.context.shutdown.clone();
        debug!(pool = %self.slot.pool(), worker_id = self.slot.id(), "Worker started");

        loop {
            if shutdown.is_triggered() || self.slot.should_retire() {
                break;
            }
            if self.bulk_due() {
                self.flush().await;
            }

            let Some(lease) = self.context.clients.acquire(config.queue_timeout()).await else {
                debug!(worker_id = self.slot.id(), "No API client available");
                if !shutdown.sleep(config.worker_sleep()).await {
                    break;
                }
                continue;
            };

            let next = tokio::select! {
                _ = shutdown.wait() => break,
                next = self.queue.pop_timeout(config.queue_timeout()) => next,
            };
            let Some((_, work)) = next else {
                continue;
            };

            let interval = lease.request_interval();
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }

            let started = Instant::now();
            let fetched = lease.client().get_item(work.id()).await;
            if fetched.is_ok() {
                lease.record(started.elapsed());
            }
            drop(lease);

            self.handle_fetched(work, fetched);
        }

        self.flush().await;
        debug!(pool = %self.slot.pool(), worker_id = self.slot.id(), "Worker stopped");
    }

    fn handle_fetched(&mut self, work: WorkItem, fetched: Result<ResourceItem, BridgeError>) {
        match fetched {
            Ok(record) => {
                if compare_stamps(&record.date_modified, &work.item.date_modified) == Ordering::Less {
                    self.context.metrics.record(Counter::NotActual);
                    info!(
                        message_id = "not_actual_docs",
                        resource_id = %work.id(),
                        fetched = %record.date_modified,
                        expected = %work.item.date_modified,
                        "Fetched record is older than the feed stub"
                    );
                    self.context.schedule_retry(work, "not actual");
                    return;
                }
                if self.bulk.is_empty() {
                    self.bulk_opened = Instant::now();
                }
                self.bulk.push((work, record));
            }
            Err(BridgeError::Gone(reason)) => {
                self.context.metrics.record(Counter::Dropped);
                warn!(
                    message_id = "dropped",
                    resource_id = %work.id(),
                    reason = %reason,
                    "Resource removed upstream"
                );
            }
            Err(e) => {
                warn!(
                    message_id = "exceptions",
                    resource_id = %work.id(),
                    error = %e,
                    "Failed to fetch resource"
                );
                self.context.schedule_retry(work, e.to_string());
            }
        }
    }

    /// Write the accumulated bulk and settle every record in it
    async fn flush(&mut self) {
        if self.bulk.is_empty() {
            return;
        }
        let bulk = std::mem::take(&mut self.bulk);
        let documents: Vec<ResourceItem> = bulk.iter().map(|(_, record)| record.clone()).collect();
        let size = documents.len();
        let started = Instant::now();

        let store = Arc::clone(&self.context.store);
        let saved = self
            .save_backoff
            .retry("save_bulk", || store.save_bulk(documents.clone()))
            .await;

        let results = match saved {
            Ok(results) => results,
            Err(e) => {
                for (work, _) in bulk {
                    self.context.schedule_retry(work, e.to_string());
                }
                return;
            }
        };
        info!(
            message_id = "save_documents",
            size,
            duration_ms = started.elapsed().as_millis() as u64,
            "Saved bulk"
        );

        let mut outcomes: std::collections::HashMap<String, WriteOutcome> =
            results.into_iter().map(|write| (write.id, write.outcome)).collect();
        for (work, record) in bulk {
            let outcome = outcomes
                .remove(work.id())
                .unwrap_or_else(|| WriteOutcome::Failed("missing from bulk response".to_string()));
            self.settle(work, record, outcome).await;
        }
    }

    async fn settle(&self, work: WorkItem, record: ResourceItem, outcome: WriteOutcome) {
        let counter = match &outcome {
            WriteOutcome::Created => Counter::Created,
            WriteOutcome::Updated => Counter::Updated,
            WriteOutcome::Skipped => Counter::Skipped,
            WriteOutcome::Failed(reason) => {
                self.context.metrics.record(Counter::Failed);
                warn!(
                    message_id = "exceptions",
                    resource_id = %work.id(),
                    reason = %reason,
                    "Failed to save resource"
                );
                self.context.schedule_retry(work, reason.clone());
                return;
            }
        };
        self.context.metrics.record(counter);
        debug!(
            resource_id = %record.id,
            date_modified = %record.date_modified,
            outcome = outcome.reason(),
            "Resource saved"
        );

        if let Some(cache) = &self.context.cache
            && let Err(e) = put_if_newer(cache.as_ref(), &record.id, &record.date_modified).await
        {
            warn!(resource_id = %record.id, error = %e, "Failed to update stamp cache");
        }
        drop(work);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{FlakyFactory, test_pool};
    use crate::in_memory::{InMemoryCache, InMemoryStore};
    use crate::queue::PendingSet;
    use crate::shutdown::ShutdownTrigger;
    use std::time::Duration;

    struct Harness {
        context: Arc<WorkerContext>,
        store: InMemoryStore,
        cache: InMemoryCache,
        pending: PendingSet,
        _trigger: ShutdownTrigger,
    }

    fn harness(retries_count: u32) -> Harness {
        let mut config = BridgeConfig::default();
        config.resources_api_server = "http://localhost:6543".to_string();
        config.worker_config.retries_count = retries_count;
        config.worker_config.retry_default_timeout = 1.0;

        let store = InMemoryStore::new();
        let cache = InMemoryCache::new();
        let (trigger, shutdown) = Shutdown::channel();
        let context = Arc::new(WorkerContext {
            config: Arc::new(config),
            clients: test_pool(Arc::new(FlakyFactory::default()), 1, 1),
            store: Arc::new(store.clone()),
            cache: Some(Arc::new(cache.clone())),
            retry_queue: Arc::new(ResourceItemsQueue::new("retry", -1)),
            metrics: Arc::new(BridgeMetrics::new()),
            shutdown,
        });
        Harness {
            context,
            store,
            cache,
            pending: PendingSet::new(),
            _trigger: trigger,
        }
    }

    fn work(pending: &PendingSet, id: &str, stamp: &str) -> WorkItem {
        let claim = pending.claim(id, FlowTag::Normal).unwrap();
        WorkItem::new(Some(0), ResourceItem::new(id, stamp), claim)
    }

    fn worker(context: &Arc<WorkerContext>) -> ResourceItemWorker {
        ResourceItemWorker::new(
            Arc::clone(context),
            Arc::new(ResourceItemsQueue::new("resource_items", 10)),
            WorkerSlot::detached("workers", 0),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_drop_after_budget() {
        let h = harness(1);
        h.context.schedule_retry(work(&h.pending, "a", "2024"), "boom");
        assert_eq!(h.pending.tag_of("a"), Some(FlowTag::Retry));
        assert!(h.context.retry_queue.is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let (priority, retried) = h.context.retry_queue.try_pop().unwrap();
        assert_eq!(priority, Some(RETRY_PRIORITY_BASE + 1));
        assert_eq!(retried.attempts, 1);

        h.context.schedule_retry(retried, "boom again");
        assert!(!h.pending.contains("a"));
        assert_eq!(h.context.metrics.get(Counter::Dropped), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_actual_goes_to_retry_and_gone_is_dropped() {
        let h = harness(3);
        let mut worker = worker(&h.context);

        worker.handle_fetched(
            work(&h.pending, "old", "2024-02-01T00:00:00Z"),
            Ok(ResourceItem::new("old", "2024-01-01T00:00:00Z")),
        );
        assert_eq!(h.pending.tag_of("old"), Some(FlowTag::Retry));
        assert_eq!(h.context.metrics.get(Counter::NotActual), 1);

        worker.handle_fetched(
            work(&h.pending, "gone", "2024"),
            Err(BridgeError::Gone("archived".into())),
        );
        assert!(!h.pending.contains("gone"));
        assert_eq!(h.context.metrics.get(Counter::Dropped), 1);
        assert!(worker.bulk.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_writes_updates_cache_and_releases_claims() {
        let h = harness(3);
        h.store.insert(ResourceItem::new("newer", "2025-01-01T00:00:00Z")).unwrap();
        let mut worker = worker(&h.context);

        for (id, stamp) in [("fresh", "2024-01-01T00:00:00Z"), ("newer", "2024-01-01T00:00:00Z")] {
            let record = ResourceItem::new(id, stamp);
            worker.handle_fetched(work(&h.pending, id, stamp), Ok(record));
        }
        worker.flush().await;

        assert_eq!(h.context.metrics.get(Counter::Created), 1);
        assert_eq!(h.context.metrics.get(Counter::Skipped), 1);
        assert!(h.pending.is_empty());
        assert_eq!(
            h.cache.get("fresh").await.unwrap().as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(h.store.stamp("newer").as_deref(), Some("2025-01-01T00:00:00Z"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_failures_exhausted_send_bulk_to_retry() {
        let h = harness(3);
        h.store.fail_next_saves(3);
        let mut worker = worker(&h.context);
        worker.handle_fetched(
            work(&h.pending, "a", "2024"),
            Ok(ResourceItem::new("a", "2024")),
        );
        worker.flush().await;

        assert_eq!(h.pending.tag_of("a"), Some(FlowTag::Retry));
        assert_eq!(h.context.metrics.get(Counter::Retried), 1);
        assert!(h.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_loop_processes_queue_until_shutdown() {
        let store = InMemoryStore::new();
        let (trigger, shutdown) = Shutdown::channel();
        let clients = test_pool(Arc::new(FlakyFactory::default()), 1, 1);
        clients.fill_api_clients_queue().await.unwrap();
        let context = Arc::new(WorkerContext {
            config: Arc::new(BridgeConfig::default()),
            clients,
            store: Arc::new(store.clone()),
            cache: None,
            retry_queue: Arc::new(ResourceItemsQueue::new("retry", -1)),
            metrics: Arc::new(BridgeMetrics::new()),
            shutdown,
        });
        let queue = Arc::new(ResourceItemsQueue::new("resource_items", 10));
        let pending = PendingSet::new();
        for id in ["a", "b"] {
            let item = work(&pending, id, "2024-01-01T00:00:00Z");
            assert!(queue.try_push(Some(0), item).is_ok());
        }

        let slot = WorkerSlot::detached("workers", 0);
        let worker = ResourceItemWorker::new(Arc::clone(&context), Arc::clone(&queue), slot);
        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.trigger();
        handle.await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(pending.is_empty());
    }
}
