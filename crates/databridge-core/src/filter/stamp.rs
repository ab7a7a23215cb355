//! Stamp-comparison change filter

use super::{Batch, ChangeFilter, collect_batch};
use crate::backoff::Backoff;
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::{BridgeMetrics, Counter};
use crate::queue::{InputQueue, Offer, PendingSet, ResourceItemsQueue, offer};
use crate::shutdown::Shutdown;
use crate::storage::DocumentStore;
use crate::types::is_current;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Forwards candidates whose stamp is newer than the one held by the store
pub struct StampFilter {
    name: String,
    store: Arc<dyn DocumentStore>,
    pending: PendingSet,
    metrics: Arc<BridgeMetrics>,
    bulk_query_limit: usize,
    bulk_query_interval: Duration,
    backoff: Backoff,
}

impl StampFilter {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        pending: PendingSet,
        metrics: Arc<BridgeMetrics>,
        bulk_query_limit: usize,
        bulk_query_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            pending,
            metrics,
            bulk_query_limit: bulk_query_limit.max(1),
            bulk_query_interval,
            backoff: Backoff::LOOKUP,
        }
    }

    /// Override the lookup retry schedule
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Resolve one batch against the store and forward what changed
    ///
    /// Returns `Ok(false)` when shutdown interrupted the forwarding.
    pub async fn check_bulk(
        &self,
        batch: Batch,
        output: &ResourceItemsQueue,
        shutdown: &Shutdown,
    ) -> BridgeResult<bool> {
        let candidates = batch.stamps();
        debug!(filter = %self.name, size = candidates.len(), "Send check bulk");
        let started = tokio::time::Instant::now();

        let stored = self
            .backoff
            .retry("filter_bulk", || self.store.filter_bulk(&candidates))
            .await
            .map_err(|e| BridgeError::task_terminated(&self.name, format!("lookup failed: {}", e)))?;
        debug!(
            filter = %self.name,
            duration_ms = started.elapsed().as_millis() as u64,
            "Bulk check finished"
        );

        for (priority, item) in batch.into_entries() {
            if let Some(stamp) = stored.get(&item.id)
                && is_current(stamp, &item.date_modified)
            {
                self.metrics.record(Counter::FilterSkipped);
                debug!(
                    message_id = "skipped",
                    resource_id = %item.id,
                    "Skipped: store holds a current version"
                );
                continue;
            }

            let id = item.id.clone();
            let offered = tokio::select! {
                _ = shutdown.wait() => return Ok(false),
                offered = offer(&self.pending, output, priority, item) => offered,
            };
            match offered {
                Offer::Enqueued => {
                    self.metrics.record(Counter::Enqueued);
                    debug!(
                        message_id = "add_to_resource_items_queue",
                        resource_id = %id,
                        ?priority,
                        "Put to main queue"
                    );
                }
                Offer::Duplicate => {
                    self.metrics.record(Counter::Duplicate);
                    debug!(
                        message_id = "skipped",
                        resource_id = %id,
                        "Skipped: already pending with same id"
                    );
                }
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl ChangeFilter for StampFilter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        input: Arc<InputQueue>,
        output: Arc<ResourceItemsQueue>,
        shutdown: Shutdown,
    ) -> BridgeResult<()> {
        info!(
            filter = %self.name,
            backend = self.store.backend(),
            limit = self.bulk_query_limit,
            "Stamp filter started"
        );
        while let Some(batch) = collect_batch(
            &input,
            self.bulk_query_limit,
            self.bulk_query_interval,
            &shutdown,
        )
        .await
        {
            if batch.is_empty() {
                continue;
            }
            if !self.check_bulk(batch, &output, &shutdown).await? {
                break;
            }
        }
        info!(filter = %self.name, "Stamp filter stopped");
        Ok(())
    }
}
