//! JMESPath change filter

use super::ChangeFilter;
use crate::backoff::Backoff;
use crate::config::RuleFilterConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::{BridgeMetrics, Counter};
use crate::queue::{InputQueue, Offer, PendingSet, ResourceItemsQueue, offer};
use crate::shutdown::Shutdown;
use crate::storage::StampCache;
use crate::types::{ResourceItem, is_current};
use async_trait::async_trait;
use jmespath::{Expression, ToJmespath};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Forwards raw records for which every configured JMESPath expression is truthy
///
/// Records whose stamp equals the cached last-seen stamp are skipped before
/// any expression runs. Forwarded records carry no priority.
pub struct RuleFilter {
    name: String,
    cache: Arc<dyn StampCache>,
    pending: PendingSet,
    metrics: Arc<BridgeMetrics>,
    filters: Vec<Expression<'static>>,
    backoff: Backoff,
}

/// Compile the configured expressions, naming the first invalid one
pub fn compile_filters(config: &RuleFilterConfig) -> BridgeResult<Vec<Expression<'static>>> {
    config
        .filters
        .iter()
        .map(|expr| {
            jmespath::compile(expr).map_err(|e| {
                BridgeError::config("filters", format!("Invalid expression '{}': {}", expr, e))
            })
        })
        .collect()
}

impl RuleFilter {
    pub fn new(
        name: impl Into<String>,
        cache: Arc<dyn StampCache>,
        pending: PendingSet,
        metrics: Arc<BridgeMetrics>,
        config: &RuleFilterConfig,
    ) -> BridgeResult<Self> {
        let name = name.into();
        let filters = compile_filters(config)?;
        info!(filter = %name, expressions = filters.len(), "Init JMESPath filter");
        Ok(Self {
            name,
            cache,
            pending,
            metrics,
            filters,
            backoff: Backoff::LOOKUP,
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether every expression is truthy for `item`
    ///
    /// An expression that fails at evaluation time counts as not matched.
    pub fn matches(&self, item: &ResourceItem) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        let doc = match item.to_value().to_jmespath() {
            Ok(doc) => doc,
            Err(e) => {
                warn!(resource_id = %item.id, error = %e, "Record is not searchable");
                return false;
            }
        };
        self.filters.iter().all(|expr| match expr.search(doc.clone()) {
            Ok(result) => result.is_truthy(),
            Err(e) => {
                warn!(
                    resource_id = %item.id,
                    expression = expr.as_str(),
                    error = %e,
                    "Filter expression failed"
                );
                false
            }
        })
    }

    /// Filter one record; `Ok(false)` when shutdown interrupted forwarding
    pub async fn process(
        &self,
        item: ResourceItem,
        output: &ResourceItemsQueue,
        shutdown: &Shutdown,
    ) -> BridgeResult<bool> {
        let cached = self
            .backoff
            .retry("cache_get", || self.cache.get(&item.id))
            .await
            .map_err(|e| {
                BridgeError::task_terminated(&self.name, format!("cache lookup failed: {}", e))
            })?;

        if let Some(stamp) = cached
            && is_current(&stamp, &item.date_modified)
        {
            self.metrics.record(Counter::FilterSkipped);
            info!(
                message_id = "skipped",
                resource_id = %item.id,
                "Not modified from last check. Skipping"
            );
            return Ok(true);
        }

        if !self.matches(&item) {
            self.metrics.record(Counter::FilterSkipped);
            info!(message_id = "skipped", resource_id = %item.id, "Skip: rules not matched");
            return Ok(true);
        }

        let id = item.id.clone();
        let offered = tokio::select! {
            _ = shutdown.wait() => return Ok(false),
            offered = offer(&self.pending, output, None, item) => offered,
        };
        match offered {
            Offer::Enqueued => {
                self.metrics.record(Counter::Enqueued);
                debug!(resource_id = %id, "Put to filtered queue");
            }
            Offer::Duplicate => {
                self.metrics.record(Counter::Duplicate);
                debug!(message_id = "skipped", resource_id = %id, "Skipped: already pending");
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl ChangeFilter for RuleFilter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        input: Arc<InputQueue>,
        output: Arc<ResourceItemsQueue>,
        shutdown: Shutdown,
    ) -> BridgeResult<()> {
        info!(filter = %self.name, "Rule filter started");
        loop {
            let (_, item) = tokio::select! {
                _ = shutdown.wait() => break,
                entry = input.pop() => entry,
            };
            if !self.process(item, &output, &shutdown).await? {
                break;
            }
        }
        info!(filter = %self.name, "Rule filter stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryCache;
    use serde_json::json;

    fn filter(cache: &InMemoryCache, filters: &[&str]) -> RuleFilter {
        let config = RuleFilterConfig {
            filters: filters.iter().map(|f| f.to_string()).collect(),
        };
        RuleFilter::new(
            "rules-0",
            Arc::new(cache.clone()),
            PendingSet::new(),
            Arc::new(BridgeMetrics::new()),
            &config,
        )
        .unwrap()
    }

    fn doc(stamp: &str, status: &str) -> ResourceItem {
        ResourceItem::new("test_id", stamp).with_field("status", json!(status))
    }

    #[tokio::test]
    async fn test_cached_stamp_skips_record() {
        let cache = InMemoryCache::new();
        cache.put("test_id", "1970-01-01").await.unwrap();
        let filter = filter(&cache, &[]);
        let output = ResourceItemsQueue::new("resource_items", 10);
        let (_trigger, shutdown) = Shutdown::channel();

        filter
            .process(doc("1970-01-01", "draft.pending"), &output, &shutdown)
            .await
            .unwrap();
        assert!(output.is_empty());

        filter
            .process(doc("1970-01-02", "draft.pending"), &output, &shutdown)
            .await
            .unwrap();
        let (priority, work) = output.try_pop().unwrap();
        assert_eq!(priority, None);
        assert_eq!(work.item, doc("1970-01-02", "draft.pending"));
    }

    #[tokio::test]
    async fn test_contains_expression() {
        let cache = InMemoryCache::new();
        let filter = filter(&cache, &["contains([`test_status`], status)"]);
        let output = ResourceItemsQueue::new("resource_items", 10);
        let (_trigger, shutdown) = Shutdown::channel();

        filter
            .process(doc("1970-01-02", "spam_status"), &output, &shutdown)
            .await
            .unwrap();
        assert!(output.is_empty());

        filter
            .process(doc("1970-01-02", "test_status"), &output, &shutdown)
            .await
            .unwrap();
        let (priority, work) = output.try_pop().unwrap();
        assert_eq!(priority, None);
        assert_eq!(work.item, doc("1970-01-02", "test_status"));
    }

    #[test]
    fn test_every_expression_must_hold() {
        let cache = InMemoryCache::new();
        let filter = filter(
            &cache,
            &[
                "status == 'active' || status == 'complete'",
                "length(lots[?status == 'active']) > `0`",
                "contains(['general', 'special'], procuringEntity.kind)",
            ],
        );

        let matching = ResourceItem::new("1", "2024")
            .with_field("status", json!("active"))
            .with_field("lots", json!([{"status": "cancelled"}, {"status": "active"}]))
            .with_field("procuringEntity", json!({"kind": "special"}));
        assert!(filter.matches(&matching));

        let wrong_kind = matching
            .clone()
            .with_field("procuringEntity", json!({"kind": "other"}));
        assert!(!filter.matches(&wrong_kind));

        let no_active_lot = matching
            .clone()
            .with_field("lots", json!([{"status": "cancelled"}]));
        assert!(!filter.matches(&no_active_lot));

        let draft = matching.with_field("status", json!("draft"));
        assert!(!filter.matches(&draft));
    }

    #[test]
    fn test_invalid_expression_is_config_error() {
        let config = RuleFilterConfig {
            filters: vec!["contains([`a`], ".to_string()],
        };
        assert!(matches!(
            compile_filters(&config),
            Err(BridgeError::Config { ref key, .. }) if key == "filters"
        ));
    }
}
