//! Change filters
//!
//! A change filter drains the input queue and forwards only records that
//! are not yet current in the target store, claiming each forwarded id in
//! the pending set. Two variants exist:
//!
//! - [`StampFilter`] micro-batches candidates and compares their stamps with
//!   the store's (`filter_bulk`, backed by a view query or a multi-get
//!   depending on the driver)
//! - [`RuleFilter`] evaluates JMESPath expressions over the raw record and consults the
//!   stamp cache
//!
//! Both run until shutdown or until a lookup exhausts its retries, in which
//! case the error terminates the task and is picked up by the liveness
//! supervisor.

mod rules;
mod stamp;

pub use rules::{RuleFilter, compile_filters};
pub use stamp::StampFilter;

use crate::error::BridgeResult;
use crate::queue::{InputQueue, ResourceItemsQueue};
use crate::shutdown::Shutdown;
use crate::types::{Priority, ResourceItem};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Common contract of the change filter variants
#[async_trait]
pub trait ChangeFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Filter `input` into `output` until shutdown or a fatal error
    async fn run(
        &self,
        input: Arc<InputQueue>,
        output: Arc<ResourceItemsQueue>,
        shutdown: Shutdown,
    ) -> BridgeResult<()>;
}

/// Candidates collected during one batching cycle
#[derive(Debug, Default)]
pub struct Batch {
    entries: HashMap<String, (Priority, ResourceItem)>,
    /// Arrival order, used to forward in the order items were read
    order: Vec<String>,
}

impl Batch {
    /// Add a candidate; a repeated id keeps its slot and takes the latest stub
    pub fn add(&mut self, priority: Priority, item: ResourceItem) {
        if !self.entries.contains_key(&item.id) {
            self.order.push(item.id.clone());
        }
        self.entries.insert(item.id.clone(), (priority, item));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `id -> stamp` pairs sent to the store lookup
    pub fn stamps(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .map(|(id, (_, item))| (id.clone(), item.date_modified.clone()))
            .collect()
    }

    /// Consume the batch in arrival order
    pub fn into_entries(mut self) -> Vec<(Priority, ResourceItem)> {
        self.order
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect()
    }
}

/// Collect one batch: stop at `limit` entries or once `interval` has elapsed
///
/// Returns `None` when shutdown is requested.
pub async fn collect_batch(
    input: &InputQueue,
    limit: usize,
    interval: Duration,
    shutdown: &Shutdown,
) -> Option<Batch> {
    let deadline = Instant::now() + interval;
    let mut batch = Batch::default();

    while batch.len() < limit {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::select! {
            _ = shutdown.wait() => return None,
            entry = input.pop_timeout(remaining) => match entry {
                Some((priority, item)) => batch.add(priority, item),
                None => break,
            },
        }
    }

    Some(batch)
}
