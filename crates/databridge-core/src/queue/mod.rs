//! Queues connecting the pipeline stages

mod pending;
mod priority;

pub use pending::{PendingClaim, PendingSet, WorkItem};
pub use priority::PriorityQueue;

use crate::types::{FlowTag, Priority, ResourceItem};

/// Feeder output awaiting change filtering
pub type InputQueue = PriorityQueue<ResourceItem>;

/// Claimed records awaiting fetch and store (also used for the retry queue)
pub type ResourceItemsQueue = PriorityQueue<WorkItem>;

/// Result of offering a candidate to a deduplicated queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Enqueued,
    /// Already pending in the normal or retry flow
    Duplicate,
}

/// Claim `item` and push it, waiting for capacity
///
/// The claim is taken before the push, so two filters racing on the same id
/// cannot both enqueue it.
pub async fn offer(
    pending: &PendingSet,
    queue: &ResourceItemsQueue,
    priority: Priority,
    item: ResourceItem,
) -> Offer {
    match pending.claim(&item.id, FlowTag::Normal) {
        Some(claim) => {
            queue.push(priority, WorkItem::new(priority, item, claim)).await;
            Offer::Enqueued
        }
        None => Offer::Duplicate,
    }
}
