//! Pending-set of record ids currently owned by the pipeline
//!
//! An id is claimed once before it enters the resource-items queue and stays
//! claimed until its `PendingClaim` is dropped: after a successful write, a
//! permanent drop, or when the task holding it dies. Moving a record to the
//! retry flow retags the claim instead of releasing it, so a re-delivered
//! candidate is rejected whichever flow currently owns the id.

use crate::types::{FlowTag, Priority, ResourceItem};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

/// Set of ids pending in the normal or retry flow
#[derive(Debug, Clone, Default)]
pub struct PendingSet {
    ids: Arc<DashMap<String, FlowTag>>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `id`; `None` when it is already pending in any flow
    pub fn claim(&self, id: &str, tag: FlowTag) -> Option<PendingClaim> {
        match self.ids.entry(id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(tag);
                Some(PendingClaim {
                    id: id.to_string(),
                    tag,
                    ids: Arc::clone(&self.ids),
                })
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }

    /// Flow currently owning `id`
    pub fn tag_of(&self, id: &str) -> Option<FlowTag> {
        self.ids.get(id).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of ids owned by `tag`
    pub fn count(&self, tag: FlowTag) -> usize {
        self.ids.iter().filter(|entry| *entry.value() == tag).count()
    }
}

/// Ownership of one pending id; releases it on drop
#[derive(Debug)]
pub struct PendingClaim {
    id: String,
    tag: FlowTag,
    ids: Arc<DashMap<String, FlowTag>>,
}

impl PendingClaim {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tag(&self) -> FlowTag {
        self.tag
    }

    /// Move the claim to another flow without releasing the id
    pub fn retag(&mut self, tag: FlowTag) {
        self.tag = tag;
        if let Some(mut entry) = self.ids.get_mut(&self.id) {
            *entry = tag;
        }
    }
}

impl Drop for PendingClaim {
    fn drop(&mut self) {
        self.ids.remove(&self.id);
    }
}

/// A claimed record travelling through the resource-items and retry queues
#[derive(Debug)]
pub struct WorkItem {
    /// Priority the record was first queued with
    pub priority: Priority,
    /// Feed stub (or raw record for the rule filter)
    pub item: ResourceItem,
    pub claim: PendingClaim,
    /// Failed processing attempts so far
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl WorkItem {
    pub fn new(priority: Priority, item: ResourceItem, claim: PendingClaim) -> Self {
        Self {
            priority,
            item,
            claim,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.item.id
    }
}
