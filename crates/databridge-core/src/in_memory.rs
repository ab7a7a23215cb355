//! In-process store and stamp cache
//!
//! `InMemoryStore` applies the same newer-stamp validation as the document
//! store drivers, so it is a faithful stand-in for local runs and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::{BridgeError, BridgeResult};
use crate::storage::{DocumentStore, StampCache};
use crate::types::{BulkWrite, ResourceItem, WriteOutcome, is_current};

const BACKEND: &str = "memory";

/// Transient document store keyed by record id
#[derive(Clone, Default)]
pub struct InMemoryStore {
    docs: Arc<RwLock<HashMap<String, ResourceItem>>>,
    failing_lookups: Arc<AtomicU32>,
    failing_saves: Arc<AtomicU32>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, bypassing stamp validation
    pub fn insert(&self, item: ResourceItem) -> BridgeResult<()> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        docs.insert(item.id.clone(), item);
        Ok(())
    }

    /// Make the next `count` `filter_bulk` calls fail
    pub fn fail_next_lookups(&self, count: u32) {
        self.failing_lookups.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` `save_bulk` calls fail
    pub fn fail_next_saves(&self, count: u32) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Stamp currently stored for `id`
    pub fn stamp(&self, id: &str) -> Option<String> {
        self.docs
            .read()
            .ok()?
            .get(id)
            .map(|item| item.date_modified.clone())
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn write_one(docs: &mut HashMap<String, ResourceItem>, item: ResourceItem) -> WriteOutcome {
        match docs.get(&item.id) {
            Some(existing) if is_current(&existing.date_modified, &item.date_modified) => {
                WriteOutcome::Skipped
            }
            Some(_) => {
                docs.insert(item.id.clone(), item);
                WriteOutcome::Updated
            }
            None => {
                docs.insert(item.id.clone(), item);
                WriteOutcome::Created
            }
        }
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> BridgeError {
    BridgeError::storage(BACKEND, format!("Lock poisoned: {}", e))
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn get(&self, id: &str) -> BridgeResult<Option<Value>> {
        let docs = self.docs.read().map_err(poisoned)?;
        Ok(docs.get(id).map(ResourceItem::to_value))
    }

    async fn put(&self, item: &ResourceItem) -> BridgeResult<()> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        match Self::write_one(&mut docs, item.clone()) {
            WriteOutcome::Failed(reason) => Err(BridgeError::storage(BACKEND, reason)),
            _ => Ok(()),
        }
    }

    async fn save_bulk(&self, items: Vec<ResourceItem>) -> BridgeResult<Vec<BulkWrite>> {
        if Self::take_failure(&self.failing_saves) {
            return Err(BridgeError::storage(BACKEND, "injected save failure"));
        }
        let mut docs = self.docs.write().map_err(poisoned)?;
        Ok(items
            .into_iter()
            .map(|item| {
                let id = item.id.clone();
                BulkWrite::new(id, Self::write_one(&mut docs, item))
            })
            .collect())
    }

    async fn filter_bulk(
        &self,
        candidates: &HashMap<String, String>,
    ) -> BridgeResult<HashMap<String, String>> {
        if Self::take_failure(&self.failing_lookups) {
            return Err(BridgeError::Lookup("injected lookup failure".to_string()));
        }
        let docs = self.docs.read().map_err(poisoned)?;
        Ok(candidates
            .keys()
            .filter_map(|id| {
                docs.get(id)
                    .map(|item| (id.clone(), item.date_modified.clone()))
            })
            .collect())
    }
}

/// Stamp cache living in process memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    stamps: Arc<DashMap<String, String>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StampCache for InMemoryCache {
    async fn get(&self, id: &str) -> BridgeResult<Option<String>> {
        Ok(self.stamps.get(id).map(|stamp| stamp.value().clone()))
    }

    async fn put(&self, id: &str, stamp: &str) -> BridgeResult<()> {
        self.stamps.insert(id.to_string(), stamp.to_string());
        Ok(())
    }

    async fn has(&self, id: &str) -> BridgeResult<bool> {
        Ok(self.stamps.contains_key(id))
    }
}
