//! Bounded priority queue with async backpressure
//!
//! Entries are delivered in non-decreasing priority order, ties broken by
//! arrival order. A full queue suspends producers, an empty queue suspends
//! consumers. Capacity ≤ 0 makes the queue unbounded.

use crate::types::Priority;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

struct Entry<T> {
    priority: Priority,
    seq: u64,
    value: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // BinaryHeap is a max-heap: invert so the lowest (priority, seq) pops first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct Inner<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

/// Bounded async priority queue
pub struct PriorityQueue<T> {
    name: String,
    capacity: Option<usize>,
    inner: Mutex<Inner<T>>,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> PriorityQueue<T> {
    /// Create a queue; `capacity <= 0` means unbounded
    pub fn new(name: impl Into<String>, capacity: i64) -> Self {
        let capacity = usize::try_from(capacity).ok().filter(|c| *c > 0);
        Self {
            name: name.into(),
            capacity,
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_room(&self, len: usize) -> bool {
        self.capacity.is_none_or(|capacity| len < capacity)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured capacity, `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        !self.has_room(self.len())
    }

    /// Fill ratio in `[0, 1]`, `None` when unbounded
    pub fn occupancy(&self) -> Option<f64> {
        self.capacity
            .map(|capacity| self.len() as f64 / capacity as f64)
    }

    /// Insert without waiting; hands the value back when the queue is full
    pub fn try_push(&self, priority: Priority, value: T) -> Result<(), T> {
        let mut inner = self.lock();
        if !self.has_room(inner.heap.len()) {
            return Err(value);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry {
            priority,
            seq,
            value,
        });
        let room_left = self.has_room(inner.heap.len());
        drop(inner);

        self.not_empty.notify_one();
        if room_left {
            self.not_full.notify_one();
        }
        Ok(())
    }

    /// Insert, waiting while the queue is full
    pub async fn push(&self, priority: Priority, mut value: T) {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(priority, value) {
                Ok(()) => return,
                Err(rejected) => value = rejected,
            }
            trace!(queue = %self.name, "Queue full, waiting for capacity");
            notified.await;
        }
    }

    /// Remove the first entry without waiting
    pub fn try_pop(&self) -> Option<(Priority, T)> {
        let mut inner = self.lock();
        let entry = inner.heap.pop()?;
        let more = !inner.heap.is_empty();
        drop(inner);

        self.not_full.notify_one();
        if more {
            self.not_empty.notify_one();
        }
        Some((entry.priority, entry.value))
    }

    /// Remove the first entry, waiting while the queue is empty
    pub async fn pop(&self) -> (Priority, T) {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_pop() {
                return entry;
            }
            notified.await;
        }
    }

    /// Remove the first entry, giving up after `timeout`
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<(Priority, T)> {
        tokio::time::timeout(timeout, self.pop()).await.ok()
    }

    /// Remove everything currently queued
    pub fn drain(&self) -> Vec<(Priority, T)> {
        let mut inner = self.lock();
        let mut drained = Vec::with_capacity(inner.heap.len());
        while let Some(entry) = inner.heap.pop() {
            drained.push((entry.priority, entry.value));
        }
        drop(inner);
        self.not_full.notify_waiters();
        drained
    }
}

impl<T> std::fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
