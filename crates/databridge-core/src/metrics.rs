//! Pipeline counters
//!
//! Counters are plain atomics so workers can bump them without holding any
//! lock; the liveness supervisor logs a snapshot on every tick.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Events counted across the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Candidate dropped by a change filter as already current
    FilterSkipped,
    /// Candidate claimed and pushed to the resource-items queue
    Enqueued,
    /// Candidate rejected because its id is already pending
    Duplicate,
    Created,
    Updated,
    /// Write rejected by the store as older than what it holds
    Skipped,
    /// Write rejected by the store for any other reason
    Failed,
    /// Fetched record older than the feed stub
    NotActual,
    Retried,
    /// Record abandoned after exhausting its retries or gone upstream
    Dropped,
    ClientsCreated,
    ClientsRotated,
}

/// Lock-free pipeline counters
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    filter_skipped: AtomicU64,
    enqueued: AtomicU64,
    duplicates: AtomicU64,
    created: AtomicU64,
    updated: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    not_actual: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    clients_created: AtomicU64,
    clients_rotated: AtomicU64,
}

/// Point-in-time copy of [`BridgeMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub filter_skipped: u64,
    pub enqueued: u64,
    pub duplicates: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub not_actual: u64,
    pub retried: u64,
    pub dropped: u64,
    pub clients_created: u64,
    pub clients_rotated: u64,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::FilterSkipped => &self.filter_skipped,
            Counter::Enqueued => &self.enqueued,
            Counter::Duplicate => &self.duplicates,
            Counter::Created => &self.created,
            Counter::Updated => &self.updated,
            Counter::Skipped => &self.skipped,
            Counter::Failed => &self.failed,
            Counter::NotActual => &self.not_actual,
            Counter::Retried => &self.retried,
            Counter::Dropped => &self.dropped,
            Counter::ClientsCreated => &self.clients_created,
            Counter::ClientsRotated => &self.clients_rotated,
        }
    }

    pub fn record(&self, counter: Counter) {
        self.record_n(counter, 1);
    }

    pub fn record_n(&self, counter: Counter, n: u64) {
        let _ = self
            .counter(counter)
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_add(n))
            });
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counter(counter).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            filter_skipped: self.get(Counter::FilterSkipped),
            enqueued: self.get(Counter::Enqueued),
            duplicates: self.get(Counter::Duplicate),
            created: self.get(Counter::Created),
            updated: self.get(Counter::Updated),
            skipped: self.get(Counter::Skipped),
            failed: self.get(Counter::Failed),
            not_actual: self.get(Counter::NotActual),
            retried: self.get(Counter::Retried),
            dropped: self.get(Counter::Dropped),
            clients_created: self.get(Counter::ClientsCreated),
            clients_rotated: self.get(Counter::ClientsRotated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = BridgeMetrics::new();
        metrics.record(Counter::Created);
        metrics.record(Counter::Created);
        metrics.record_n(Counter::Skipped, 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.created, 2);
        assert_eq!(snapshot.skipped, 3);
        assert_eq!(snapshot.updated, 0);
    }

    #[test]
    fn test_saturates() {
        let metrics = BridgeMetrics::new();
        metrics.record_n(Counter::Retried, u64::MAX);
        metrics.record(Counter::Retried);
        assert_eq!(metrics.get(Counter::Retried), u64::MAX);
    }
}
