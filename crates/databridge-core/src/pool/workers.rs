//! Elastic worker pool
//!
//! Workers are spawned tasks. Growing spawns one more task; shrinking never
//! preempts: it files a retire request that the next worker reaching a safe
//! point between items picks up through [`WorkerSlot::should_retire`].

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Builds the future run by one worker
pub trait WorkerFactory: Send + Sync {
    fn worker(&self, slot: WorkerSlot) -> BoxFuture<'static, ()>;
}

struct WorkerEntry {
    id: u64,
    handle: JoinHandle<()>,
    /// Picked up a retire request and is on its way out
    retiring: bool,
}

#[derive(Default)]
struct PoolState {
    workers: Vec<WorkerEntry>,
    retire_requests: usize,
}

impl PoolState {
    fn prune(&mut self, pool: &str) {
        self.workers.retain(|worker| {
            let alive = !worker.handle.is_finished();
            if !alive {
                debug!(pool, worker_id = worker.id, "Worker exited");
            }
            alive
        });
        self.retire_requests = self.retire_requests.min(self.staying());
    }

    fn staying(&self) -> usize {
        self.workers.iter().filter(|worker| !worker.retiring).count()
    }

    fn active(&self) -> usize {
        self.staying() - self.retire_requests
    }
}

/// Handle given to each worker for cooperating with pool resizing
#[derive(Clone)]
pub struct WorkerSlot {
    id: u64,
    pool: String,
    state: Arc<Mutex<PoolState>>,
}

impl WorkerSlot {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Slot not attached to any pool; never asked to retire
    #[cfg(test)]
    pub(crate) fn detached(pool: &str, id: u64) -> Self {
        Self {
            id,
            pool: pool.to_string(),
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    /// Consume a pending retire request, if any; the caller must then exit
    pub fn should_retire(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.retire_requests > 0 {
            state.retire_requests -= 1;
            if let Some(worker) = state.workers.iter_mut().find(|w| w.id == self.id) {
                worker.retiring = true;
            }
            info!(pool = %self.pool, worker_id = self.id, "Worker retiring");
            true
        } else {
            false
        }
    }
}

/// Bounded elastic pool of worker tasks
pub struct WorkerPool {
    name: String,
    min: usize,
    max: usize,
    factory: Arc<dyn WorkerFactory>,
    state: Arc<Mutex<PoolState>>,
    next_id: AtomicU64,
}

impl WorkerPool {
    pub fn new(
        name: impl Into<String>,
        min: usize,
        max: usize,
        factory: Arc<dyn WorkerFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            min,
            max: max.max(min),
            factory,
            state: Arc::new(Mutex::new(PoolState::default())),
            next_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Running workers, excluding those asked to retire
    pub fn len(&self) -> usize {
        let mut state = self.lock();
        state.prune(&self.name);
        state.active()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots left before reaching the maximum
    pub fn free_count(&self) -> usize {
        self.max.saturating_sub(self.len())
    }

    /// Spawn one worker unless the pool is at its maximum
    pub fn grow(&self) -> bool {
        let mut state = self.lock();
        state.prune(&self.name);
        if state.active() >= self.max {
            return false;
        }

        if state.retire_requests > 0 {
            // Cancel a pending retirement instead of spawning
            state.retire_requests -= 1;
            info!(pool = %self.name, size = state.active(), "Worker pool grown (retire cancelled)");
            return true;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = WorkerSlot {
            id,
            pool: self.name.clone(),
            state: Arc::clone(&self.state),
        };
        let handle = tokio::spawn(self.factory.worker(slot));
        state.workers.push(WorkerEntry {
            id,
            handle,
            retiring: false,
        });
        info!(pool = %self.name, worker_id = id, size = state.active(), "Worker pool grown");
        true
    }

    /// Spawn up to `count` workers, bounded by the maximum; returns how many
    pub fn grow_by(&self, count: usize) -> usize {
        (0..count).take_while(|_| self.grow()).count()
    }

    /// Let one worker exit at its next safe point unless at the minimum
    pub fn shrink(&self) -> bool {
        let mut state = self.lock();
        state.prune(&self.name);
        if state.active() <= self.min {
            return false;
        }
        state.retire_requests += 1;
        info!(pool = %self.name, size = state.active(), "Worker pool shrinking");
        true
    }

    /// Wait for every worker to finish, logging panicked ones
    pub async fn join_all(&self) {
        let workers = std::mem::take(&mut self.lock().workers);
        for worker in workers {
            if let Err(e) = worker.handle.await
                && e.is_panic()
            {
                warn!(pool = %self.name, worker_id = worker.id, "Worker panicked");
            }
        }
    }

    /// Abort every worker without waiting for a safe point
    pub fn abort_all(&self) {
        let mut state = self.lock();
        for worker in state.workers.drain(..) {
            worker.handle.abort();
        }
        state.retire_requests = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Worker that idles until asked to retire
    struct IdleWorkers;

    impl WorkerFactory for IdleWorkers {
        fn worker(&self, slot: WorkerSlot) -> BoxFuture<'static, ()> {
            Box::pin(async move {
                while !slot.should_retire() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_grow_respects_max() {
        let pool = WorkerPool::new("workers", 1, 3, Arc::new(IdleWorkers));
        assert_eq!(pool.grow_by(5), 3);
        assert_eq!(pool.len(), 3);
        assert!(!pool.grow());
        assert_eq!(pool.free_count(), 0);
        pool.abort_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_stops_at_min_and_workers_exit() {
        let pool = WorkerPool::new("workers", 1, 3, Arc::new(IdleWorkers));
        pool.grow_by(3);

        assert!(pool.shrink());
        assert!(pool.shrink());
        assert!(!pool.shrink());
        assert_eq!(pool.len(), 1);

        settle().await;
        let state = pool.lock();
        assert_eq!(state.workers.len(), 1);
        assert_eq!(state.retire_requests, 0);
        drop(state);
        pool.abort_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_grow_cancels_pending_retire() {
        let pool = WorkerPool::new("workers", 0, 2, Arc::new(IdleWorkers));
        pool.grow_by(2);
        assert!(pool.shrink());
        assert!(pool.grow());
        assert_eq!(pool.lock().retire_requests, 0);
        assert_eq!(pool.len(), 2);
        pool.abort_all();
    }

    struct PanickingWorkers;

    impl WorkerFactory for PanickingWorkers {
        fn worker(&self, _slot: WorkerSlot) -> BoxFuture<'static, ()> {
            Box::pin(async { panic!("worker crashed") })
        }
    }

    #[tokio::test]
    async fn test_crashed_workers_are_pruned() {
        let pool = WorkerPool::new("workers", 1, 3, Arc::new(PanickingWorkers));
        pool.grow_by(2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.len(), 0);
        pool.join_all().await;
    }
}
