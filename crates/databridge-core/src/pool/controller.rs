//! Hysteresis step controller sizing a worker pool by queue occupancy

use super::workers::WorkerPool;
use crate::clients::ApiClientPool;
use crate::queue::ResourceItemsQueue;
use crate::shutdown::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Direction of one controller step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStep {
    Grew,
    Shrank,
    Unchanged,
}

/// Grows or shrinks one worker pool by at most one worker per tick
pub struct QueuesController {
    queue: Arc<ResourceItemsQueue>,
    pool: Arc<WorkerPool>,
    clients: Option<Arc<ApiClientPool>>,
    inc_threshold: f64,
    dec_threshold: f64,
    period: Duration,
}

impl QueuesController {
    pub fn new(
        queue: Arc<ResourceItemsQueue>,
        pool: Arc<WorkerPool>,
        inc_threshold: f64,
        dec_threshold: f64,
        period: Duration,
    ) -> Self {
        Self {
            queue,
            pool,
            clients: None,
            inc_threshold,
            dec_threshold,
            period,
        }
    }

    /// Resize the client pool together with the worker pool
    pub fn with_clients(mut self, clients: Arc<ApiClientPool>) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Queue occupancy in percent; unbounded queues always read as full
    fn occupancy_percent(&self) -> f64 {
        self.queue
            .occupancy()
            .map_or(f64::INFINITY, |occupancy| occupancy * 100.0)
    }

    pub async fn tick(&self) -> PoolStep {
        let size = self.pool.len();
        let occupancy = self.occupancy_percent();

        let grow = size < self.pool.min()
            || (occupancy >= self.inc_threshold && size < self.pool.max());
        let shrink = !grow && occupancy <= self.dec_threshold && size > self.pool.min();

        if grow && self.pool.grow() {
            if let Some(clients) = &self.clients
                && let Err(e) = clients.grow().await
            {
                warn!(error = %e, "API client pool not grown");
            }
            debug!(pool = %self.pool.name(), occupancy, size = self.pool.len(), "Pool grown");
            return PoolStep::Grew;
        }

        if shrink && self.pool.shrink() {
            if let Some(clients) = &self.clients {
                clients.shrink();
            }
            debug!(pool = %self.pool.name(), occupancy, size = self.pool.len(), "Pool shrunk");
            return PoolStep::Shrank;
        }

        PoolStep::Unchanged
    }

    pub async fn run(&self, shutdown: Shutdown) {
        info!(
            pool = %self.pool.name(),
            queue = %self.queue.name(),
            period_secs = self.period.as_secs_f64(),
            "Queues controller started"
        );
        while shutdown.sleep(self.period).await {
            self.tick().await;
            info!(
                pool = %self.pool.name(),
                queue = %self.queue.name(),
                queue_size = self.queue.len(),
                workers = self.pool.len(),
                clients = self.clients.as_ref().map(|c| c.len()),
                "Queues controller tick"
            );
        }
        info!(pool = %self.pool.name(), "Queues controller stopped");
    }
}
