//! Liveness supervision of the feeder and filter tasks
//!
//! The feeder pump and the change filters must run forever. They are not
//! restarted when they die; instead the worker pools are grown so the
//! backlog already queued drains faster.

use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use crate::pool::WorkerPool;
use crate::shutdown::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

struct SupervisedTask {
    name: String,
    handle: JoinHandle<BridgeResult<()>>,
    finished: bool,
}

/// What one supervision tick observed and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisionReport {
    /// Tasks newly found terminated with an error
    pub failed: Vec<String>,
    /// Tasks newly found ended without error
    pub ended: Vec<String>,
    pub main_grown: usize,
    pub retry_grown: usize,
}

pub struct LivenessSupervisor {
    tasks: Vec<SupervisedTask>,
    main_pool: Arc<WorkerPool>,
    retry_pool: Arc<WorkerPool>,
    metrics: Arc<BridgeMetrics>,
    period: Duration,
}

impl LivenessSupervisor {
    pub fn new(
        main_pool: Arc<WorkerPool>,
        retry_pool: Arc<WorkerPool>,
        metrics: Arc<BridgeMetrics>,
        period: Duration,
    ) -> Self {
        Self {
            tasks: Vec::new(),
            main_pool,
            retry_pool,
            metrics,
            period,
        }
    }

    /// Put a must-run-forever task under supervision
    pub fn watch(&mut self, name: impl Into<String>, handle: JoinHandle<BridgeResult<()>>) {
        self.tasks.push(SupervisedTask {
            name: name.into(),
            handle,
            finished: false,
        });
    }

    /// Supervised tasks still running
    pub fn alive(&self) -> usize {
        self.tasks.iter().filter(|task| !task.handle.is_finished()).count()
    }

    pub async fn tick(&mut self) -> SupervisionReport {
        let mut report = SupervisionReport::default();

        for task in self.tasks.iter_mut().filter(|t| !t.finished && t.handle.is_finished()) {
            task.finished = true;
            let outcome = match (&mut task.handle).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(BridgeError::task_terminated(&task.name, "panicked")),
                Err(e) => Err(BridgeError::task_terminated(&task.name, e.to_string())),
            };
            match outcome {
                Ok(()) => {
                    warn!(task = %task.name, "Supervised task ended");
                    report.ended.push(task.name.clone());
                }
                Err(e) => {
                    error!(message_id = "exceptions", task = %task.name, error = %e, "Supervised task terminated");
                    report.failed.push(task.name.clone());
                }
            }
        }

        if !report.failed.is_empty() {
            report.main_grown = self.main_pool.grow_by(self.main_pool.min());
            report.retry_grown = self.retry_pool.grow_by(self.retry_pool.min());
            info!(
                main_grown = report.main_grown,
                retry_grown = report.retry_grown,
                "Worker pools grown to compensate for terminated tasks"
            );
        }

        // Crashed workers leave the pools below their floor
        for pool in [&self.main_pool, &self.retry_pool] {
            let missing = pool.min().saturating_sub(pool.len());
            if missing > 0 {
                let grown = pool.grow_by(missing);
                info!(pool = %pool.name(), grown, "Worker pool restored to minimum");
            }
        }

        report
    }

    /// Run supervision ticks until shutdown, then wait for the supervised tasks
    pub async fn run(mut self, shutdown: Shutdown) {
        info!(
            tasks = self.tasks.len(),
            period_secs = self.period.as_secs_f64(),
            "Liveness supervisor started"
        );
        while shutdown.sleep(self.period).await {
            self.tick().await;
            info!(
                alive = self.alive(),
                workers = self.main_pool.len(),
                retry_workers = self.retry_pool.len(),
                metrics = ?self.metrics.snapshot(),
                "Status"
            );
        }

        for task in self.tasks.drain(..).filter(|t| !t.finished) {
            if let Ok(Err(e)) = task.handle.await {
                warn!(task = %task.name, error = %e, "Supervised task failed during shutdown");
            }
        }
        info!("Liveness supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{WorkerFactory, WorkerSlot};
    use futures::future::BoxFuture;

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

    fn supervisor(main: &Arc<WorkerPool>, retry: &Arc<WorkerPool>) -> LivenessSupervisor {
        LivenessSupervisor::new(
            Arc::clone(main),
            Arc::clone(retry),
            Arc::new(BridgeMetrics::new()),
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tasks_grow_pools_once() {
        let main = Arc::new(WorkerPool::new("workers", 1, 3, Arc::new(IdleWorkers)));
        let retry = Arc::new(WorkerPool::new("retry_workers", 1, 2, Arc::new(IdleWorkers)));
        main.grow();
        retry.grow();
        let mut supervisor = supervisor(&main, &retry);

        supervisor.watch(
            "feeder",
            tokio::spawn(async { Err(BridgeError::task_terminated("feeder", "feed down")) }),
        );
        supervisor.watch(
            "filter-0",
            tokio::spawn(async { Err(BridgeError::task_terminated("filter-0", "lookup failed")) }),
        );
        tokio::task::yield_now().await;

        let report = supervisor.tick().await;
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.main_grown, 1);
        assert_eq!(report.retry_grown, 1);
        assert_eq!(main.free_count(), 3 - 2);
        assert_eq!(retry.free_count(), 0);

        // Already reported, nothing more happens
        let report = supervisor.tick().await;
        assert!(report.failed.is_empty());
        assert_eq!(main.len(), 2);
        main.abort_all();
        retry.abort_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_and_clean_tasks_do_not_compensate() {
        let main = Arc::new(WorkerPool::new("workers", 0, 3, Arc::new(IdleWorkers)));
        let retry = Arc::new(WorkerPool::new("retry_workers", 0, 2, Arc::new(IdleWorkers)));
        let mut supervisor = supervisor(&main, &retry);
        supervisor.watch("feeder", tokio::spawn(std::future::pending()));
        supervisor.watch("filter-0", tokio::spawn(async { Ok(()) }));
        tokio::task::yield_now().await;

        let report = supervisor.tick().await;
        assert_eq!(report.ended, vec!["filter-0".to_string()]);
        assert!(report.failed.is_empty());
        assert_eq!(main.len(), 0);
        assert_eq!(supervisor.alive(), 1);
    }

    #[tokio::test]
    async fn test_panicked_task_counts_as_failure_and_floor_restored() {
        let main = Arc::new(WorkerPool::new("workers", 2, 4, Arc::new(IdleWorkers)));
        let retry = Arc::new(WorkerPool::new("retry_workers", 0, 2, Arc::new(IdleWorkers)));
        let mut supervisor = supervisor(&main, &retry);
        supervisor.watch("feeder", tokio::spawn(async { panic!("feeder crashed") }));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = supervisor.tick().await;
        assert_eq!(report.failed, vec!["feeder".to_string()]);
        assert_eq!(report.main_grown, 2);
        assert_eq!(main.len(), 2);
        main.abort_all();
    }
}
