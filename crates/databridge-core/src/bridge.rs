//! Orchestrator wiring the pipeline stages together

use crate::clients::{ApiClientPool, MonitorPolicy, PerformanceMonitor};
use crate::config::{BridgeConfig, FilterKind};
use crate::error::{BridgeError, BridgeResult};
use crate::filter::{ChangeFilter, RuleFilter, StampFilter};
use crate::in_memory::InMemoryCache;
use crate::metrics::BridgeMetrics;
use crate::pool::{QueuesController, WorkerPool};
use crate::queue::{InputQueue, PendingSet, ResourceItemsQueue};
use crate::shutdown::Shutdown;
use crate::source::{ClientFactory, ResourceFeeder, fill_input_queue};
use crate::storage::{DocumentStore, StampCache};
use crate::supervisor::LivenessSupervisor;
use crate::worker::{ItemWorkers, WorkerContext};
use std::sync::Arc;
use tracing::{info, warn};

/// The synchronization bridge
///
/// Owns the queues and the pending set; every other component is created
/// by [`DataBridge::run`] and lives as long as that call.
pub struct DataBridge {
    config: Arc<BridgeConfig>,
    feeder: Arc<dyn ResourceFeeder>,
    client_factory: Arc<dyn ClientFactory>,
    store: Arc<dyn DocumentStore>,
    cache: Option<Arc<dyn StampCache>>,
    metrics: Arc<BridgeMetrics>,
    pending: PendingSet,
    input_queue: Arc<InputQueue>,
    resource_items_queue: Arc<ResourceItemsQueue>,
    retry_queue: Arc<ResourceItemsQueue>,
}

impl DataBridge {
    /// Validate `config` and build the bridge around its collaborators
    pub fn new(
        config: BridgeConfig,
        feeder: Arc<dyn ResourceFeeder>,
        client_factory: Arc<dyn ClientFactory>,
        store: Arc<dyn DocumentStore>,
    ) -> BridgeResult<Self> {
        config.validate()?;
        let input_queue = Arc::new(InputQueue::new("input", config.input_queue_size));
        let resource_items_queue = Arc::new(ResourceItemsQueue::new(
            "resource_items",
            config.resource_items_queue_size,
        ));
        let retry_queue = Arc::new(ResourceItemsQueue::new(
            "retry_resource_items",
            config.retry_resource_items_queue_size,
        ));

        Ok(Self {
            config: Arc::new(config),
            feeder,
            client_factory,
            store,
            cache: None,
            metrics: Arc::new(BridgeMetrics::new()),
            pending: PendingSet::new(),
            input_queue,
            resource_items_queue,
            retry_queue,
        })
    }

    /// Use `cache` for last-written stamps
    pub fn with_cache(mut self, cache: Arc<dyn StampCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn pending(&self) -> &PendingSet {
        &self.pending
    }

    pub fn resource_items_queue(&self) -> &Arc<ResourceItemsQueue> {
        &self.resource_items_queue
    }

    fn build_filters(&self) -> BridgeResult<Vec<Arc<dyn ChangeFilter>>> {
        let count = self.config.filter_workers_count.max(1);
        let storage = &self.config.storage_config;
        let rule_cache: Arc<dyn StampCache> = match &self.cache {
            Some(cache) => Arc::clone(cache),
            None => Arc::new(InMemoryCache::new()),
        };

        (0..count)
            .map(|i| -> BridgeResult<Arc<dyn ChangeFilter>> {
                let name = format!("filter-{}", i);
                Ok(match self.config.filter_type {
                    FilterKind::BasicCouchdb | FilterKind::BasicElasticsearch => {
                        Arc::new(StampFilter::new(
                            name,
                            Arc::clone(&self.store),
                            self.pending.clone(),
                            Arc::clone(&self.metrics),
                            storage.bulk_query_limit,
                            storage.bulk_query_interval(),
                        ))
                    }
                    FilterKind::Rules => Arc::new(RuleFilter::new(
                        name,
                        Arc::clone(&rule_cache),
                        self.pending.clone(),
                        Arc::clone(&self.metrics),
                        &self.config.filter_config,
                    )?),
                })
            })
            .collect()
    }

    /// Run the pipeline until `shutdown` is triggered
    ///
    /// Returns once every loop has stopped and every worker has flushed its
    /// pending bulk.
    pub async fn run(&self, shutdown: Shutdown) -> BridgeResult<()> {
        let config = &self.config;
        info!(
            resource = %config.resource,
            server = %config.resources_api_server,
            filter_type = ?config.filter_type,
            store = self.store.backend(),
            "Start data sync"
        );

        let clients = Arc::new(ApiClientPool::new(
            Arc::clone(&self.client_factory),
            config.user_agent.clone(),
            config.workers_min,
            config.api_clients_max(),
            Arc::clone(&self.metrics),
            shutdown.clone(),
        ));
        match clients.fill_api_clients_queue().await {
            Ok(()) => {}
            Err(BridgeError::Shutdown) => return Ok(()),
            Err(e) => return Err(e),
        }

        let context = Arc::new(WorkerContext {
            config: Arc::clone(config),
            clients: Arc::clone(&clients),
            store: Arc::clone(&self.store),
            cache: self.cache.clone(),
            retry_queue: Arc::clone(&self.retry_queue),
            metrics: Arc::clone(&self.metrics),
            shutdown: shutdown.clone(),
        });
        let main_pool = Arc::new(WorkerPool::new(
            "workers",
            config.workers_min,
            config.workers_max,
            Arc::new(ItemWorkers::new(
                Arc::clone(&context),
                Arc::clone(&self.resource_items_queue),
            )),
        ));
        let retry_pool = Arc::new(WorkerPool::new(
            "retry_workers",
            config.retry_workers_min,
            config.retry_workers_max,
            Arc::new(ItemWorkers::new(
                Arc::clone(&context),
                Arc::clone(&self.retry_queue),
            )),
        ));
        main_pool.grow_by(config.workers_min);
        retry_pool.grow_by(config.retry_workers_min);

        let mut supervisor = LivenessSupervisor::new(
            Arc::clone(&main_pool),
            Arc::clone(&retry_pool),
            Arc::clone(&self.metrics),
            config.watch_interval(),
        );
        supervisor.watch(
            "feeder",
            tokio::spawn(fill_input_queue(
                Arc::clone(&self.feeder),
                Arc::clone(&self.input_queue),
                shutdown.clone(),
            )),
        );
        for filter in self.build_filters()? {
            let name = filter.name().to_string();
            let input = Arc::clone(&self.input_queue);
            let output = Arc::clone(&self.resource_items_queue);
            let shutdown = shutdown.clone();
            supervisor.watch(
                name,
                tokio::spawn(async move { filter.run(input, output, shutdown).await }),
            );
        }

        let main_controller = QueuesController::new(
            Arc::clone(&self.resource_items_queue),
            Arc::clone(&main_pool),
            config.workers_inc_threshold,
            config.workers_dec_threshold,
            config.queues_controller_timeout(),
        )
        .with_clients(Arc::clone(&clients));
        let retry_controller = QueuesController::new(
            Arc::clone(&self.retry_queue),
            Arc::clone(&retry_pool),
            config.workers_inc_threshold,
            config.workers_dec_threshold,
            config.queues_controller_timeout(),
        );
        let monitor = PerformanceMonitor::new(
            Arc::clone(&clients),
            config.performance_window(),
            MonitorPolicy::from(&config.worker_config),
        );

        let loops = vec![
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move { main_controller.run(shutdown).await }
            }),
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move { retry_controller.run(shutdown).await }
            }),
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move { monitor.run(shutdown).await }
            }),
            tokio::spawn(supervisor.run(shutdown.clone())),
        ];

        shutdown.wait().await;
        info!("Stopping data sync");

        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Control loop failed");
            }
        }
        main_pool.join_all().await;
        retry_pool.join_all().await;

        info!(
            metrics = ?self.metrics.snapshot(),
            pending = self.pending.len(),
            "Data sync stopped"
        );
        Ok(())
    }
}
