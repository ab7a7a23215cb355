//! # Databridge Core
//!
//! Orchestration engine of the synchronization bridge: the queues and
//! pending set connecting the pipeline stages, the change filters, the
//! elastic worker pools and their controller, the API client pool with its
//! latency monitor, and the liveness supervisor.
//!
//! Concrete stores and upstream clients live in `databridge-storage` and
//! `databridge-client`; this crate only defines their contracts plus
//! in-memory implementations.

pub mod backoff;
pub mod bridge;
pub mod clients;
pub mod config;
pub mod error;
pub mod filter;
pub mod in_memory;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod shutdown;
pub mod source;
pub mod storage;
pub mod supervisor;
pub mod types;
pub mod worker;

pub use bridge::DataBridge;
pub use clients::{ApiClientPool, ClientInfo, ClientLease, PerformanceMonitor};
pub use config::{BridgeConfig, FilterKind, StorageKind};
pub use error::{BridgeError, BridgeResult, ErrorClass};
pub use filter::{ChangeFilter, RuleFilter, StampFilter};
pub use in_memory::{InMemoryCache, InMemoryStore};
pub use metrics::{BridgeMetrics, Counter, MetricsSnapshot};
pub use pool::{QueuesController, WorkerPool};
pub use queue::{PendingSet, PriorityQueue, WorkItem};
pub use shutdown::{Shutdown, ShutdownTrigger, shutdown_signal};
pub use source::{ClientFactory, FeedStream, ResourceClient, ResourceFeeder};
pub use storage::{DocumentStore, StampCache};
pub use supervisor::LivenessSupervisor;
pub use types::{BulkWrite, FlowTag, Priority, ResourceItem, WriteOutcome};
