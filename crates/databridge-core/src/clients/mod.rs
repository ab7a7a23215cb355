//! API client pool and its latency health monitor

mod info;
mod monitor;
mod pool;

pub use info::ClientInfo;
pub use monitor::{
    MonitorPolicy, PerformanceMonitor, PerformanceReport, average_request_durations,
    mark_bad_clients, population_std_dev, round3,
};
pub use pool::{ApiClientPool, ClientLease};

#[cfg(test)]
pub(crate) use pool::tests::{FlakyFactory, pool as test_pool};
