//! Pool of upstream API client handles
//!
//! The pool owns every handle together with its [`ClientInfo`]; both maps
//! are only ever modified under the same lock, so a handle never exists
//! without telemetry or the other way around.

use super::info::ClientInfo;
use crate::config::secs;
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::{BridgeMetrics, Counter};
use crate::shutdown::Shutdown;
use crate::source::{ClientFactory, ResourceClient};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// First delay of the client creation retry, doubled on each failure
const CREATE_RETRY_INITIAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct ClientPoolState {
    handles: HashMap<String, Arc<dyn ResourceClient>>,
    infos: HashMap<String, ClientInfo>,
    idle: VecDeque<String>,
    /// Slots reserved by creations in flight
    reserved: usize,
}

impl ClientPoolState {
    fn size(&self) -> usize {
        self.handles.len() + self.reserved
    }

    fn remove(&mut self, id: &str) {
        self.handles.remove(id);
        self.infos.remove(id);
        self.idle.retain(|idle| idle != id);
    }
}

/// Bounded pool of API client handles with per-handle telemetry
pub struct ApiClientPool {
    factory: Arc<dyn ClientFactory>,
    user_agent: String,
    min: usize,
    max: usize,
    state: Mutex<ClientPoolState>,
    available: Notify,
    metrics: Arc<BridgeMetrics>,
    shutdown: Shutdown,
}

impl ApiClientPool {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        user_agent: impl Into<String>,
        min: usize,
        max: usize,
        metrics: Arc<BridgeMetrics>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            factory,
            user_agent: user_agent.into(),
            min,
            max: max.max(min).max(1),
            state: Mutex::new(ClientPoolState::default()),
            available: Notify::new(),
            metrics,
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClientPoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handles in the pool, including creations in flight
    pub fn len(&self) -> usize {
        self.lock().size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    fn reserve(&self) -> bool {
        let mut state = self.lock();
        if state.size() >= self.max {
            return false;
        }
        state.reserved += 1;
        true
    }

    fn unreserve(&self) {
        let mut state = self.lock();
        state.reserved = state.reserved.saturating_sub(1);
    }

    /// Create one handle into a reserved slot, retrying until it succeeds
    ///
    /// The retry delay starts at 100ms and doubles after every failure.
    /// Only shutdown aborts the loop.
    async fn create_reserved(&self) -> BridgeResult<String> {
        let mut delay = CREATE_RETRY_INITIAL;
        loop {
            if self.shutdown.is_triggered() {
                self.unreserve();
                return Err(BridgeError::Shutdown);
            }

            let id = Uuid::new_v4().simple().to_string();
            let user_agent = format!("{}/{}", self.user_agent, id);
            let started = Instant::now();
            match self.factory.create(&user_agent).await {
                Ok(client) => {
                    let mut state = self.lock();
                    state.reserved = state.reserved.saturating_sub(1);
                    state.handles.insert(id.clone(), client);
                    state.infos.insert(id.clone(), ClientInfo::default());
                    state.idle.push_back(id.clone());
                    let size = state.size();
                    drop(state);

                    self.metrics.record(Counter::ClientsCreated);
                    self.available.notify_one();
                    info!(
                        client_id = %id,
                        user_agent = %user_agent,
                        size,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Started API client"
                    );
                    return Ok(id);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to start API client"
                    );
                    if !self.shutdown.sleep(delay).await {
                        self.unreserve();
                        return Err(BridgeError::Shutdown);
                    }
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }

    /// Create one handle if below the maximum; `Ok(None)` at the maximum
    pub async fn create_api_client(&self) -> BridgeResult<Option<String>> {
        if !self.reserve() {
            debug!(max = self.max, "API client pool at maximum");
            return Ok(None);
        }
        self.create_reserved().await.map(Some)
    }

    /// Ensure the pool holds at least the minimum number of handles
    pub async fn fill_api_clients_queue(&self) -> BridgeResult<()> {
        while self.len() < self.min {
            if self.create_api_client().await?.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Add one handle; `false` at the maximum
    pub async fn grow(&self) -> BridgeResult<bool> {
        Ok(self.create_api_client().await?.is_some())
    }

    /// Remove one idle handle unless at the minimum
    pub fn shrink(&self) -> bool {
        let mut state = self.lock();
        if state.size() <= self.min {
            return false;
        }
        match state.idle.pop_back() {
            Some(id) => {
                state.remove(&id);
                info!(client_id = %id, size = state.size(), "Removed API client");
                true
            }
            None => false,
        }
    }

    /// Lease an idle handle, waiting up to `timeout`
    ///
    /// A handle flagged for session rotation is discarded here and replaced
    /// by a freshly created one.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Option<ClientLease> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            enum Next {
                Lease(ClientLease),
                Rotate(String),
                Wait,
            }

            let next = {
                let mut state = self.lock();
                match state.idle.pop_front() {
                    Some(id) => {
                        let drop_cookies = state.infos.get(&id).is_some_and(|info| info.drop_cookies);
                        if drop_cookies {
                            state.remove(&id);
                            state.reserved += 1;
                            Next::Rotate(id)
                        } else {
                            match (state.handles.get(&id), state.infos.get(&id)) {
                                (Some(client), Some(info)) => Next::Lease(ClientLease {
                                    pool: Arc::clone(self),
                                    client: Arc::clone(client),
                                    request_interval: secs(info.request_interval),
                                    id,
                                }),
                                _ => {
                                    state.remove(&id);
                                    Next::Wait
                                }
                            }
                        }
                    }
                    None => Next::Wait,
                }
            };

            match next {
                Next::Lease(lease) => return Some(lease),
                Next::Rotate(id) => {
                    self.metrics.record(Counter::ClientsRotated);
                    info!(message_id = "drop_cookies", client_id = %id, "Dropped API client cookies");
                    if self.create_reserved().await.is_err() {
                        return None;
                    }
                }
                Next::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    fn release(&self, id: &str) {
        let mut state = self.lock();
        if state.handles.contains_key(id) && !state.idle.iter().any(|idle| idle == id) {
            state.idle.push_back(id.to_string());
            drop(state);
            self.available.notify_one();
        }
    }

    /// Append a completed request to the handle's sample window
    pub fn record_request_at(&self, id: &str, at: DateTime<Utc>, duration: Duration) {
        if let Some(info) = self.lock().infos.get_mut(id) {
            info.record(at, duration.as_secs_f64());
        }
    }

    pub fn record_request(&self, id: &str, duration: Duration) {
        self.record_request_at(id, Utc::now(), duration);
    }

    /// Copy of every handle's telemetry
    pub fn snapshot(&self) -> HashMap<String, ClientInfo> {
        self.lock().infos.clone()
    }

    /// Run `f` over the telemetry map under the pool lock
    pub(crate) fn with_client_infos<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, ClientInfo>) -> R,
    ) -> R {
        f(&mut self.lock().infos)
    }
}

/// A handle leased from the pool; returned to the idle set on drop
pub struct ClientLease {
    pool: Arc<ApiClientPool>,
    id: String,
    client: Arc<dyn ResourceClient>,
    request_interval: Duration,
}

impl ClientLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client(&self) -> &dyn ResourceClient {
        self.client.as_ref()
    }

    /// Delay to insert before issuing a request through this handle
    pub fn request_interval(&self) -> Duration {
        self.request_interval
    }

    pub fn record(&self, duration: Duration) {
        self.pool.record_request(&self.id, duration);
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        self.pool.release(&self.id);
    }
}

impl std::fmt::Debug for ClientLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLease")
            .field("id", &self.id)
            .field("user_agent", &self.client.user_agent())
            .field("request_interval", &self.request_interval)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::ResourceItem;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) struct NullClient {
        user_agent: String,
    }

    #[async_trait]
    impl ResourceClient for NullClient {
        fn user_agent(&self) -> &str {
            &self.user_agent
        }

        async fn get_item(&self, id: &str) -> BridgeResult<ResourceItem> {
            Ok(ResourceItem::new(id, "2024-01-01T00:00:00Z"))
        }

        async fn extract_credentials(&self, _id: &str) -> BridgeResult<Value> {
            Ok(Value::Null)
        }
    }

    /// Factory failing its first `failures` calls
    #[derive(Default)]
    pub(crate) struct FlakyFactory {
        pub failures: AtomicU32,
        pub calls: AtomicU32,
    }

    #[async_trait]
    impl ClientFactory for FlakyFactory {
        async fn create(&self, user_agent: &str) -> BridgeResult<Arc<dyn ResourceClient>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(BridgeError::ClientCreation("spore request failed".into()));
            }
            Ok(Arc::new(NullClient {
                user_agent: user_agent.to_string(),
            }))
        }
    }

    pub(crate) fn pool(factory: Arc<FlakyFactory>, min: usize, max: usize) -> Arc<ApiClientPool> {
        let (trigger, shutdown) = Shutdown::channel();
        std::mem::forget(trigger);
        Arc::new(ApiClientPool::new(
            factory,
            "bridge.basic",
            min,
            max,
            Arc::new(BridgeMetrics::new()),
            shutdown,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_retries_with_doubling_delay() {
        let factory = Arc::new(FlakyFactory::default());
        factory.failures.store(3, Ordering::SeqCst);
        let pool = pool(Arc::clone(&factory), 1, 2);

        let start = Instant::now();
        let id = pool.create_api_client().await.unwrap();
        assert!(id.is_some());
        assert_eq!(factory.calls.load(Ordering::SeqCst), 4);
        // 0.1 + 0.2 + 0.4 seconds of backoff
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_fill_and_bounds() {
        let factory = Arc::new(FlakyFactory::default());
        let pool = pool(factory, 2, 3);
        pool.fill_api_clients_queue().await.unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.snapshot().len(), 2);

        assert!(pool.grow().await.unwrap());
        assert!(!pool.grow().await.unwrap());
        assert_eq!(pool.len(), 3);

        assert!(pool.shrink());
        assert!(!pool.shrink());
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_lease_returns_on_drop_and_records() {
        let pool = pool(Arc::new(FlakyFactory::default()), 1, 1);
        pool.fill_api_clients_queue().await.unwrap();

        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(lease.client().user_agent().starts_with("bridge.basic/"));
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.acquire(Duration::from_millis(10)).await.is_none());

        lease.record(Duration::from_millis(250));
        let id = lease.id().to_string();
        drop(lease);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.snapshot()[&id].samples[0].1, 0.25);
    }

    #[tokio::test]
    async fn test_flagged_client_rotated_on_acquire() {
        let pool = pool(Arc::new(FlakyFactory::default()), 1, 1);
        pool.fill_api_clients_queue().await.unwrap();
        let old = pool.snapshot().into_keys().next().unwrap();
        pool.with_client_infos(|infos| infos.get_mut(&old).unwrap().mark_for_rotation());

        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_ne!(lease.id(), old);
        assert_eq!(pool.len(), 1);
        let infos = pool.snapshot();
        assert!(!infos.contains_key(&old));
        assert!(!infos[lease.id()].drop_cookies);
    }
}
