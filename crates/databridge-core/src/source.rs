//! Upstream collaborator contracts: API client handles and the feeder

use crate::error::{BridgeError, BridgeResult};
use crate::queue::InputQueue;
use crate::shutdown::Shutdown;
use crate::types::{Priority, ResourceItem};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One upstream API client handle (one session)
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// User agent identifying this handle upstream
    fn user_agent(&self) -> &str;

    /// Fetch the full record
    ///
    /// Implementations map "not visible yet" to `BridgeError::NotFound` and
    /// "permanently removed" to `BridgeError::Gone`.
    async fn get_item(&self, id: &str) -> BridgeResult<ResourceItem>;

    /// Fetch the record together with its owner credentials
    async fn extract_credentials(&self, id: &str) -> BridgeResult<Value>;
}

/// Builds API client handles for the client pool
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self, user_agent: &str) -> BridgeResult<Arc<dyn ResourceClient>>;
}

/// Stream of `(priority, stub)` pairs produced by a feeder
pub type FeedStream = BoxStream<'static, BridgeResult<(Priority, ResourceItem)>>;

/// Restartable source of changed-record stubs
pub trait ResourceFeeder: Send + Sync {
    /// Start a fresh crawl of the feed
    fn get_resource_items(&self) -> FeedStream;
}

/// Pump the feeder into the input queue until shutdown
///
/// The queue's backpressure suspends the pump while the input queue is
/// full. A stream error is returned as a task termination for the liveness
/// supervisor to observe.
pub async fn fill_input_queue(
    feeder: Arc<dyn ResourceFeeder>,
    input: Arc<InputQueue>,
    shutdown: Shutdown,
) -> BridgeResult<()> {
    let mut stream = feeder.get_resource_items();
    info!("Feeder started");

    loop {
        let next = tokio::select! {
            _ = shutdown.wait() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok((priority, item))) => {
                debug!(resource_id = %item.id, ?priority, "Feed item received");
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = input.push(priority, item) => {}
                }
            }
            Some(Err(e)) => {
                return Err(BridgeError::task_terminated("feeder", e.to_string()));
            }
            None => {
                warn!("Feed stream ended");
                return Ok(());
            }
        }
    }

    info!("Feeder stopped");
    Ok(())
}
