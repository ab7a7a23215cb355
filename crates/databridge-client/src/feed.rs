//! Paginated changes feed
//!
//! The first request (`feed=changes&descending=1`) splits the feed in two
//! cursors. A back-fill crawler follows `next_page` of the descending feed
//! until it returns an empty page; a live crawler follows the ascending feed
//! from `prev_page` forever. Both push into one bounded channel which the
//! returned stream drains.

use crate::api::{ApiSettings, REQUEST_ID_HEADER, REQUEST_ID_PREFIX, status_error};
use databridge_core::config::{BridgeConfig, FeedParams, RetrieverParams};
use databridge_core::types::{BACKFILL_PRIORITY, LIVE_PRIORITY, ResourceItem, generate_request_id};
use databridge_core::{BridgeError, BridgeResult, FeedStream, ResourceFeeder};
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use url::Url;

/// Attempts per page request before the feed gives up
pub const PAGE_ATTEMPTS: u32 = 5;

type FeedSender = mpsc::Sender<BridgeResult<(Option<i64>, ResourceItem)>>;

#[derive(Debug, Deserialize)]
struct PageRef {
    offset: Value,
}

#[derive(Debug, Deserialize)]
struct FeedPage {
    #[serde(default)]
    data: Vec<ResourceItem>,
    next_page: Option<PageRef>,
    prev_page: Option<PageRef>,
}

fn offset_of(page: Option<&PageRef>) -> Option<String> {
    page.map(|p| match &p.offset {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Backward,
    Forward,
}

struct FeedInner {
    http: Client,
    url: Url,
    retriever: RetrieverParams,
    extra: FeedParams,
}

/// [`ResourceFeeder`] crawling the upstream changes feed
#[derive(Clone)]
pub struct FeedRetriever {
    inner: Arc<FeedInner>,
}

impl std::fmt::Debug for FeedRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedRetriever")
            .field("url", &self.inner.url.as_str())
            .field("mode", &self.inner.extra.mode)
            .field("limit", &self.inner.extra.limit)
            .finish()
    }
}

impl FeedRetriever {
    pub fn new(
        settings: &ApiSettings,
        user_agent: &str,
        retriever: RetrieverParams,
        extra: FeedParams,
    ) -> BridgeResult<Self> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .user_agent(user_agent)
            .cookie_store(true)
            .build()
            .map_err(|e| BridgeError::ClientCreation(format!("Failed to create HTTP client: {}", e)))?;
        let url = settings.api_base()?.join(&settings.resource).map_err(|e| {
            BridgeError::config("resource", format!("Invalid resource path: {}", e))
        })?;

        Ok(Self {
            inner: Arc::new(FeedInner {
                http,
                url,
                retriever,
                extra,
            }),
        })
    }

    /// Feed of `resources_api_server`, the public server only serves items
    pub fn from_config(config: &BridgeConfig) -> BridgeResult<Self> {
        let mut settings = ApiSettings::from_config(config);
        settings.host_url = config.resources_api_server.clone();
        Self::new(
            &settings,
            &format!("{}.feed", config.user_agent),
            config.retrievers_params.clone(),
            config.extra_params.clone(),
        )
    }
}

impl FeedInner {
    async fn fetch_page(&self, direction: Direction, offset: Option<&str>) -> BridgeResult<FeedPage> {
        let mut query: Vec<(&str, String)> = vec![
            ("feed", "changes".to_string()),
            ("mode", self.extra.mode.clone()),
            ("limit", self.extra.limit.to_string()),
        ];
        if direction == Direction::Backward {
            query.push(("descending", "1".to_string()));
        }
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }

        let response = self
            .http
            .get(self.url.clone())
            .query(&query)
            .header(REQUEST_ID_HEADER, generate_request_id(REQUEST_ID_PREFIX))
            .send()
            .await
            .map_err(|e| BridgeError::Connection(format!("Feed request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }
        response
            .json()
            .await
            .map_err(|e| BridgeError::Serialization(format!("Failed to parse feed page: {}", e)))
    }

    async fn fetch_with_retry(
        &self,
        direction: Direction,
        offset: Option<&str>,
    ) -> BridgeResult<FeedPage> {
        let sleep = self.retriever.down_requests_sleep();
        let mut attempt = 1;
        loop {
            match self.fetch_page(direction, offset).await {
                Ok(page) => return Ok(page),
                Err(e) if attempt < PAGE_ATTEMPTS => {
                    warn!(
                        message_id = "exceptions",
                        ?direction,
                        attempt,
                        error = %e,
                        "Feed request failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(sleep).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Forward a page; false once the consumer is gone
async fn forward(tx: &FeedSender, priority: i64, items: Vec<ResourceItem>) -> bool {
    for item in items {
        if tx.send(Ok((Some(priority), item))).await.is_err() {
            return false;
        }
    }
    true
}

async fn crawl_backward(inner: Arc<FeedInner>, tx: FeedSender, mut offset: Option<String>) {
    let mut pages = 0u64;
    loop {
        let page = match inner.fetch_with_retry(Direction::Backward, offset.as_deref()).await {
            Ok(page) => page,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        if page.data.is_empty() {
            info!(pages, "Back-fill crawl finished");
            return;
        }
        pages += 1;
        let next = offset_of(page.next_page.as_ref());
        if !forward(&tx, BACKFILL_PRIORITY, page.data).await || next.is_none() {
            return;
        }
        offset = next;
    }
}

async fn crawl_forward(inner: Arc<FeedInner>, tx: FeedSender, mut offset: Option<String>) {
    let busy = inner.retriever.up_requests_sleep();
    let idle = inner.retriever.up_wait_sleep();
    loop {
        let page = match inner.fetch_with_retry(Direction::Forward, offset.as_deref()).await {
            Ok(page) => page,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        if let Some(next) = offset_of(page.next_page.as_ref()) {
            offset = Some(next);
        }
        let pause = if page.data.is_empty() { idle } else { busy };
        debug!(items = page.data.len(), "Live feed page received");
        if !forward(&tx, LIVE_PRIORITY, page.data).await {
            return;
        }
        tokio::select! {
            _ = tx.closed() => return,
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

async fn start(inner: Arc<FeedInner>, tx: FeedSender) {
    let first = match inner.fetch_with_retry(Direction::Backward, None).await {
        Ok(page) => page,
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            return;
        }
    };
    let backward = offset_of(first.next_page.as_ref());
    let forward_from = offset_of(first.prev_page.as_ref());
    info!(
        backward_offset = ?backward,
        forward_offset = ?forward_from,
        "Feed cursors initialized"
    );

    if !forward(&tx, BACKFILL_PRIORITY, first.data).await {
        return;
    }
    if backward.is_some() {
        tokio::spawn(crawl_backward(Arc::clone(&inner), tx.clone(), backward));
    }
    crawl_forward(inner, tx, forward_from).await;
}

impl ResourceFeeder for FeedRetriever {
    fn get_resource_items(&self) -> FeedStream {
        let (tx, rx) = mpsc::channel(self.inner.retriever.queue_size.max(1));
        tokio::spawn(start(Arc::clone(&self.inner), tx));
        ReceiverStream::new(rx).boxed()
    }
}
