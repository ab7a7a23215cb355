//! # Databridge
//!
//! Continuous synchronization bridge: crawls a paginated upstream change
//! feed, drops records the target store already holds, fetches the rest
//! through a pool of API sessions and bulk-writes them into CouchDB or
//! Elasticsearch.
//!
//! This crate re-exports the workspace members:
//!
//! - [`core`]: pipeline engine, queues, pools and supervision
//! - [`storage`]: document store drivers and the stamp cache
//! - [`client`]: upstream API sessions and the feed retriever

pub use databridge_client as client;
pub use databridge_core as core;
pub use databridge_storage as storage;

pub use databridge_client::{ApiResourceClient, FeedRetriever, HttpClientFactory};
pub use databridge_core::{
    BridgeConfig, BridgeError, BridgeResult, DataBridge, DocumentStore, ResourceFeeder,
    ResourceItem, Shutdown, StampCache,
};
pub use databridge_storage::{build_cache, build_store};
