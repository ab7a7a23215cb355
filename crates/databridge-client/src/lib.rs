//! # Databridge Client
//!
//! HTTP collaborators of the bridge: [`ApiResourceClient`] sessions created
//! by [`HttpClientFactory`] for the client pool, and [`FeedRetriever`]
//! crawling the upstream changes feed.

pub mod api;
pub mod feed;

pub use api::{ApiResourceClient, ApiSettings, HttpClientFactory};
pub use feed::FeedRetriever;
