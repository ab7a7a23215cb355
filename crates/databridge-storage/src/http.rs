//! Shared plumbing of the HTTP-backed stores

use databridge_core::BridgeError;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Per-request timeout for store calls
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn build_client(backend: &str) -> Result<Client, BridgeError> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(format!("databridge-storage/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| BridgeError::storage(backend, format!("Failed to create HTTP client: {}", e)))
}

pub(crate) fn parse_base(backend: &str, base: &str) -> Result<Url, BridgeError> {
    let base = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{}/", base)
    };
    Url::parse(&base).map_err(|e| BridgeError::storage(backend, format!("Invalid base URL: {}", e)))
}

pub(crate) fn join(backend: &str, base: &Url, path: &str) -> Result<Url, BridgeError> {
    base.join(path)
        .map_err(|e| BridgeError::storage(backend, format!("Invalid endpoint path: {}", e)))
}

pub(crate) fn request_error(backend: &str, e: reqwest::Error) -> BridgeError {
    BridgeError::storage(backend, format!("Request failed: {}", e))
}

/// Turn a non-success response into a storage error carrying its body
pub(crate) async fn error_response(backend: &str, status: StatusCode, response: Response) -> BridgeError {
    let body = response.text().await.unwrap_or_default();
    BridgeError::storage(backend, format!("HTTP {}: {}", status, body))
}

pub(crate) async fn json_body(backend: &str, response: Response) -> Result<Value, BridgeError> {
    let status = response.status();
    if !status.is_success() {
        return Err(error_response(backend, status, response).await);
    }
    response
        .json()
        .await
        .map_err(|e| BridgeError::storage(backend, format!("Failed to parse response: {}", e)))
}
