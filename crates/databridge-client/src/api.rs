//! Resource API client
//!
//! Every [`ApiResourceClient`] is one upstream session: construction requests
//! the `spore` endpoint, which sets the session cookie, and every later
//! request goes through the same cookie store. Dropping the handle drops the
//! session.
//!
//! | Status | Error | Pipeline reaction |
//! |--------|-------|-------------------|
//! | 404 | `NotFound` | retry, the public API may lag |
//! | 410 | `Gone` | drop |
//! | 429 | `Throttled` | retry |
//! | other non-2xx | `Upstream` | retry |

use async_trait::async_trait;
use databridge_core::backoff::Backoff;
use databridge_core::config::BridgeConfig;
use databridge_core::types::{ResourceItem, generate_request_id};
use databridge_core::{BridgeError, BridgeResult, ClientFactory, ResourceClient};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Default timeout for upstream requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Prefix of the `X-Client-Request-ID` values
pub const REQUEST_ID_PREFIX: &str = "databridge";

pub const REQUEST_ID_HEADER: &str = "X-Client-Request-ID";

/// Where and how to reach the resource API
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub host_url: String,
    pub api_version: String,
    pub resource: String,
    pub token: String,
    pub timeout: Duration,
}

impl ApiSettings {
    /// Settings for item fetches against the public API server
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            host_url: config.public_api_server().to_string(),
            api_version: config.resources_api_version.clone(),
            resource: config.resource.clone(),
            token: config.resources_api_token.clone(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// `{host}/api/{version}/`
    pub fn api_base(&self) -> BridgeResult<Url> {
        let host = self.host_url.trim_end_matches('/');
        Url::parse(&format!("{}/api/{}/", host, self.api_version)).map_err(|e| {
            BridgeError::config("resources_api_server", format!("Invalid url: {}", e))
        })
    }
}

/// Map a non-success upstream status onto the pipeline's error kinds
pub(crate) fn status_error(status: StatusCode, body: String) -> BridgeError {
    match status {
        StatusCode::NOT_FOUND => BridgeError::NotFound(body),
        StatusCode::GONE => BridgeError::Gone(body),
        StatusCode::TOO_MANY_REQUESTS => BridgeError::Throttled(body),
        _ => BridgeError::Upstream {
            status: status.as_u16(),
            reason: body,
        },
    }
}

/// One upstream session
#[derive(Clone)]
pub struct ApiResourceClient {
    http: Client,
    base: Url,
    resource: String,
    token: String,
    user_agent: String,
    credentials_backoff: Backoff,
}

impl std::fmt::Debug for ApiResourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiResourceClient")
            .field("base", &self.base.as_str())
            .field("resource", &self.resource)
            .field("user_agent", &self.user_agent)
            .field("has_token", &!self.token.is_empty())
            .finish()
    }
}

impl ApiResourceClient {
    /// Open a session as `user_agent`
    pub async fn connect(settings: &ApiSettings, user_agent: impl Into<String>) -> BridgeResult<Self> {
        let user_agent = user_agent.into();
        let http = Client::builder()
            .timeout(settings.timeout)
            .user_agent(user_agent.clone())
            .cookie_store(true)
            .build()
            .map_err(|e| BridgeError::ClientCreation(format!("Failed to create HTTP client: {}", e)))?;

        let client = Self {
            http,
            base: settings.api_base()?,
            resource: settings.resource.clone(),
            token: settings.token.clone(),
            user_agent,
            credentials_backoff: Backoff::CREDENTIALS,
        };

        let spore = client.endpoint("spore")?;
        let response = client
            .with_request_id(client.http.get(spore))
            .send()
            .await
            .map_err(|e| BridgeError::ClientCreation(format!("Spore request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::ClientCreation(format!(
                "Spore request returned {}",
                status
            )));
        }
        debug!(user_agent = %client.user_agent, "API session opened");
        Ok(client)
    }

    /// Override the retry schedule of `extract_credentials`
    pub fn with_credentials_backoff(mut self, backoff: Backoff) -> Self {
        self.credentials_backoff = backoff;
        self
    }

    fn endpoint(&self, path: &str) -> BridgeResult<Url> {
        self.base
            .join(path)
            .map_err(|e| BridgeError::Connection(format!("Invalid endpoint path: {}", e)))
    }

    fn resource_url(&self, path: &str) -> BridgeResult<Url> {
        self.endpoint(&format!("{}/{}", self.resource, path))
    }

    fn with_request_id(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header(REQUEST_ID_HEADER, generate_request_id(REQUEST_ID_PREFIX))
    }

    fn with_auth(&self, builder: RequestBuilder) -> RequestBuilder {
        if self.token.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.token, Some(""))
        }
    }

    /// GET `url` and return the `data` member of the response
    async fn get_data(&self, url: Url, authenticated: bool) -> BridgeResult<Value> {
        let mut request = self.with_request_id(self.http.get(url.clone()));
        if authenticated {
            request = self.with_auth(request);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BridgeError::Connection(format!("GET {} failed: {}", url.path(), e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let mut body: Value = response.json().await.map_err(|e| {
            BridgeError::Serialization(format!("Failed to parse response: {}", e))
        })?;
        Ok(body
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ResourceClient for ApiResourceClient {
    fn user_agent(&self) -> &str {
        &self.user_agent
    }

    async fn get_item(&self, id: &str) -> BridgeResult<ResourceItem> {
        let data = self.get_data(self.resource_url(id)?, false).await?;
        Ok(ResourceItem::from_value(data)?)
    }

    async fn extract_credentials(&self, id: &str) -> BridgeResult<Value> {
        let url = self.resource_url(&format!("{}/extract_credentials", id))?;
        self.credentials_backoff
            .retry("extract_credentials", || self.get_data(url.clone(), true))
            .await
    }
}

/// Creates [`ApiResourceClient`] sessions for the client pool
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    settings: ApiSettings,
}

impl HttpClientFactory {
    pub fn new(settings: ApiSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ClientFactory for HttpClientFactory {
    async fn create(&self, user_agent: &str) -> BridgeResult<Arc<dyn ResourceClient>> {
        Ok(Arc::new(ApiResourceClient::connect(&self.settings, user_agent).await?))
    }
}
