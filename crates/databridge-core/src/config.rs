//! Bridge configuration
//!
//! The configuration is loaded once at startup from a YAML or TOML file,
//! validated, and shared read-only behind an `Arc` afterwards. Every option
//! has a default except `resources_api_server`. Deployment files that keep
//! the settings under a top-level `main:` section are accepted as-is.
//!
//! Durations are expressed in (fractional) seconds, as in the deployment files.

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Minimum accepted value for `retrievers_params.up_wait_sleep`
pub const MIN_UP_WAIT_SLEEP: f64 = 30.0;

/// Process-wide bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Upstream resource API base URL (mandatory)
    pub resources_api_server: String,
    /// Upstream API version segment
    pub resources_api_version: String,
    /// Public API server used for item fetches, defaults to `resources_api_server`
    pub public_resources_api_server: Option<String>,
    /// Token sent with credential extraction requests
    pub resources_api_token: String,
    /// Resource collection name (`tenders`, `plans`, ...)
    pub resource: String,
    /// User agent prefix for API client handles
    pub user_agent: String,
    pub workers_min: usize,
    pub workers_max: usize,
    /// Occupancy percent at or above which the worker pool grows
    pub workers_inc_threshold: f64,
    /// Occupancy percent at or below which the worker pool shrinks
    pub workers_dec_threshold: f64,
    pub retry_workers_min: usize,
    pub retry_workers_max: usize,
    /// Number of concurrent change filter tasks
    pub filter_workers_count: usize,
    /// Liveness supervisor period
    pub watch_interval: f64,
    /// Capacities; zero or negative means unbounded
    pub resource_items_queue_size: i64,
    pub input_queue_size: i64,
    pub retry_resource_items_queue_size: i64,
    /// Queues controller period
    pub queues_controller_timeout: f64,
    /// Performance monitor period and sample window
    #[serde(alias = "perfomance_window")]
    pub performance_window: f64,
    /// Upper bound of the API client pool, defaults to `workers_max + retry_workers_max`
    pub api_clients_max: Option<usize>,
    pub filter_type: FilterKind,
    pub filter_config: RuleFilterConfig,
    pub worker_config: WorkerConfig,
    pub storage_config: StorageConfig,
    pub retrievers_params: RetrieverParams,
    pub extra_params: FeedParams,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            resources_api_server: String::new(),
            resources_api_version: "0".to_string(),
            public_resources_api_server: None,
            resources_api_token: String::new(),
            resource: "tenders".to_string(),
            user_agent: "bridge.basic".to_string(),
            workers_min: 1,
            workers_max: 3,
            workers_inc_threshold: 75.0,
            workers_dec_threshold: 35.0,
            retry_workers_min: 1,
            retry_workers_max: 2,
            filter_workers_count: 1,
            watch_interval: 10.0,
            resource_items_queue_size: 10_000,
            input_queue_size: 10_000,
            retry_resource_items_queue_size: -1,
            queues_controller_timeout: 60.0,
            performance_window: 300.0,
            api_clients_max: None,
            filter_type: FilterKind::default(),
            filter_config: RuleFilterConfig::default(),
            worker_config: WorkerConfig::default(),
            storage_config: StorageConfig::default(),
            retrievers_params: RetrieverParams::default(),
            extra_params: FeedParams::default(),
        }
    }
}

/// Change filter variant selected at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    /// Stamp comparison through the document store view
    #[default]
    BasicCouchdb,
    /// Stamp comparison through a search index multi-get
    BasicElasticsearch,
    /// JMESPath expressions over the raw record plus the stamp cache
    #[serde(alias = "jmespath")]
    Rules,
}

/// Expressions evaluated by the rule filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleFilterConfig {
    /// JMESPath expressions; a record passes when every one is truthy
    pub filters: Vec<String>,
}

/// Per-worker behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Induced delay increment for slow clients
    pub client_inc_step_timeout: f64,
    /// Induced delay decrement for fast clients
    pub client_dec_step_timeout: f64,
    /// Induced delay above which a client gets its session rotated
    pub drop_threshold_client_cookies: f64,
    /// Idle sleep when no API client is available
    pub worker_sleep: f64,
    /// Base retry delay, multiplied by the attempt number
    pub retry_default_timeout: f64,
    /// Attempts before a record is dropped
    pub retries_count: u32,
    /// Wait on an empty queue or client pool before re-checking shutdown
    pub queue_timeout: f64,
    pub bulk_save_limit: usize,
    pub bulk_save_interval: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            client_inc_step_timeout: 0.1,
            client_dec_step_timeout: 0.02,
            drop_threshold_client_cookies: 2.0,
            worker_sleep: 5.0,
            retry_default_timeout: 3.0,
            retries_count: 10,
            queue_timeout: 3.0,
            bulk_save_limit: 100,
            bulk_save_interval: 3.0,
        }
    }
}

/// Target store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Couchdb,
    Elasticsearch,
    Memory,
}

/// Target store and stamp cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub storage_type: StorageKind,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub db_name: String,
    /// Search index alias
    pub alias: Option<String>,
    pub bulk_query_limit: usize,
    pub bulk_query_interval: f64,
    /// Presence selects the Redis stamp cache
    pub cache_host: Option<String>,
    pub cache_port: u16,
    pub cache_db_name: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageKind::default(),
            host: "localhost".to_string(),
            port: 5984,
            user: None,
            password: None,
            db_name: "basic_bridge_db".to_string(),
            alias: None,
            bulk_query_limit: 100,
            bulk_query_interval: 3.0,
            cache_host: None,
            cache_port: 6379,
            cache_db_name: 0,
        }
    }
}

impl StorageConfig {
    /// Base URL of the store, with credentials when configured
    pub fn base_url(&self) -> String {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => {
                format!("http://{}:{}@{}:{}/", user, password, self.host, self.port)
            }
            _ => format!("http://{}:{}/", self.host, self.port),
        }
    }

    /// Redis URL of the stamp cache, if one is configured
    pub fn cache_url(&self) -> Option<String> {
        self.cache_host.as_ref().map(|host| {
            format!("redis://{}:{}/{}", host, self.cache_port, self.cache_db_name)
        })
    }

    pub fn bulk_query_interval(&self) -> Duration {
        secs(self.bulk_query_interval)
    }
}

/// Feed retriever pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverParams {
    /// Backoff after a failed page request
    pub down_requests_sleep: f64,
    /// Pause after a non-empty live page
    pub up_requests_sleep: f64,
    /// Pause after an empty live page
    pub up_wait_sleep: f64,
    /// Buffer between the feed crawlers and the input queue
    pub queue_size: usize,
}

impl Default for RetrieverParams {
    fn default() -> Self {
        Self {
            down_requests_sleep: 5.0,
            up_requests_sleep: 1.0,
            up_wait_sleep: MIN_UP_WAIT_SLEEP,
            queue_size: 1001,
        }
    }
}

/// Extra query parameters sent with every feed request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedParams {
    pub mode: String,
    pub limit: u32,
}

impl Default for FeedParams {
    fn default() -> Self {
        Self {
            mode: "_all_".to_string(),
            limit: 1000,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a file, YAML unless the extension is `.toml`
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> BridgeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config("config", format!("Failed to read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::load_from_toml(&content),
            _ => Self::load_from_yaml(&content),
        }
    }

    /// Parse YAML configuration, unwrapping a top-level `main:` section
    pub fn load_from_yaml(content: &str) -> BridgeResult<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(content)
            .map_err(|e| BridgeError::config("config", format!("Failed to parse YAML: {}", e)))?;
        let value = match value.get("main") {
            Some(main) => main.clone(),
            None => value,
        };
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(value)
            .map_err(|e| BridgeError::config("config", format!("Invalid YAML config: {}", e)))
    }

    /// Parse TOML configuration, unwrapping a top-level `[main]` table
    pub fn load_from_toml(content: &str) -> BridgeResult<Self> {
        let mut table: toml::Table = toml::from_str(content)
            .map_err(|e| BridgeError::config("config", format!("Failed to parse TOML: {}", e)))?;
        let value = match table.remove("main") {
            Some(main) => main,
            None => toml::Value::Table(table),
        };
        value
            .try_into()
            .map_err(|e| BridgeError::config("config", format!("Invalid TOML config: {}", e)))
    }

    /// Fail fast on missing or inconsistent settings
    pub fn validate(&self) -> BridgeResult<()> {
        if self.resources_api_server.trim().is_empty() {
            return Err(BridgeError::config(
                "resources_api_server",
                "In config dictionary empty or missing 'resources_api_server'",
            ));
        }
        if Url::parse(&self.resources_api_server).is_err() {
            return Err(BridgeError::config(
                "resources_api_server",
                "Invalid 'resources_api_server' url.",
            ));
        }
        if let Some(public) = &self.public_resources_api_server
            && Url::parse(public).is_err()
        {
            return Err(BridgeError::config(
                "public_resources_api_server",
                "Invalid 'public_resources_api_server' url.",
            ));
        }
        if self.retrievers_params.up_wait_sleep < MIN_UP_WAIT_SLEEP {
            return Err(BridgeError::config(
                "up_wait_sleep",
                format!(
                    "Invalid 'up_wait_sleep' in 'retrievers_params'. Value must be greater than {}.",
                    MIN_UP_WAIT_SLEEP
                ),
            ));
        }
        if self.workers_min > self.workers_max {
            return Err(BridgeError::config(
                "workers_min",
                "must not exceed 'workers_max'",
            ));
        }
        if self.retry_workers_min > self.retry_workers_max {
            return Err(BridgeError::config(
                "retry_workers_min",
                "must not exceed 'retry_workers_max'",
            ));
        }
        if self.workers_dec_threshold > self.workers_inc_threshold {
            return Err(BridgeError::config(
                "workers_dec_threshold",
                "must not exceed 'workers_inc_threshold'",
            ));
        }
        if self.filter_workers_count == 0 {
            return Err(BridgeError::config(
                "filter_workers_count",
                "at least one filter task is required",
            ));
        }
        if self.filter_type == FilterKind::Rules {
            crate::filter::compile_filters(&self.filter_config)?;
        }
        if self.storage_config.bulk_query_limit == 0 {
            return Err(BridgeError::config("bulk_query_limit", "cannot be zero"));
        }
        if self.worker_config.bulk_save_limit == 0 {
            return Err(BridgeError::config("bulk_save_limit", "cannot be zero"));
        }
        if self.performance_window <= 0.0 {
            return Err(BridgeError::config("perfomance_window", "must be positive"));
        }
        if let Some(max) = self.api_clients_max
            && max < self.workers_min
        {
            return Err(BridgeError::config(
                "api_clients_max",
                "must be at least 'workers_min'",
            ));
        }

        let store_matches_filter = matches!(
            (self.filter_type, self.storage_config.storage_type),
            (FilterKind::BasicCouchdb, StorageKind::Couchdb)
                | (FilterKind::BasicElasticsearch, StorageKind::Elasticsearch)
                | (FilterKind::Rules, _)
                | (_, StorageKind::Memory)
        );
        if !store_matches_filter {
            tracing::warn!(
                filter_type = ?self.filter_type,
                storage_type = ?self.storage_config.storage_type,
                "Filter type does not match storage type, stamp lookups go through the configured store"
            );
        }

        Ok(())
    }

    /// API server used for item fetches
    pub fn public_api_server(&self) -> &str {
        self.public_resources_api_server
            .as_deref()
            .unwrap_or(&self.resources_api_server)
    }

    /// Upper bound of the API client pool
    pub fn api_clients_max(&self) -> usize {
        self.api_clients_max
            .unwrap_or(self.workers_max + self.retry_workers_max)
            .max(self.workers_min)
    }

    pub fn watch_interval(&self) -> Duration {
        secs(self.watch_interval)
    }

    pub fn queues_controller_timeout(&self) -> Duration {
        secs(self.queues_controller_timeout)
    }

    pub fn performance_window(&self) -> Duration {
        secs(self.performance_window)
    }
}

impl WorkerConfig {
    pub fn worker_sleep(&self) -> Duration {
        secs(self.worker_sleep)
    }

    pub fn queue_timeout(&self) -> Duration {
        secs(self.queue_timeout)
    }

    pub fn bulk_save_interval(&self) -> Duration {
        secs(self.bulk_save_interval)
    }

    /// Delay before the `attempt`-th retry of a record
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        secs(self.retry_default_timeout * f64::from(attempt.max(1)))
    }
}

impl RetrieverParams {
    pub fn down_requests_sleep(&self) -> Duration {
        secs(self.down_requests_sleep)
    }

    pub fn up_requests_sleep(&self) -> Duration {
        secs(self.up_requests_sleep)
    }

    pub fn up_wait_sleep(&self) -> Duration {
        secs(self.up_wait_sleep)
    }
}

/// Convert configured seconds, clamping negative values to zero
pub(crate) fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
