//! Elasticsearch search index store

use crate::http::{build_client, error_response, join, json_body, parse_base, request_error};
use async_trait::async_trait;
use chrono::DateTime;
use databridge_core::types::{BulkWrite, ResourceItem, WriteOutcome};
use databridge_core::{BridgeError, BridgeResult, DocumentStore};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::{debug, info};
use url::Url;

const BACKEND: &str = "elasticsearch";

/// Field limit applied to the index mapping
pub const TOTAL_FIELDS_LIMIT: u32 = 4000;

/// Search index used as the target store
///
/// Writes use external-gte versioning derived from `dateModified`, so the
/// index itself rejects a write older than what it holds; such rejections
/// are reported as skipped.
#[derive(Clone)]
pub struct ElasticsearchStore {
    http: Client,
    base: Url,
    index: String,
    alias: String,
}

impl std::fmt::Debug for ElasticsearchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticsearchStore")
            .field("index", &self.index)
            .field("alias", &self.alias)
            .finish()
    }
}

/// External version of a record: its stamp in epoch milliseconds
fn external_version(stamp: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|parsed| parsed.timestamp_millis())
        .filter(|millis| *millis >= 0)
}

impl ElasticsearchStore {
    /// Connect and make sure the index, its alias and its settings exist
    pub async fn connect(
        base_url: &str,
        index: impl Into<String>,
        alias: impl Into<String>,
    ) -> BridgeResult<Self> {
        let store = Self {
            http: build_client(BACKEND)?,
            base: parse_base(BACKEND, base_url)?,
            index: index.into(),
            alias: alias.into(),
        };
        store.prepare().await?;
        Ok(store)
    }

    fn endpoint(&self, path: &str) -> BridgeResult<Url> {
        join(BACKEND, &self.base, path)
    }

    async fn prepare(&self) -> BridgeResult<()> {
        let response = self
            .http
            .put(self.endpoint(&self.index)?)
            .send()
            .await
            .map_err(|e| request_error(BACKEND, e))?;
        match response.status() {
            status if status.is_success() => info!(index = %self.index, "Index created"),
            // Already exists
            StatusCode::BAD_REQUEST => debug!(index = %self.index, "Index exists"),
            status => return Err(error_response(BACKEND, status, response).await),
        }

        let response = self
            .http
            .put(self.endpoint(&format!("{}/_alias/{}", self.index, self.alias))?)
            .send()
            .await
            .map_err(|e| request_error(BACKEND, e))?;
        json_body(BACKEND, response).await?;

        let response = self
            .http
            .get(self.endpoint(&format!(
                "{}/_settings/index.mapping.total_fields.limit",
                self.index
            ))?)
            .send()
            .await
            .map_err(|e| request_error(BACKEND, e))?;
        let settings = json_body(BACKEND, response).await?;
        let limit = settings
            .pointer(&format!(
                "/{}/settings/index/mapping/total_fields/limit",
                self.index
            ))
            .and_then(Value::as_str)
            .unwrap_or("1000");
        if limit != TOTAL_FIELDS_LIMIT.to_string() {
            let response = self
                .http
                .put(self.endpoint(&format!("{}/_settings", self.index))?)
                .json(&json!({ "index.mapping.total_fields.limit": TOTAL_FIELDS_LIMIT }))
                .send()
                .await
                .map_err(|e| request_error(BACKEND, e))?;
            json_body(BACKEND, response).await?;
            info!(index = %self.index, limit = TOTAL_FIELDS_LIMIT, "Total fields limit updated");
        }
        Ok(())
    }

    fn bulk_body(items: &[ResourceItem]) -> BridgeResult<String> {
        let mut body = String::new();
        for item in items {
            let mut action = json!({ "_id": item.id });
            if let Some(version) = external_version(&item.date_modified) {
                action["version"] = json!(version);
                action["version_type"] = json!("external_gte");
            }
            body.push_str(&serde_json::to_string(&json!({ "index": action }))?);
            body.push('\n');
            body.push_str(&serde_json::to_string(&item.to_value())?);
            body.push('\n');
        }
        Ok(body)
    }
}

/// Map one `_bulk` response item onto a write outcome
fn bulk_outcome(action: &Value) -> WriteOutcome {
    match action.get("status").and_then(Value::as_u64) {
        Some(201) => WriteOutcome::Created,
        Some(200) => WriteOutcome::Updated,
        Some(409) => WriteOutcome::Skipped,
        _ => WriteOutcome::Failed(
            action
                .pointer("/error/reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        ),
    }
}

#[async_trait]
impl DocumentStore for ElasticsearchStore {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn get(&self, id: &str) -> BridgeResult<Option<Value>> {
        let response = self
            .http
            .get(self.endpoint(&format!("{}/_doc/{}", self.alias, id))?)
            .send()
            .await
            .map_err(|e| request_error(BACKEND, e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = json_body(BACKEND, response).await?;
        Ok(body.get("_source").cloned())
    }

    async fn put(&self, item: &ResourceItem) -> BridgeResult<()> {
        let results = self.save_bulk(vec![item.clone()]).await?;
        match results.into_iter().next().map(|write| write.outcome) {
            Some(WriteOutcome::Failed(reason)) => Err(BridgeError::storage(BACKEND, reason)),
            Some(_) => Ok(()),
            None => Err(BridgeError::storage(BACKEND, "Empty bulk response")),
        }
    }

    async fn save_bulk(&self, items: Vec<ResourceItem>) -> BridgeResult<Vec<BulkWrite>> {
        let body = Self::bulk_body(&items)?;
        let response = self
            .http
            .post(self.endpoint(&format!("{}/_bulk", self.alias))?)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| request_error(BACKEND, e))?;
        let body = json_body(BACKEND, response).await?;

        Ok(body
            .get("items")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|item| {
                let action = item.get("index")?;
                let id = action.get("_id")?.as_str()?;
                Some(BulkWrite::new(id, bulk_outcome(action)))
            })
            .collect())
    }

    async fn filter_bulk(
        &self,
        candidates: &HashMap<String, String>,
    ) -> BridgeResult<HashMap<String, String>> {
        let ids: Vec<&String> = candidates.keys().collect();
        let mut url = self.endpoint(&format!("{}/_mget", self.alias))?;
        url.query_pairs_mut()
            .append_pair("_source_includes", "dateModified");

        let response = self
            .http
            .post(url)
            .json(&json!({ "ids": ids }))
            .send()
            .await
            .map_err(|e| BridgeError::Lookup(format!("Multi-get failed: {}", e)))?;
        let body = json_body(BACKEND, response)
            .await
            .map_err(|e| BridgeError::Lookup(e.to_string()))?;

        Ok(body
            .get("docs")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|doc| doc.get("found").and_then(Value::as_bool) == Some(true))
            .filter_map(|doc| {
                let id = doc.get("_id")?.as_str()?;
                let stamp = doc.pointer("/_source/dateModified")?.as_str()?;
                Some((id.to_string(), stamp.to_string()))
            })
            .collect())
    }
}
