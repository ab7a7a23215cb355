//! CouchDB document store
//!
//! On startup the database is created if missing, together with two design
//! documents: a `date_modified` view keyed by document id and a
//! `validate_doc_update` function rejecting writes that are not newer than
//! the stored revision. Writes rejected by that function are reported as
//! skipped.

use crate::http::{build_client, error_response, join, json_body, parse_base, request_error};
use async_trait::async_trait;
use databridge_core::types::{BulkWrite, ResourceItem, WriteOutcome};
use databridge_core::{BridgeError, BridgeResult, DocumentStore};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::{debug, info};
use url::Url;

const BACKEND: &str = "couchdb";

pub const VALIDATE_DOC_ID: &str = "_design/validate_date_modified";

/// Rejection message of the validation function
pub const OLDER_DOC_REASON: &str = "New doc with oldest dateModified.";

const VALIDATE_DOC_UPDATE: &str = r#"function(newDoc, oldDoc, userCtx) {
    if (oldDoc && (newDoc.dateModified <= oldDoc.dateModified)) {
        throw({forbidden: 'New doc with oldest dateModified.' });
    };
}"#;

const DATE_MODIFIED_MAP: &str = "function(doc) { if (doc.dateModified) { emit(doc._id, doc.dateModified); } }";

/// Document store backed by a CouchDB database
#[derive(Clone)]
pub struct CouchDbStore {
    http: Client,
    db_url: Url,
    resource: String,
}

impl std::fmt::Debug for CouchDbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchDbStore")
            .field("db", &self.db_url.path())
            .field("resource", &self.resource)
            .finish()
    }
}

impl CouchDbStore {
    /// Connect to `db_name` on the server at `base_url`, preparing it for use
    pub async fn connect(
        base_url: &str,
        db_name: &str,
        resource: impl Into<String>,
    ) -> BridgeResult<Self> {
        let server = parse_base(BACKEND, base_url)?;
        let db_url = join(BACKEND, &server, &format!("{}/", db_name))?;
        let store = Self {
            http: build_client(BACKEND)?,
            db_url,
            resource: resource.into(),
        };
        store.prepare().await?;
        Ok(store)
    }

    fn endpoint(&self, path: &str) -> BridgeResult<Url> {
        join(BACKEND, &self.db_url, path)
    }

    fn view_path(&self) -> String {
        format!("_design/{}/_view/date_modified", self.resource)
    }

    async fn prepare(&self) -> BridgeResult<()> {
        let response = self
            .http
            .put(self.db_url.clone())
            .send()
            .await
            .map_err(|e| request_error(BACKEND, e))?;
        match response.status() {
            StatusCode::CREATED => info!(db = %self.db_url.path(), "Database created"),
            StatusCode::PRECONDITION_FAILED => debug!(db = %self.db_url.path(), "Database exists"),
            status => return Err(error_response(BACKEND, status, response).await),
        }

        let views = json!({
            "views": { "date_modified": { "map": DATE_MODIFIED_MAP } }
        });
        self.sync_design(&format!("_design/{}", self.resource), views).await?;

        let validate = json!({ "validate_doc_update": VALIDATE_DOC_UPDATE });
        self.sync_design(VALIDATE_DOC_ID, validate).await
    }

    /// Save a design document unless it already holds `fields`
    async fn sync_design(&self, id: &str, fields: Value) -> BridgeResult<()> {
        let mut doc = self.get(id).await?.unwrap_or_else(|| json!({ "_id": id }));
        let Some(object) = doc.as_object_mut() else {
            return Err(BridgeError::storage(BACKEND, format!("{} is not an object", id)));
        };
        let current = fields
            .as_object()
            .is_some_and(|fields| fields.iter().all(|(k, v)| object.get(k) == Some(v)));
        if current {
            debug!(design = id, "Design document already exists");
            return Ok(());
        }
        if let Some(fields) = fields.as_object() {
            for (key, value) in fields {
                object.insert(key.clone(), value.clone());
            }
        }

        let response = self
            .http
            .put(self.endpoint(id)?)
            .json(&doc)
            .send()
            .await
            .map_err(|e| request_error(BACKEND, e))?;
        json_body(BACKEND, response).await?;
        info!(design = id, "Design document saved");
        Ok(())
    }

    /// Current revisions of `ids`; unknown ids are absent
    async fn revisions(&self, ids: &[String]) -> BridgeResult<HashMap<String, String>> {
        let response = self
            .http
            .post(self.endpoint("_all_docs")?)
            .json(&json!({ "keys": ids }))
            .send()
            .await
            .map_err(|e| request_error(BACKEND, e))?;
        let body = json_body(BACKEND, response).await?;

        Ok(rows(&body)
            .filter_map(|row| {
                let id = row.get("id")?.as_str()?;
                let rev = row.get("value")?.get("rev")?.as_str()?;
                Some((id.to_string(), rev.to_string()))
            })
            .collect())
    }
}

fn rows(body: &Value) -> impl Iterator<Item = &Value> {
    body.get("rows")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

/// Map one `_bulk_docs` result entry onto a write outcome
fn bulk_outcome(entry: &Value) -> WriteOutcome {
    if entry.get("ok").and_then(Value::as_bool) == Some(true) {
        let rev = entry.get("rev").and_then(Value::as_str).unwrap_or_default();
        return if rev.starts_with("1-") {
            WriteOutcome::Created
        } else {
            WriteOutcome::Updated
        };
    }
    let reason = entry
        .get("reason")
        .and_then(Value::as_str)
        .or_else(|| entry.get("error").and_then(Value::as_str))
        .unwrap_or("unknown error");
    if reason == OLDER_DOC_REASON {
        WriteOutcome::Skipped
    } else {
        WriteOutcome::Failed(reason.to_string())
    }
}

#[async_trait]
impl DocumentStore for CouchDbStore {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn get(&self, id: &str) -> BridgeResult<Option<Value>> {
        let response = self
            .http
            .get(self.endpoint(id)?)
            .send()
            .await
            .map_err(|e| request_error(BACKEND, e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        json_body(BACKEND, response).await.map(Some)
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
        let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
        let revisions = self.revisions(&ids).await?;

        let docs: Vec<Value> = items
            .iter()
            .map(|item| {
                let mut doc = item.to_value();
                if let Some(object) = doc.as_object_mut() {
                    object.insert("_id".to_string(), json!(item.id));
                    object.remove("id");
                    if let Some(rev) = revisions.get(&item.id) {
                        object.insert("_rev".to_string(), json!(rev));
                    }
                }
                doc
            })
            .collect();

        let response = self
            .http
            .post(self.endpoint("_bulk_docs")?)
            .json(&json!({ "docs": docs }))
            .send()
            .await
            .map_err(|e| request_error(BACKEND, e))?;
        let body = json_body(BACKEND, response).await?;
        let entries = body
            .as_array()
            .ok_or_else(|| BridgeError::storage(BACKEND, "Unexpected _bulk_docs response"))?;

        Ok(entries
            .iter()
            .filter_map(|entry| {
                let id = entry.get("id")?.as_str()?;
                Some(BulkWrite::new(id, bulk_outcome(entry)))
            })
            .collect())
    }

    async fn filter_bulk(
        &self,
        candidates: &HashMap<String, String>,
    ) -> BridgeResult<HashMap<String, String>> {
        let keys: Vec<&String> = candidates.keys().collect();
        let response = self
            .http
            .post(self.endpoint(&self.view_path())?)
            .json(&json!({ "keys": keys }))
            .send()
            .await
            .map_err(|e| BridgeError::Lookup(format!("View query failed: {}", e)))?;
        let body = json_body(BACKEND, response)
            .await
            .map_err(|e| BridgeError::Lookup(e.to_string()))?;

        Ok(rows(&body)
            .filter_map(|row| {
                let id = row.get("id")?.as_str()?;
                let stamp = row.get("value")?.as_str()?;
                Some((id.to_string(), stamp.to_string()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn prepared_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bridge_db/"))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bridge_db/_design/tenders"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bridge_db/_design/validate_date_modified"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_id": VALIDATE_DOC_ID,
                "_rev": "1-abc",
                "validate_doc_update": VALIDATE_DOC_UPDATE,
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/bridge_db/_design/tenders"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;
        server
    }

    async fn store(server: &MockServer) -> CouchDbStore {
        CouchDbStore::connect(&server.uri(), "bridge_db", "tenders")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_filter_bulk_reads_view_by_ids() {
        let server = prepared_server().await;
        Mock::given(method("POST"))
            .and(path("/bridge_db/_design/tenders/_view/date_modified"))
            .and(body_json(json!({"keys": ["a"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rows": [{"id": "a", "key": "a", "value": "2024-01-01T00:00:00Z"}]
            })))
            .mount(&server)
            .await;
        let store = store(&server).await;

        let candidates = HashMap::from([("a".to_string(), "2024-02-01T00:00:00Z".to_string())]);
        let stored = store.filter_bulk(&candidates).await.unwrap();
        assert_eq!(stored["a"], "2024-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_save_bulk_maps_outcomes() {
        let server = prepared_server().await;
        Mock::given(method("POST"))
            .and(path("/bridge_db/_all_docs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rows": [
                    {"id": "b", "key": "b", "value": {"rev": "1-x"}},
                    {"id": "c", "key": "c", "value": {"rev": "3-y"}},
                    {"key": "a", "error": "not_found"},
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bridge_db/_bulk_docs"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([
                {"id": "a", "ok": true, "rev": "1-new"},
                {"id": "b", "ok": true, "rev": "2-new"},
                {"id": "c", "error": "forbidden", "reason": OLDER_DOC_REASON},
                {"id": "d", "error": "conflict", "reason": "Document update conflict."},
            ])))
            .mount(&server)
            .await;
        let store = store(&server).await;

        let items = ["a", "b", "c", "d"]
            .iter()
            .map(|id| ResourceItem::new(*id, "2024-01-01T00:00:00Z"))
            .collect();
        let results = store.save_bulk(items).await.unwrap();
        let outcomes: Vec<_> = results.iter().map(|w| w.outcome.clone()).collect();
        assert_eq!(
            outcomes,
            vec![
                WriteOutcome::Created,
                WriteOutcome::Updated,
                WriteOutcome::Skipped,
                WriteOutcome::Failed("Document update conflict.".to_string()),
            ]
        );
        assert!(results[2].success());
        assert!(!results[3].success());
    }

    #[tokio::test]
    async fn test_get_missing_document() {
        let server = prepared_server().await;
        Mock::given(method("GET"))
            .and(path("/bridge_db/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let store = store(&server).await;
        assert_eq!(store.get("missing").await.unwrap(), None);
        assert_eq!(
            store.get_or("missing", json!({})).await.unwrap(),
            json!({})
        );
    }
}
