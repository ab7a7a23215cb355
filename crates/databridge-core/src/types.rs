//! Core data types flowing through the bridge pipeline

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Scheduling priority; lower is processed first and `None` sorts ahead of
/// every numbered priority
pub type Priority = Option<i64>;

/// Items found while tailing live changes
pub const LIVE_PRIORITY: i64 = 0;

/// Items found while crawling history backwards
pub const BACKFILL_PRIORITY: i64 = 1;

/// Retried items sort behind fresh work; the attempt number is added on top
pub const RETRY_PRIORITY_BASE: i64 = 1000;

/// A record as seen in the feed (a stub) or fetched in full
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceItem {
    pub id: String,
    /// Modification stamp (ISO-8601)
    #[serde(rename = "dateModified", default)]
    pub date_modified: String,
    /// Remaining record fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ResourceItem {
    /// Create a stub carrying only id and stamp
    pub fn new(id: impl Into<String>, date_modified: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            date_modified: date_modified.into(),
            fields: Map::new(),
        }
    }

    /// Attach an extra field
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Build from a raw JSON document
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    /// Full JSON document, including id and stamp
    pub fn to_value(&self) -> Value {
        let mut doc = self.fields.clone();
        doc.insert("id".to_string(), Value::String(self.id.clone()));
        doc.insert(
            "dateModified".to_string(),
            Value::String(self.date_modified.clone()),
        );
        Value::Object(doc)
    }

    /// Look up a dotted path (`procuringEntity.kind`) in the record
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = match first {
            "id" | "dateModified" => return None,
            key => self.fields.get(key)?,
        };
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Which pipeline flow currently owns a pending record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowTag {
    Normal,
    Retry,
}

impl fmt::Display for FlowTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowTag::Normal => write!(f, "normal"),
            FlowTag::Retry => write!(f, "retry"),
        }
    }
}

/// Result of writing one record to the target store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated,
    /// Rejected because the store already holds a newer stamp; counts as success
    Skipped,
    Failed(String),
}

impl WriteOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, WriteOutcome::Failed(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            WriteOutcome::Created => "created",
            WriteOutcome::Updated => "updated",
            WriteOutcome::Skipped => "skipped",
            WriteOutcome::Failed(reason) => reason,
        }
    }
}

/// Per-record entry of a bulk write response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWrite {
    pub id: String,
    pub outcome: WriteOutcome,
}

impl BulkWrite {
    pub fn new(id: impl Into<String>, outcome: WriteOutcome) -> Self {
        Self {
            id: id.into(),
            outcome,
        }
    }

    pub fn success(&self) -> bool {
        self.outcome.is_success()
    }
}

fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(stamp) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(stamp, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Compare two modification stamps
///
/// Both sides are parsed as timestamps (with or without offset); when either
/// fails to parse the raw strings are compared.
pub fn compare_stamps(a: &str, b: &str) -> Ordering {
    match (parse_stamp(a), parse_stamp(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Whether a stored stamp already covers the candidate
pub fn is_current(stored: &str, candidate: &str) -> bool {
    compare_stamps(stored, candidate) != Ordering::Less
}

/// Generate a request id sent upstream as `X-Client-Request-ID`
pub fn generate_request_id(prefix: &str) -> String {
    format!("{}-req-{}", prefix, Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_item_round_trips_extra_fields() {
        let raw = json!({
            "id": "abc",
            "dateModified": "2024-01-02T10:00:00+02:00",
            "status": "active",
            "lots": [{"status": "active"}]
        });
        let item = ResourceItem::from_value(raw.clone()).unwrap();
        assert_eq!(item.id, "abc");
        assert_eq!(item.fields["status"], "active");
        assert_eq!(item.to_value(), raw);
    }

    #[test]
    fn test_lookup_dotted_path() {
        let item = ResourceItem::new("1", "2024-01-01T00:00:00Z")
            .with_field("procuringEntity", json!({"kind": "general"}))
            .with_field("lots", json!([{"status": "active"}]));
        assert_eq!(item.lookup("procuringEntity.kind"), Some(&json!("general")));
        assert_eq!(item.lookup("lots.0.status"), Some(&json!("active")));
        assert_eq!(item.lookup("procuringEntity.name"), None);
    }

    #[test]
    fn test_stamp_comparison_across_offsets() {
        assert_eq!(
            compare_stamps("2024-01-02T10:00:00+02:00", "2024-01-02T08:00:00Z"),
            Ordering::Equal
        );
        assert!(is_current(
            "2024-01-02T10:00:01.5+02:00",
            "2024-01-02T08:00:01Z"
        ));
        assert!(!is_current("2024-01-01T00:00:00", "2024-01-01T00:00:00.1"));
    }

    #[test]
    fn test_unparsable_stamps_compare_as_strings() {
        assert_eq!(compare_stamps("b", "a"), Ordering::Greater);
        assert!(is_current("same", "same"));
    }

    #[test]
    fn test_outcomes() {
        assert!(BulkWrite::new("1", WriteOutcome::Skipped).success());
        assert_eq!(WriteOutcome::Skipped.reason(), "skipped");
        let failed = BulkWrite::new("1", WriteOutcome::Failed("conflict".into()));
        assert!(!failed.success());
        assert_eq!(failed.outcome.reason(), "conflict");
    }

    #[test]
    fn test_priority_none_sorts_first() {
        let mut priorities: Vec<Priority> = vec![Some(RETRY_PRIORITY_BASE), Some(0), None];
        priorities.sort();
        assert_eq!(priorities, vec![None, Some(0), Some(RETRY_PRIORITY_BASE)]);
    }

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id("databridge");
        assert!(id.starts_with("databridge-req-"));
        assert_eq!(id.len(), "databridge-req-".len() + 36);
    }
}
