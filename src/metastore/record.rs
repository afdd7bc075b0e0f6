use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::MetaError;
use crate::handle::{Extensions, Metadata};

/// Persisted counterpart of a stored item. One record per id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    /// Content location, relative to the storage root for primary records.
    pub path: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub extensions: Extensions,
}

impl FileRecord {
    pub fn to_vec(&self) -> Result<Vec<u8>, MetaError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, MetaError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Record selection. Every set criterion must hold.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    id_prefix: Option<String>,
    metadata: Metadata,
    created_after: Option<DateTime<Utc>>,
    created_before: Option<DateTime<Utc>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `metadata[key] == value`.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn matches(&self, record: &FileRecord) -> bool {
        if let Some(prefix) = &self.id_prefix {
            if !record.id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if record.created_at <= after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if record.created_at >= before {
                return false;
            }
        }
        self.metadata
            .iter()
            .all(|(key, value)| record.metadata.get(key) == Some(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKey {
    Id,
    CreatedAt,
    Metadata(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub key: SortKey,
    pub order: SortOrder,
}

impl Sort {
    pub fn ascending(key: SortKey) -> Self {
        Self {
            key,
            order: SortOrder::Ascending,
        }
    }

    pub fn descending(key: SortKey) -> Self {
        Self {
            key,
            order: SortOrder::Descending,
        }
    }

    pub fn compare(&self, a: &FileRecord, b: &FileRecord) -> Ordering {
        let ord = match &self.key {
            SortKey::Id => a.id.cmp(&b.id),
            SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
            SortKey::Metadata(key) => compare_values(a.metadata.get(key), b.metadata.get(key)),
        };
        match self.order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        }
    }

    /// Sorts `records` in place; ties keep their relative order.
    pub fn apply(&self, records: &mut [FileRecord]) {
        records.sort_by(|a, b| self.compare(a, b));
    }
}

/// Missing values sort first, then numbers, then strings, then anything else
/// by its JSON text.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(_) => 3,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => match rank(a).cmp(&rank(b)) {
            Ordering::Equal => {
                let x = a.map(Value::to_string).unwrap_or_default();
                let y = b.map(Value::to_string).unwrap_or_default();
                x.cmp(&y)
            }
            other => other,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(id: &str, secs: i64, metadata: Value) -> FileRecord {
        FileRecord {
            id: id.to_string(),
            path: id.to_string(),
            metadata: metadata.as_object().cloned().unwrap_or_default(),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            extensions: Extensions::new(),
        }
    }

    #[test]
    fn test_record_roundtrip_through_bytes() {
        let mut rec = record("a1", 10, json!({"tag": "x"}));
        rec.extensions.set("gzip", "gzipped", true);
        let back = FileRecord::from_slice(&rec.to_vec().unwrap()).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_record_without_optional_fields_decodes() {
        let raw = br#"{"id":"a","path":"a","created_at":"2024-01-01T00:00:00Z"}"#;
        let rec = FileRecord::from_slice(raw).unwrap();
        assert!(rec.metadata.is_empty());
        assert!(rec.extensions.is_empty());
    }

    #[test]
    fn test_filter_matches() {
        let rec = record("photos/1", 100, json!({"tag": "x", "size": 3}));

        assert!(Filter::new().matches(&rec));
        assert!(Filter::new().meta("tag", "x").matches(&rec));
        assert!(!Filter::new().meta("tag", "y").matches(&rec));
        assert!(!Filter::new().meta("missing", "x").matches(&rec));
        assert!(Filter::new().meta("size", 3).id_prefix("photos").matches(&rec));
        assert!(!Filter::new().id_prefix("docs").matches(&rec));
        assert!(Filter::new()
            .created_after(Utc.timestamp_opt(50, 0).unwrap())
            .created_before(Utc.timestamp_opt(150, 0).unwrap())
            .matches(&rec));
        assert!(!Filter::new()
            .created_after(Utc.timestamp_opt(100, 0).unwrap())
            .matches(&rec));
    }

    #[test]
    fn test_sort_by_metadata_numbers_and_missing() {
        let mut records = vec![
            record("a", 1, json!({"n": 10})),
            record("b", 2, json!({})),
            record("c", 3, json!({"n": 9})),
            record("d", 4, json!({"n": "text"})),
        ];
        Sort::ascending(SortKey::Metadata("n".into())).apply(&mut records);
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a", "d"]);

        Sort::descending(SortKey::CreatedAt).apply(&mut records);
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c", "b", "a"]);
    }
}
