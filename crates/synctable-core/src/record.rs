//! Records, row keys and versioned changes
//!
//! A record is a JSON object. Rows are identified by the values of the
//! table's primary-key fields, encoded canonically as a [`RowKey`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};

/// One row (or a partial row) of a result set
pub type Record = serde_json::Map<String, Value>;

/// Canonical identity of a row: the JSON array of its primary-key values
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey(String);

impl RowKey {
    /// Build the key of `record`, failing if any primary-key field is absent or null
    pub fn from_record(record: &Record, primary_keys: &[String]) -> SyncResult<Self> {
        if primary_keys.is_empty() {
            return Err(SyncError::InvalidRecord(
                "table declares no primary key".to_string(),
            ));
        }
        let mut values = Vec::with_capacity(primary_keys.len());
        for field in primary_keys {
            match record.get(field) {
                Some(value) if !value.is_null() => values.push(value.clone()),
                _ => {
                    return Err(SyncError::InvalidRecord(format!(
                        "missing primary key field '{}'",
                        field
                    )))
                }
            }
        }
        Ok(RowKey(Value::Array(values).to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Copy only the primary-key fields of `record`
pub fn key_fields(record: &Record, primary_keys: &[String]) -> Record {
    primary_keys
        .iter()
        .filter_map(|field| record.get(field).map(|v| (field.clone(), v.clone())))
        .collect()
}

/// Overlay `top` onto `base`, field by field
pub fn merge_into(base: &mut Record, top: &Record) {
    for (field, value) in top {
        base.insert(field.clone(), value.clone());
    }
}

/// A mutation of one row
///
/// `record` holds the primary key plus the changed fields. `version` is
/// assigned by the server and increases monotonically; client writes carry
/// version 0 and an `id` so the server can acknowledge them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub record: Record,
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

impl VersionedChange {
    /// A server-side change at `version`
    pub fn new(record: Record, version: u64) -> Self {
        Self {
            id: None,
            record,
            version,
            deleted: false,
            time: None,
        }
    }

    /// A server-side deletion of the row identified by `key`
    pub fn deletion(key: Record, version: u64) -> Self {
        Self {
            deleted: true,
            ..Self::new(key, version)
        }
    }

    /// Attach the id of the client write this change answers
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_row_key_uses_declared_order() {
        let pks = vec!["project_id".to_string(), "path".to_string()];
        let a = RowKey::from_record(&record(json!({"path": "a.txt", "project_id": 7})), &pks)
            .unwrap();
        assert_eq!(a.as_str(), r#"[7,"a.txt"]"#);
    }

    #[test]
    fn test_row_key_rejects_missing_or_null() {
        let pks = vec!["id".to_string()];
        assert!(matches!(
            RowKey::from_record(&record(json!({"done": true})), &pks),
            Err(SyncError::InvalidRecord(_))
        ));
        assert!(matches!(
            RowKey::from_record(&record(json!({"id": null})), &pks),
            Err(SyncError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_merge_into_overwrites_fields() {
        let mut base = record(json!({"id": 1, "done": false, "title": "a"}));
        merge_into(&mut base, &record(json!({"id": 1, "done": true})));
        assert_eq!(base, record(json!({"id": 1, "done": true, "title": "a"})));
    }

    #[test]
    fn test_change_serialization_skips_defaults() {
        let change = VersionedChange::new(record(json!({"id": 1})), 4);
        let text = serde_json::to_string(&change).unwrap();
        assert!(!text.contains("deleted"));
        assert!(!text.contains("\"id\":\""));

        let parsed: VersionedChange = serde_json::from_str(r#"{"record":{"id":1}}"#).unwrap();
        assert_eq!(parsed.version, 0);
        assert!(!parsed.deleted);
    }
}
