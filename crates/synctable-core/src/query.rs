//! Queries, query options and query keys
//!
//! A query names one table and carries a template record: keys are the
//! requested columns, `null` values select a column and any other value is an
//! equality filter.
//!
//! ```text
//! {"tasks": [{"id": null, "done": null, "project_id": 7}]}
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{SyncError, SyncResult};
use crate::record::Record;

/// Primary key used when neither the options nor the schema declare one
pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// A declarative query over one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Query {
    table: String,
    template: Record,
}

impl Query {
    pub fn new(table: impl Into<String>, template: Record) -> Self {
        Self {
            table: table.into(),
            template,
        }
    }

    /// Parse the `{table: [template]}` form
    pub fn from_json(value: &Value) -> SyncResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| SyncError::InvalidQuery("query must be an object".to_string()))?;
        if object.len() != 1 {
            return Err(SyncError::InvalidQuery(format!(
                "query must name exactly one table, found {}",
                object.len()
            )));
        }
        let (table, body) = object.iter().next().ok_or_else(|| {
            SyncError::InvalidQuery("query must name exactly one table".to_string())
        })?;
        let template = match body.as_array().map(Vec::as_slice) {
            Some([Value::Object(template)]) => template.clone(),
            _ => {
                return Err(SyncError::InvalidQuery(format!(
                    "table '{}' must map to an array holding one template object",
                    table
                )))
            }
        };
        Ok(Self::new(table.clone(), template))
    }

    /// Parse a query from JSON text
    pub fn parse(text: &str) -> SyncResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SyncError::InvalidQuery(format!("not valid JSON: {}", e)))?;
        Self::from_json(&value)
    }

    pub fn to_json(&self) -> Value {
        let mut object = serde_json::Map::new();
        object.insert(
            self.table.clone(),
            Value::Array(vec![Value::Object(self.template.clone())]),
        );
        Value::Object(object)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn template(&self) -> &Record {
        &self.template
    }

    /// Columns the query asks for, filters included
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.template.keys().map(String::as_str)
    }

    /// Equality filters (template entries with a non-null value)
    pub fn filters(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.template.iter().filter(|(_, v)| !v.is_null())
    }

    /// Whether `record` passes every equality filter
    pub fn matches(&self, record: &Record) -> bool {
        self.filters()
            .all(|(field, expected)| record.get(field) == Some(expected))
    }

    /// Restrict `record` to the requested columns plus the primary key
    pub fn project(&self, record: &Record, primary_keys: &[String]) -> Record {
        record
            .iter()
            .filter(|(field, _)| {
                self.template.contains_key(*field) || primary_keys.contains(*field)
            })
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect()
    }
}

impl TryFrom<Value> for Query {
    type Error = SyncError;

    fn try_from(value: Value) -> SyncResult<Self> {
        Self::from_json(&value)
    }
}

impl From<Query> for Value {
    fn from(query: Query) -> Self {
        query.to_json()
    }
}

/// Modifiers attached to a query; part of its cache key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOption {
    /// Return at most this many rows
    Limit(u64),
    /// Order rows by this column (prefix with `-` for descending)
    OrderBy(String),
    /// The fields that identify a row
    PrimaryKey(Vec<String>),
    /// One-shot query: no pushed updates after the snapshot
    NoChangefeed,
    /// Local-only table with no backend at all
    Ephemeral,
}

impl QueryOption {
    fn to_json(&self) -> Value {
        match self {
            QueryOption::Limit(n) => json!({ "limit": n }),
            QueryOption::OrderBy(field) => json!({ "order_by": field }),
            QueryOption::PrimaryKey(fields) => json!({ "primary_key": fields }),
            QueryOption::NoChangefeed => json!("no_changefeed"),
            QueryOption::Ephemeral => json!("ephemeral"),
        }
    }

    /// Parse one option from its JSON form, e.g. `{"limit": 10}` or `"no_changefeed"`
    pub fn parse(text: &str) -> SyncResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| SyncError::InvalidQuery(format!("invalid query option '{}': {}", text, e)))
    }
}

/// Look up the limit option, if any
pub fn limit(options: &[QueryOption]) -> Option<u64> {
    options.iter().find_map(|o| match o {
        QueryOption::Limit(n) => Some(*n),
        _ => None,
    })
}

/// Look up the order-by option, if any
pub fn order_by(options: &[QueryOption]) -> Option<&str> {
    options.iter().find_map(|o| match o {
        QueryOption::OrderBy(field) => Some(field.as_str()),
        _ => None,
    })
}

pub fn has_option(options: &[QueryOption], wanted: &QueryOption) -> bool {
    options.iter().any(|o| o == wanted)
}

/// Primary keys declared by a `primary_key` option
pub fn declared_primary_keys(options: &[QueryOption]) -> Option<Vec<String>> {
    options.iter().find_map(|o| match o {
        QueryOption::PrimaryKey(fields) if !fields.is_empty() => Some(fields.clone()),
        _ => None,
    })
}

/// Ordering of JSON values used for `order_by`
///
/// Nulls sort first, then booleans, numbers and strings; other values compare
/// by their JSON text.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a)
            .cmp(&rank(b))
            .then_with(|| a.map(Value::to_string).cmp(&b.map(Value::to_string))),
    }
}

/// Canonical identity of a (query, options) pair
///
/// The template is an ordered map, so equal queries serialize identically;
/// option order is significant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(String);

impl QueryKey {
    pub fn new(query: &Query, options: &[QueryOption]) -> Self {
        let options = Value::Array(options.iter().map(QueryOption::to_json).collect());
        QueryKey(format!("{}|{}", query.to_json(), options))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Primary-key declarations per table
#[derive(Debug, Clone, Default)]
pub struct Schema {
    tables: HashMap<String, Vec<String>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the primary key of `table`
    pub fn with_table<I, S>(mut self, table: impl Into<String>, primary_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables.insert(
            table.into(),
            primary_keys.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Resolve the primary key for a query
    ///
    /// A `primary_key` option wins, then the schema entry, then `["id"]`.
    pub fn primary_keys(&self, query: &Query, options: &[QueryOption]) -> Vec<String> {
        declared_primary_keys(options)
            .or_else(|| {
                self.tables
                    .get(query.table())
                    .filter(|keys| !keys.is_empty())
                    .cloned()
            })
            .unwrap_or_else(|| vec![DEFAULT_PRIMARY_KEY.to_string()])
    }

    /// Options to send on the wire: the caller's options with the resolved
    /// primary key made explicit, so the server and client agree on row identity
    pub fn wire_options(&self, query: &Query, options: &[QueryOption]) -> Vec<QueryOption> {
        let primary_keys = self.primary_keys(query, options);
        let mut wire: Vec<QueryOption> = options
            .iter()
            .filter(|o| !matches!(o, QueryOption::PrimaryKey(_)))
            .cloned()
            .collect();
        wire.push(QueryOption::PrimaryKey(primary_keys));
        wire
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks() -> Query {
        Query::parse(r#"{"tasks": [{"id": null, "done": null}]}"#).unwrap()
    }

    #[test]
    fn test_parse_query() {
        let query = tasks();
        assert_eq!(query.table(), "tasks");
        assert_eq!(query.columns().collect::<Vec<_>>(), vec!["done", "id"]);
        assert_eq!(query.filters().count(), 0);
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        for text in [
            r#"[1, 2]"#,
            r#"{"a": [{}], "b": [{}]}"#,
            r#"{"tasks": {"id": null}}"#,
            r#"{"tasks": [{"id": null}, {"id": null}]}"#,
            r#"{"tasks": [1]}"#,
            "not json",
        ] {
            assert!(
                matches!(Query::parse(text), Err(SyncError::InvalidQuery(_))),
                "accepted {}",
                text
            );
        }
    }

    #[test]
    fn test_filters_and_projection() {
        let query = Query::parse(r#"{"tasks": [{"id": null, "project": 7}]}"#).unwrap();
        let row: Record = serde_json::from_str(r#"{"id": 1, "project": 7, "secret": "x"}"#)
            .unwrap();
        assert!(query.matches(&row));

        let projected = query.project(&row, &["id".to_string()]);
        assert!(projected.contains_key("project"));
        assert!(!projected.contains_key("secret"));

        let other: Record = serde_json::from_str(r#"{"id": 2, "project": 8}"#).unwrap();
        assert!(!query.matches(&other));
    }

    #[test]
    fn test_query_key_is_canonical() {
        let a = Query::parse(r#"{"tasks": [{"id": null, "done": null}]}"#).unwrap();
        let b = Query::parse(r#"{"tasks": [{"done": null, "id": null}]}"#).unwrap();
        assert_eq!(QueryKey::new(&a, &[]), QueryKey::new(&b, &[]));

        let limited = QueryKey::new(&a, &[QueryOption::Limit(5)]);
        assert_ne!(QueryKey::new(&a, &[]), limited);

        let reordered = QueryKey::new(
            &a,
            &[QueryOption::NoChangefeed, QueryOption::Limit(5)],
        );
        let ordered = QueryKey::new(
            &a,
            &[QueryOption::Limit(5), QueryOption::NoChangefeed],
        );
        assert_ne!(reordered, ordered);
    }

    #[test]
    fn test_option_parse() {
        assert_eq!(QueryOption::parse(r#"{"limit": 3}"#).unwrap(), QueryOption::Limit(3));
        assert_eq!(
            QueryOption::parse(r#""no_changefeed""#).unwrap(),
            QueryOption::NoChangefeed
        );
        assert_eq!(
            QueryOption::parse(r#"{"primary_key": ["a", "b"]}"#).unwrap(),
            QueryOption::PrimaryKey(vec!["a".into(), "b".into()])
        );
        assert!(QueryOption::parse(r#"{"bogus": 1}"#).is_err());
    }

    #[test]
    fn test_primary_key_resolution() {
        let query = tasks();
        let schema = Schema::new().with_table("tasks", ["task_id"]);

        assert_eq!(Schema::new().primary_keys(&query, &[]), vec!["id"]);
        assert_eq!(schema.primary_keys(&query, &[]), vec!["task_id"]);
        assert_eq!(
            schema.primary_keys(&query, &[QueryOption::PrimaryKey(vec!["x".into()])]),
            vec!["x"]
        );

        let wire = schema.wire_options(&query, &[QueryOption::Limit(2)]);
        assert_eq!(
            wire,
            vec![
                QueryOption::Limit(2),
                QueryOption::PrimaryKey(vec!["task_id".into()])
            ]
        );
    }

    #[test]
    fn test_compare_values() {
        use serde_json::json;
        assert_eq!(compare_values(Some(&json!(1)), Some(&json!(2.5))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!("b")), Some(&json!("a"))), Ordering::Greater);
        assert_eq!(compare_values(None, Some(&json!(false))), Ordering::Less);
    }
}
