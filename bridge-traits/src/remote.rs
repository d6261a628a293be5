//! Remote Record Store Abstraction
//!
//! The cloud side of synchronization is an opaque record database. The engine
//! only needs paginated queries, single-record fetch/save/delete and a change
//! subscription; wire format and authentication stay with the host adapter.
//!
//! ## Errors
//!
//! Implementations must map their native failures onto:
//! - [`BridgeError::NotFound`](crate::error::BridgeError::NotFound) when a record id does not exist
//! - [`BridgeError::Conflict`](crate::error::BridgeError::Conflict) when a save was based on a stale `change_tag`
//! - [`BridgeError::Transient`](crate::error::BridgeError::Transient) for network failures and rate limiting

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::error::Result;

// ============================================================================
// Records
// ============================================================================

/// A single field value stored on a remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum FieldValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Date(DateTime<Utc>),
    StringList(Vec<String>),
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Double(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Date(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::StringList(value)
    }
}

/// Reference to a large binary attachment.
///
/// On upload the path points at the local file to send. On fetch the store
/// materializes the blob into a local cache file and points at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub local_path: PathBuf,
    pub size: Option<u64>,
}

impl Asset {
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            size: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

/// A record in the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Deterministic record identifier
    pub id: String,
    /// Record type tag ("ROM", "SaveState", "BIOS", "File", legacy "Game")
    pub record_type: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub assets: BTreeMap<String, Asset>,
    /// Server-assigned modification time; `None` until first saved
    pub modified_at: Option<DateTime<Utc>>,
    /// Opaque version tag used by the store for conflict detection
    pub change_tag: Option<String>,
}

impl RemoteRecord {
    /// Create an unsaved record
    pub fn new(record_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            record_type: record_type.into(),
            fields: BTreeMap::new(),
            assets: BTreeMap::new(),
            modified_at: None,
            change_tag: None,
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<FieldValue>) {
        self.fields.insert(key.to_string(), value.into());
    }

    /// Set or clear an optional field
    pub fn set_opt<V: Into<FieldValue>>(&mut self, key: &str, value: Option<V>) {
        match value {
            Some(v) => self.set(key, v),
            None => {
                self.fields.remove(key);
            }
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn with_asset(mut self, key: &str, asset: Asset) -> Self {
        self.assets.insert(key.to_string(), asset);
        self
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.fields.get(key) {
            Some(FieldValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Non-empty string field
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get_str(key).filter(|s| !s.trim().is_empty())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.fields.get(key) {
            Some(FieldValue::Int(v)) => Some(*v),
            Some(FieldValue::Double(v)) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.fields.get(key) {
            Some(FieldValue::Double(v)) => Some(*v),
            Some(FieldValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    /// Boolean field; integer 0/1 is accepted for records written by older clients
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.fields.get(key) {
            Some(FieldValue::Bool(v)) => Some(*v),
            Some(FieldValue::Int(v)) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn get_date(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.fields.get(key) {
            Some(FieldValue::Date(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_string_list(&self, key: &str) -> Option<&[String]> {
        match self.fields.get(key) {
            Some(FieldValue::StringList(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn asset(&self, key: &str) -> Option<&Asset> {
        self.assets.get(key)
    }
}

// ============================================================================
// Queries
// ============================================================================

/// Filter applied to a record query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordPredicate {
    /// Every record of the type
    All,
    /// Records whose field equals the value
    FieldEquals { field: String, value: FieldValue },
    /// Records matching every inner predicate
    And(Vec<RecordPredicate>),
}

impl RecordPredicate {
    pub fn field_equals(field: &str, value: impl Into<FieldValue>) -> Self {
        RecordPredicate::FieldEquals {
            field: field.to_string(),
            value: value.into(),
        }
    }

    /// Evaluate the predicate against a record (used by in-process stores)
    pub fn matches(&self, record: &RemoteRecord) -> bool {
        match self {
            RecordPredicate::All => true,
            RecordPredicate::FieldEquals { field, value } => record.get(field) == Some(value),
            RecordPredicate::And(inner) => inner.iter().all(|p| p.matches(record)),
        }
    }
}

/// A query over one record type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub record_type: String,
    pub predicate: RecordPredicate,
    /// Restrict returned fields and assets to these keys. `None` returns everything.
    pub desired_keys: Option<Vec<String>>,
}

impl RecordQuery {
    pub fn all(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            predicate: RecordPredicate::All,
            desired_keys: None,
        }
    }

    pub fn with_predicate(mut self, predicate: RecordPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_desired_keys(mut self, keys: Vec<String>) -> Self {
        self.desired_keys = Some(keys);
        self
    }
}

/// Opaque continuation token returned by a partial query
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryCursor(pub String);

impl fmt::Display for QueryCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One page of query results
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub records: Vec<RemoteRecord>,
    /// `None` when the query is exhausted
    pub cursor: Option<QueryCursor>,
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Kinds of changes a subscription fires on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeTypes {
    pub created: bool,
    pub updated: bool,
    pub deleted: bool,
}

impl ChangeTypes {
    pub fn all() -> Self {
        Self {
            created: true,
            updated: true,
            deleted: true,
        }
    }
}

/// Why a record change was delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeReason {
    Created,
    Updated,
    Deleted,
}

/// Out-of-band notification that a single record changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordChange {
    pub record_id: String,
    pub record_type: String,
    pub reason: ChangeReason,
}

/// Live subscription; dropping the receiver ends delivery
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub subscription_id: String,
    pub changes: mpsc::UnboundedReceiver<RecordChange>,
}

// ============================================================================
// Store
// ============================================================================

/// Remote record database used as the cloud side of synchronization.
///
/// All methods are suspension points and may be cancelled by dropping the
/// returned future.
#[async_trait]
pub trait RemoteRecordStore: Send + Sync {
    /// Start a query, returning up to `limit` records and a cursor if more remain
    async fn query(&self, query: &RecordQuery, limit: usize) -> Result<QueryPage>;

    /// Continue a query from a cursor
    async fn continue_query(&self, cursor: &QueryCursor, limit: usize) -> Result<QueryPage>;

    /// Fetch a record by id. Fails with [`BridgeError::NotFound`](crate::error::BridgeError::NotFound) if absent.
    async fn fetch(&self, record_id: &str) -> Result<RemoteRecord>;

    /// Save a record, returning the stored version.
    ///
    /// Fails with [`BridgeError::Conflict`](crate::error::BridgeError::Conflict) if the record changed on the
    /// server since `record.change_tag` was read.
    async fn save(&self, record: RemoteRecord) -> Result<RemoteRecord>;

    /// Hard-delete a record. Fails with [`BridgeError::NotFound`](crate::error::BridgeError::NotFound) if absent.
    async fn delete(&self, record_id: &str) -> Result<()>;

    /// Subscribe to changes of one record type
    async fn subscribe(
        &self,
        record_type: &str,
        change_types: ChangeTypes,
    ) -> Result<SubscriptionHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_field_accessors() {
        let record = RemoteRecord::new("ROM", "rom_ABC")
            .with_field("title", "Chrono Trigger")
            .with_field("playCount", 4_i64)
            .with_field("isDeleted", 1_i64)
            .with_field("relatedFilenames", vec!["a.cue".to_string()]);

        assert_eq!(record.get_str("title"), Some("Chrono Trigger"));
        assert_eq!(record.get_i64("playCount"), Some(4));
        assert_eq!(record.get_bool("isDeleted"), Some(true));
        assert_eq!(
            record.get_string_list("relatedFilenames"),
            Some(&["a.cue".to_string()][..])
        );
        assert_eq!(record.get_str("missing"), None);
    }

    #[test]
    fn test_set_opt_clears_field() {
        let mut record = RemoteRecord::new("ROM", "rom_ABC").with_field("developer", "Square");
        record.set_opt::<String>("developer", None);
        assert!(record.get("developer").is_none());
    }

    #[test]
    fn test_predicate_matching() {
        let record = RemoteRecord::new("File", "file_1")
            .with_field("directory", "Screenshots")
            .with_field("filename", "shot.png");

        assert!(RecordPredicate::All.matches(&record));
        assert!(RecordPredicate::field_equals("directory", "Screenshots").matches(&record));
        assert!(!RecordPredicate::And(vec![
            RecordPredicate::field_equals("directory", "Screenshots"),
            RecordPredicate::field_equals("filename", "other.png"),
        ])
        .matches(&record));
    }

    #[test]
    fn test_empty_string_is_not_a_value() {
        let record = RemoteRecord::new("ROM", "rom_ABC").with_field("systemIdentifier", "  ");
        assert_eq!(record.get_non_empty("systemIdentifier"), None);
    }
}
