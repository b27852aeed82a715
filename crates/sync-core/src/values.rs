//! Schemaless document model for mongo-mirror.
//!
//! Documents are represented as an opaque ordered field mapping so that the
//! engine never needs to know a collection's shape. Field order is
//! canonical (sorted by key) by construction, which keeps content
//! fingerprints stable regardless of the order a driver returns fields in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Conventional modification-timestamp field used by polling-based change
/// detection. Documents without this field are invisible to timestamp
/// filtering and are only picked up by force-refresh scans.
pub const MODIFIED_AT_FIELD: &str = "updatedAt";

/// A document field value.
///
/// The variants cover the value universe the engine replicates with full
/// fidelity. Exotic source-specific types (regular expressions, code,
/// min/max keys) are folded into these variants by the database-specific
/// conversion layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Text(String),
    /// 24-character hex object id.
    ObjectId(String),
    DateTime(DateTime<Utc>),
    Bytes(Vec<u8>),
    /// Exact decimal preserved as its string rendering.
    Decimal(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Interpret this value as a modification timestamp, accepting both
    /// native datetimes and RFC 3339 strings (sources serialize the field
    /// either way).
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(ts) => Some(*ts),
            Value::Text(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            _ => None,
        }
    }
}

/// Primary identifier of a document.
///
/// The variant order mirrors the BSON cross-type sort order (numbers before
/// strings before object ids), so deriving `Ord` gives the same resume
/// order the source database uses for `_id`-sorted batches.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentId {
    Int(i64),
    Text(String),
    ObjectId(String),
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentId::Int(i) => write!(f, "{i}"),
            DocumentId::Text(s) => f.write_str(s),
            DocumentId::ObjectId(oid) => f.write_str(oid),
        }
    }
}

/// A schemaless document: identifier plus ordered field mapping.
///
/// The id is kept out of `fields`; database-specific layers re-attach it
/// under the native key (`_id`) when writing.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: DocumentId,
    pub fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new(id: DocumentId, fields: BTreeMap<String, Value>) -> Self {
        Document { id, fields }
    }

    /// The document's modification timestamp, when it carries one.
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.fields.get(MODIFIED_AT_FIELD)?.as_timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_ordering_matches_bson_type_order() {
        let int = DocumentId::Int(999);
        let text = DocumentId::Text("a".to_string());
        let oid = DocumentId::ObjectId("0".repeat(24));
        assert!(int < text);
        assert!(text < oid);
    }

    #[test]
    fn modified_at_reads_native_datetime() {
        let ts = Utc::now();
        let mut fields = BTreeMap::new();
        fields.insert(MODIFIED_AT_FIELD.to_string(), Value::DateTime(ts));
        let doc = Document::new(DocumentId::Int(1), fields);
        assert_eq!(doc.modified_at(), Some(ts));
    }

    #[test]
    fn modified_at_parses_rfc3339_strings() {
        let mut fields = BTreeMap::new();
        fields.insert(
            MODIFIED_AT_FIELD.to_string(),
            Value::Text("2024-06-01T12:30:00Z".to_string()),
        );
        let doc = Document::new(DocumentId::Int(1), fields);
        let ts = doc.modified_at().unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-06-01T12:30:00+00:00");
    }

    #[test]
    fn modified_at_absent_or_unparseable_is_none() {
        let doc = Document::new(DocumentId::Int(1), BTreeMap::new());
        assert_eq!(doc.modified_at(), None);

        let mut fields = BTreeMap::new();
        fields.insert(
            MODIFIED_AT_FIELD.to_string(),
            Value::Text("not a timestamp".to_string()),
        );
        let doc = Document::new(DocumentId::Int(1), fields);
        assert_eq!(doc.modified_at(), None);
    }

    #[test]
    fn document_id_serde_roundtrip() {
        for id in [
            DocumentId::Int(42),
            DocumentId::Text("order-7".to_string()),
            DocumentId::ObjectId("65f2a0c4b1d2e3f4a5b6c7d8".to_string()),
        ] {
            let json = serde_json::to_string(&id).unwrap();
            let parsed: DocumentId = serde_json::from_str(&json).unwrap();
            assert_eq!(id, parsed);
        }
    }
}
