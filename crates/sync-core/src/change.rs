//! Change events and collection specifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::values::{Document, DocumentId};

/// One entry in the replicated collection list.
///
/// Specs are loaded once at startup and never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub source_db: String,
    pub target_db: String,
    pub collection: String,
    /// Optional source-side filter restricting the replicated subset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
}

impl CollectionSpec {
    pub fn new(
        source_db: impl Into<String>,
        target_db: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        CollectionSpec {
            source_db: source_db.into(),
            target_db: target_db.into(),
            collection: collection.into(),
            filter: None,
        }
    }

    /// Key identifying this collection in checkpoints and progress records.
    pub fn key(&self) -> &str {
        &self.collection
    }
}

/// Kind of source-side change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Replace,
    Delete,
}

/// A single captured change, produced by capture and consumed by the
/// applier.
///
/// Delivery is at-least-once: the same event may be observed twice after a
/// reconnect, so application must be idempotent.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub collection: String,
    pub op: ChangeOp,
    pub id: DocumentId,
    /// Full document for insert/update/replace; `None` for deletes (and for
    /// update events whose source could not supply a post-image).
    pub document: Option<Document>,
    pub source_timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    /// An upsert-shaped event carrying the full document.
    pub fn upsert(collection: impl Into<String>, op: ChangeOp, document: Document) -> Self {
        let source_timestamp = document.modified_at();
        ChangeEvent {
            collection: collection.into(),
            op,
            id: document.id.clone(),
            document: Some(document),
            source_timestamp,
        }
    }

    /// A deletion event carrying only the document id.
    pub fn delete(collection: impl Into<String>, id: DocumentId) -> Self {
        ChangeEvent {
            collection: collection.into(),
            op: ChangeOp::Delete,
            id,
            document: None,
            source_timestamp: None,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.op == ChangeOp::Delete
    }
}
