//! Checkpoint management for mongo-mirror.
//!
//! Provides durable, per-collection progress records with atomic commit
//! semantics. A checkpoint carries three cursors sharing one record:
//!
//! - `last_processed_id` - bulk copy resume position
//! - `resume_token` - change-stream position (streaming capture)
//! - `last_timestamp` - modification-time watermark (polling capture)
//!
//! The active capture mode decides which cursor it reads; commits always
//! persist the whole record so a mode switch never loses the other cursor.
//!
//! # Durability
//!
//! Commits use write-then-swap: the record is serialized to a temporary
//! file and atomically renamed over the live one, so a crash mid-write can
//! never produce a partially-written record. Reads degrade: an absent or
//! unreadable record yields the zero-value checkpoint, turning storage
//! corruption into a re-scan instead of an aborted run.

mod filesystem;


pub use filesystem::FilesystemStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_core::DocumentId;

/// Durable progress record for one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub collection: String,
    /// Change-stream resume position (opaque, source-defined). Stored as
    /// base64 so the record stays readable and diffable.
    #[serde(default, with = "token_base64", skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<Vec<u8>>,
    /// Polling watermark: modification time of the newest applied document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Bulk copy cursor: id of the last document durably written to target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_id: Option<DocumentId>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// The zero-value checkpoint: every cursor unset, meaning "re-scan from
    /// the start".
    pub fn empty(collection: impl Into<String>) -> Self {
        Checkpoint {
            collection: collection.into(),
            resume_token: None,
            last_timestamp: None,
            last_processed_id: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resume_token.is_none()
            && self.last_timestamp.is_none()
            && self.last_processed_id.is_none()
    }

    /// Advance the polling watermark, never letting it move backwards.
    pub fn advance_timestamp(&mut self, ts: DateTime<Utc>) {
        match self.last_timestamp {
            Some(current) if current >= ts => {}
            _ => self.last_timestamp = Some(ts),
        }
    }
}

mod token_base64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        token: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match token {
            Some(bytes) => serializer.serialize_some(&general_purpose::STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text {
            Some(text) => general_purpose::STANDARD
                .decode(text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Checkpoint storage failure.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Trait for checkpoint storage backends.
///
/// Commits must be individually atomic; no coordination across collections
/// is required (or provided).
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the checkpoint for a collection.
    ///
    /// An absent or unreadable record degrades to [`Checkpoint::empty`] -
    /// the caller re-scans rather than aborting.
    async fn get(&self, collection: &str) -> Checkpoint;

    /// Durably persist a checkpoint (write-then-swap).
    async fn commit(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Remove the record for a collection (force-refresh path). Removing an
    /// absent record succeeds.
    async fn reset(&self, collection: &str) -> Result<(), CheckpointError>;
}
