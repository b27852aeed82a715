//! Failed-document sink.
//!
//! Append-only, per-collection log of writes that failed permanently
//! (validation rejections and transient failures that exhausted their
//! retries). The sink is best-effort by design: a document that cannot even
//! be logged must not take the stream down, so recording failures are
//! logged and swallowed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use sync_core::DocumentId;

/// One permanently failed write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedDocument {
    pub document_id: DocumentId,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only JSONL sink, one file per collection.
pub struct FailedDocumentSink {
    dir: PathBuf,
}

impl FailedDocumentSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FailedDocumentSink { dir: dir.into() }
    }

    /// Path of a collection's failure log.
    pub fn path_for(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}_failed.jsonl"))
    }

    /// Record a permanently failed document.
    pub fn record(&self, collection: &str, id: &DocumentId, error: &str) {
        let entry = FailedDocument {
            document_id: id.clone(),
            error: error.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(err) = self.append(collection, &entry) {
            tracing::error!(
                collection,
                document_id = %id,
                "failed to record failed document: {err}"
            );
        }
    }

    fn append(&self, collection: &str, entry: &FailedDocument) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(collection))?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{line}")
    }

    /// Read a collection's failure log back. Used by tests and tooling; an
    /// absent log is an empty history.
    pub fn read(&self, collection: &str) -> Vec<FailedDocument> {
        read_log(&self.path_for(collection))
    }
}

fn read_log(path: &Path) -> Vec<FailedDocument> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}
