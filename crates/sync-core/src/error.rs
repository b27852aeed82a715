//! Error taxonomy shared by all engine components.
//!
//! The classification drives retry behavior: transient failures are retried
//! with backoff, validation failures are recorded and skipped, checkpoint
//! failures degrade to a conservative full re-scan, and capture
//! disconnections send a worker through its backoff/re-init ladder.

/// Engine-wide error classification.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Timeout or network failure. Retried with exponential backoff, then
    /// escalated to a recorded permanent failure.
    #[error("transient I/O failure: {0}")]
    Transient(String),

    /// The target rejected the document shape. Never retried.
    #[error("validation failure: {0}")]
    Validation(String),

    /// Checkpoint read/write failure. Reads degrade to the zero-value
    /// checkpoint; write failures surface here.
    #[error("checkpoint I/O failure: {0}")]
    CheckpointIo(String),

    /// The change feed or its connection dropped.
    #[error("change capture disconnected: {0}")]
    CaptureDisconnect(String),

    /// The source cannot provide a live change feed at all; capture must
    /// fall back to polling.
    #[error("change capture unsupported: {0}")]
    CaptureUnsupported(String),
}

impl SyncError {
    /// Whether a failed operation may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transient(_) | SyncError::CaptureDisconnect(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SyncError::Transient("timeout".into()).is_retryable());
        assert!(SyncError::CaptureDisconnect("reset".into()).is_retryable());
        assert!(!SyncError::Validation("bad shape".into()).is_retryable());
        assert!(!SyncError::CheckpointIo("disk full".into()).is_retryable());
        assert!(!SyncError::CaptureUnsupported("standalone".into()).is_retryable());
    }
}
