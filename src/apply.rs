//! Idempotent change application.
//!
//! Converts captured change events into target writes: insert/update/
//! replace become an upsert keyed by document id, delete removes by id.
//! Applying the same event twice leaves the target unchanged, which is what
//! makes at-least-once capture safe.

use std::sync::Arc;

use sync_core::{
    retry_with_backoff, ChangeEvent, CollectionSpec, ProgressAggregator, RetryPolicy, SyncError,
};

use crate::failed::FailedDocumentSink;
use crate::sink::TargetWriter;

/// What happened to a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Document written (inserted or replaced).
    Upserted,
    /// Document removed.
    Deleted,
    /// Nothing to do (delete of an already-absent document, or an upsert
    /// event without a document body).
    Noop,
    /// Permanently failed; recorded in the failed-document sink.
    Failed,
}

/// Counters for one applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub updates: u64,
    pub deletions: u64,
    pub failed: u64,
}

impl ApplyStats {
    pub fn merge(&mut self, other: ApplyStats) {
        self.updates += other.updates;
        self.deletions += other.deletions;
        self.failed += other.failed;
    }
}

/// Applies change events to the target and keeps progress counters current.
#[derive(Clone)]
pub struct ChangeApplier {
    target: Arc<dyn TargetWriter>,
    progress: ProgressAggregator,
    failed: Arc<FailedDocumentSink>,
    retry: RetryPolicy,
}

impl ChangeApplier {
    pub fn new(
        target: Arc<dyn TargetWriter>,
        progress: ProgressAggregator,
        failed: Arc<FailedDocumentSink>,
        retry: RetryPolicy,
    ) -> Self {
        ChangeApplier {
            target,
            progress,
            failed,
            retry,
        }
    }

    /// Apply one event.
    ///
    /// Transient write failures retry with backoff; a permanently failed
    /// document is recorded in the sink and reported as
    /// [`ApplyOutcome::Failed`] so the stream continues - one poisoned
    /// document must not block a collection.
    pub async fn apply(
        &self,
        spec: &CollectionSpec,
        event: &ChangeEvent,
    ) -> Result<ApplyOutcome, SyncError> {
        if event.is_delete() {
            return self.apply_delete(spec, event).await;
        }
        self.apply_upsert(spec, event).await
    }

    async fn apply_upsert(
        &self,
        spec: &CollectionSpec,
        event: &ChangeEvent,
    ) -> Result<ApplyOutcome, SyncError> {
        let Some(document) = &event.document else {
            tracing::warn!(
                collection = %spec.collection,
                id = %event.id,
                "upsert event without document body, skipping"
            );
            return Ok(ApplyOutcome::Noop);
        };

        let result = retry_with_backoff(&self.retry, "target upsert", || {
            let target = Arc::clone(&self.target);
            let spec = spec.clone();
            let document = document.clone();
            async move { target.upsert(&spec, &document).await }
        })
        .await;

        match result {
            Ok(()) => Ok(ApplyOutcome::Upserted),
            Err(err) => {
                self.failed
                    .record(&spec.collection, &event.id, &err.to_string());
                tracing::error!(
                    collection = %spec.collection,
                    id = %event.id,
                    "upsert permanently failed: {err}"
                );
                Ok(ApplyOutcome::Failed)
            }
        }
    }

    async fn apply_delete(
        &self,
        spec: &CollectionSpec,
        event: &ChangeEvent,
    ) -> Result<ApplyOutcome, SyncError> {
        let result = retry_with_backoff(&self.retry, "target delete", || {
            let target = Arc::clone(&self.target);
            let spec = spec.clone();
            let id = event.id.clone();
            async move { target.delete(&spec, &id).await }
        })
        .await;

        match result {
            Ok(true) => Ok(ApplyOutcome::Deleted),
            Ok(false) => Ok(ApplyOutcome::Noop),
            Err(err) => {
                self.failed
                    .record(&spec.collection, &event.id, &err.to_string());
                tracing::error!(
                    collection = %spec.collection,
                    id = %event.id,
                    "delete permanently failed: {err}"
                );
                Ok(ApplyOutcome::Failed)
            }
        }
    }

    /// Apply a batch in order, then report its counters to the progress
    /// aggregator.
    pub async fn apply_batch(
        &self,
        spec: &CollectionSpec,
        events: &[ChangeEvent],
    ) -> Result<ApplyStats, SyncError> {
        let mut stats = ApplyStats::default();
        for event in events {
            match self.apply(spec, event).await? {
                ApplyOutcome::Upserted => stats.updates += 1,
                ApplyOutcome::Deleted => stats.deletions += 1,
                ApplyOutcome::Failed => stats.failed += 1,
                ApplyOutcome::Noop => {}
            }
        }

        if stats.updates > 0 {
            self.progress.add_updates(&spec.collection, stats.updates);
        }
        if stats.deletions > 0 {
            self.progress
                .add_deletions(&spec.collection, stats.deletions);
        }
        Ok(stats)
    }
}
