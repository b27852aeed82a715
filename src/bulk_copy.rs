//! Checkpointed bulk copy.
//!
//! The initial full copy of a collection: index replication first, then
//! documents in id-ordered batches. The checkpoint records the id of the
//! last document durably written to target and advances only after the
//! batch write succeeds, so a crash leaves the checkpoint behind the data,
//! never ahead - replayed batches are absorbed by upsert idempotence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use checkpoint::CheckpointStore;
use sync_core::{
    retry_with_backoff, CollectionSpec, CollectionState, ProgressAggregator, RetryPolicy,
    SyncError,
};

use crate::failed::FailedDocumentSink;
use crate::sink::TargetWriter;
use crate::source::SourceReader;

/// Outcome of one collection's bulk copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyReport {
    pub rows_copied: u64,
    pub rows_failed: u64,
    pub duration: Duration,
}

/// Performs the initial full copy of collections.
pub struct BulkCopier {
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    checkpoints: Arc<dyn CheckpointStore>,
    progress: ProgressAggregator,
    failed: Arc<FailedDocumentSink>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl BulkCopier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
        checkpoints: Arc<dyn CheckpointStore>,
        progress: ProgressAggregator,
        failed: Arc<FailedDocumentSink>,
        retry: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        BulkCopier {
            source,
            target,
            checkpoints,
            progress,
            failed,
            retry,
            batch_size,
        }
    }

    /// Copy one collection, resuming from its checkpoint.
    pub async fn run(&self, spec: &CollectionSpec) -> Result<CopyReport, SyncError> {
        let started = Instant::now();
        let key = spec.key();
        tracing::info!(collection = key, "starting bulk copy");

        self.progress.register(key);
        self.progress.set_state(key, CollectionState::Running);

        let total = self.source.count(spec).await.inspect_err(|_| {
            self.progress.set_state(key, CollectionState::Failed);
        })?;
        self.progress.set_total(key, total);
        tracing::info!(collection = key, total, "source collection counted");

        self.replicate_indexes(spec).await;

        let mut checkpoint = self.checkpoints.get(key).await;
        if checkpoint.last_processed_id.is_some() {
            tracing::info!(
                collection = key,
                resume_from = %checkpoint.last_processed_id.as_ref().map(ToString::to_string).unwrap_or_default(),
                "resuming bulk copy from checkpoint"
            );
        }

        let mut rows_copied = 0u64;
        let mut rows_failed = 0u64;

        loop {
            let batch = {
                let after = checkpoint.last_processed_id.clone();
                retry_with_backoff(&self.retry, "source batch read", || {
                    let source = Arc::clone(&self.source);
                    let spec = spec.clone();
                    let after = after.clone();
                    let limit = self.batch_size;
                    async move { source.read_batch(&spec, after.as_ref(), limit).await }
                })
                .await
                .inspect_err(|_| {
                    self.progress.set_state(key, CollectionState::Failed);
                })?
            };

            let Some(last) = batch.last() else {
                break;
            };
            let last_id = last.id.clone();

            let (copied, failed) = self.write_batch(spec, &batch).await;
            rows_copied += copied;
            rows_failed += failed;

            // The batch is on the target (or recorded as failed); only now
            // may the cursor move past it.
            checkpoint.last_processed_id = Some(last_id);
            checkpoint.updated_at = chrono::Utc::now();
            self.checkpoints
                .commit(&checkpoint)
                .await
                .map_err(|err| SyncError::CheckpointIo(err.to_string()))
                .inspect_err(|_| {
                    self.progress.set_state(key, CollectionState::Failed);
                })?;

            self.progress.add_migrated(key, copied);
            tracing::info!(
                collection = key,
                copied = rows_copied,
                total,
                "bulk copy progress"
            );
        }

        self.progress.set_state(key, CollectionState::Completed);
        let report = CopyReport {
            rows_copied,
            rows_failed,
            duration: started.elapsed(),
        };
        tracing::info!(
            collection = key,
            rows_copied = report.rows_copied,
            rows_failed = report.rows_failed,
            duration_ms = report.duration.as_millis() as u64,
            "bulk copy completed"
        );
        Ok(report)
    }

    /// Replicate index definitions source to target. Failures are logged
    /// and skipped: missing indexes degrade performance, not correctness.
    async fn replicate_indexes(&self, spec: &CollectionSpec) {
        let indexes = match self.source.indexes(spec).await {
            Ok(indexes) => indexes,
            Err(err) => {
                tracing::warn!(
                    collection = %spec.collection,
                    "could not list source indexes: {err}"
                );
                return;
            }
        };

        for index in indexes {
            match self.target.ensure_index(spec, &index).await {
                Ok(()) => {
                    tracing::info!(
                        collection = %spec.collection,
                        index = ?index.name,
                        "replicated index"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        collection = %spec.collection,
                        index = ?index.name,
                        "could not replicate index: {err}"
                    );
                }
            }
        }
    }

    /// Write one batch. Returns `(copied, failed)`; never errors, because a
    /// permanently failed batch is recorded and skipped rather than ending
    /// the copy.
    async fn write_batch(&self, spec: &CollectionSpec, batch: &[sync_core::Document]) -> (u64, u64) {
        let result = retry_with_backoff(&self.retry, "target batch write", || {
            let target = Arc::clone(&self.target);
            let spec = spec.clone();
            let batch = batch.to_vec();
            async move { target.upsert_batch(&spec, &batch).await }
        })
        .await;

        match result {
            Ok(()) => (batch.len() as u64, 0),
            Err(SyncError::Validation(_)) => {
                // Some document in the batch is unacceptable to the target;
                // isolate it by writing documents individually.
                self.write_documents_individually(spec, batch).await
            }
            Err(err) => {
                tracing::error!(
                    collection = %spec.collection,
                    batch_len = batch.len(),
                    "batch write permanently failed, recording batch: {err}"
                );
                for doc in batch {
                    self.failed
                        .record(&spec.collection, &doc.id, &err.to_string());
                }
                (0, batch.len() as u64)
            }
        }
    }

    async fn write_documents_individually(
        &self,
        spec: &CollectionSpec,
        batch: &[sync_core::Document],
    ) -> (u64, u64) {
        let mut copied = 0u64;
        let mut failed = 0u64;
        for doc in batch {
            let result = retry_with_backoff(&self.retry, "target document write", || {
                let target = Arc::clone(&self.target);
                let spec = spec.clone();
                let doc = doc.clone();
                async move { target.upsert(&spec, &doc).await }
            })
            .await;

            match result {
                Ok(()) => copied += 1,
                Err(err) => {
                    self.failed
                        .record(&spec.collection, &doc.id, &err.to_string());
                    tracing::warn!(
                        collection = %spec.collection,
                        id = %doc.id,
                        "document skipped: {err}"
                    );
                    failed += 1;
                }
            }
        }
        (copied, failed)
    }
}
