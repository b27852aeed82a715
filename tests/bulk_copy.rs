//! Bulk copier behavior against in-memory backends: full copies, checkpoint
//! resume, retry discipline, and failed-document isolation.

use std::sync::Arc;

use checkpoint::{CheckpointStore, FilesystemStore};
use chrono::Utc;
use tempfile::TempDir;

use mongo_mirror::testing::{sample_document, MemorySource, MemoryTarget};
use mongo_mirror::{
    fingerprint, BulkCopier, CollectionSpec, CollectionState, DocumentId, FailedDocumentSink,
    IndexSpec, ProgressAggregator, RetryPolicy, SourceReader,
};

struct Harness {
    _tmp: TempDir,
    source: MemorySource,
    target: MemoryTarget,
    checkpoints: Arc<FilesystemStore>,
    progress: ProgressAggregator,
    failed: Arc<FailedDocumentSink>,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let checkpoints = Arc::new(FilesystemStore::new(tmp.path().join("progress")));
        let failed = Arc::new(FailedDocumentSink::new(tmp.path().join("logs")));
        Harness {
            _tmp: tmp,
            source: MemorySource::new(),
            target: MemoryTarget::new(),
            checkpoints,
            progress: ProgressAggregator::new(),
            failed,
        }
    }

    fn copier(&self, batch_size: usize) -> BulkCopier {
        BulkCopier::new(
            Arc::new(self.source.clone()),
            Arc::new(self.target.clone()),
            self.checkpoints.clone(),
            self.progress.clone(),
            self.failed.clone(),
            RetryPolicy::fast(),
            batch_size,
        )
    }

    fn seed(&self, collection: &str, count: i64) {
        let now = Utc::now();
        for i in 0..count {
            self.source.put(collection, sample_document(i, i * 10, now));
        }
    }
}

fn spec(name: &str) -> CollectionSpec {
    CollectionSpec::new("app", "app", name)
}

#[tokio::test]
async fn full_copy_mirrors_every_document() {
    let h = Harness::new();
    h.seed("orders", 25);

    let report = h.copier(10).run(&spec("orders")).await.unwrap();

    assert_eq!(report.rows_copied, 25);
    assert_eq!(report.rows_failed, 0);
    assert_eq!(h.target.len("orders"), 25);

    // Content matches, not just counts.
    for id in h.target.ids("orders") {
        let src = h
            .source
            .get(&spec("orders"), &id)
            .await
            .unwrap()
            .unwrap();
        let tgt = h.target.get_document("orders", &id).unwrap();
        assert_eq!(fingerprint(&src), fingerprint(&tgt));
    }

    let snapshot = h.progress.get("orders").unwrap();
    assert_eq!(snapshot.state, CollectionState::Completed);
    assert!((snapshot.progress_pct - 100.0).abs() < f64::EPSILON);

    let checkpoint = h.checkpoints.get("orders").await;
    assert_eq!(checkpoint.last_processed_id, Some(DocumentId::Int(24)));
}

#[tokio::test]
async fn indexes_are_replicated_before_documents() {
    let h = Harness::new();
    h.seed("orders", 5);
    h.source.add_index(
        "orders",
        IndexSpec {
            name: Some("status_1".to_string()),
            keys: vec![("status".to_string(), 1)],
            unique: false,
        },
    );
    h.source.add_index(
        "orders",
        IndexSpec {
            name: Some("sku_1".to_string()),
            keys: vec![("sku".to_string(), 1)],
            unique: true,
        },
    );

    h.copier(10).run(&spec("orders")).await.unwrap();
    let names = h.target.index_names("orders");
    assert_eq!(names.len(), 2);

    // A second run treats the existing indexes as success.
    h.copier(10).run(&spec("orders")).await.unwrap();
    assert_eq!(h.target.index_names("orders").len(), 2);
}

#[tokio::test]
async fn copy_resumes_from_checkpoint_after_failure() {
    let h = Harness::new();
    h.seed("orders", 30);

    // Two batches succeed, then every read fails until further notice.
    h.source.fail_reads_after(2);
    let err = h.copier(10).run(&spec("orders")).await.unwrap_err();
    assert!(err.is_retryable());

    // The checkpoint lags the failure point, never leads it: the cursor
    // names a document that is already on the target.
    let checkpoint = h.checkpoints.get("orders").await;
    assert_eq!(checkpoint.last_processed_id, Some(DocumentId::Int(19)));
    assert_eq!(h.target.len("orders"), 20);
    assert!(h
        .target
        .get_document("orders", &DocumentId::Int(19))
        .is_some());
    assert_eq!(
        h.progress.get("orders").unwrap().state,
        CollectionState::Failed
    );

    // Recovery resumes exactly where the checkpoint says.
    h.source.allow_all_reads();
    let report = h.copier(10).run(&spec("orders")).await.unwrap();
    assert_eq!(report.rows_copied, 10);
    assert_eq!(h.target.len("orders"), 30);
}

#[tokio::test]
async fn transient_batch_failure_is_bounded_and_non_fatal() {
    let h = Harness::new();
    h.seed("orders", 10);

    // Every write fails; the single batch must be attempted exactly
    // max_attempts times, then recorded as failed without ending the run.
    h.target.fail_next_writes(u64::MAX);
    let report = h.copier(10).run(&spec("orders")).await.unwrap();

    assert_eq!(h.target.batch_attempts(), RetryPolicy::fast().max_attempts as u64);
    assert_eq!(report.rows_copied, 0);
    assert_eq!(report.rows_failed, 10);
    assert_eq!(h.failed.read("orders").len(), 10);

    // The copier itself is still usable for other collections.
    h.target.fail_next_writes(0);
    h.seed("invoices", 5);
    let report = h.copier(10).run(&spec("invoices")).await.unwrap();
    assert_eq!(report.rows_copied, 5);
}

#[tokio::test]
async fn transient_failure_within_retry_budget_recovers() {
    let h = Harness::new();
    h.seed("orders", 10);

    // Two failures, then success: inside the fast policy's three attempts.
    h.target.fail_next_writes(2);
    let report = h.copier(10).run(&spec("orders")).await.unwrap();

    assert_eq!(report.rows_copied, 10);
    assert_eq!(report.rows_failed, 0);
    assert_eq!(h.target.len("orders"), 10);
}

#[tokio::test]
async fn poisoned_document_is_skipped_and_recorded() {
    let h = Harness::new();
    h.seed("orders", 10);
    h.target.reject_document(DocumentId::Int(3));

    let report = h.copier(10).run(&spec("orders")).await.unwrap();

    assert_eq!(report.rows_copied, 9);
    assert_eq!(report.rows_failed, 1);
    assert_eq!(h.target.len("orders"), 9);
    assert!(h.target.get_document("orders", &DocumentId::Int(3)).is_none());

    let failures = h.failed.read("orders");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].document_id, DocumentId::Int(3));

    // The copy itself completed.
    assert_eq!(
        h.progress.get("orders").unwrap().state,
        CollectionState::Completed
    );
}

#[tokio::test]
async fn empty_collection_completes_immediately() {
    let h = Harness::new();
    let report = h.copier(10).run(&spec("orders")).await.unwrap();
    assert_eq!(report.rows_copied, 0);
    assert_eq!(
        h.progress.get("orders").unwrap().state,
        CollectionState::Completed
    );
    assert!(h.checkpoints.get("orders").await.last_processed_id.is_none());
}

#[tokio::test]
async fn rerun_after_completion_is_idempotent() {
    let h = Harness::new();
    h.seed("orders", 15);

    h.copier(10).run(&spec("orders")).await.unwrap();
    // Second run resumes past the last processed id and finds nothing new.
    let report = h.copier(10).run(&spec("orders")).await.unwrap();

    assert_eq!(report.rows_copied, 0);
    assert_eq!(h.target.len("orders"), 15);
}
