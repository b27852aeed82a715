//! Change capture end-to-end against in-memory backends: streaming order
//! and checkpointing, polling fallback, deletion detection, idempotent
//! application, worker failure isolation, and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use checkpoint::{CheckpointStore, FilesystemStore};
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::broadcast;

use mongo_mirror::testing::{sample_document, MemorySource, MemoryTarget};
use mongo_mirror::{
    fingerprint, ApplyOutcome, BulkCopier, CaptureConfig, CaptureContext, CaptureWorker,
    ChangeApplier, ChangeEvent, ChangeOp, CollectionSpec, CollectionState, DocumentId,
    FailedDocumentSink, ProgressAggregator, RetryPolicy, Threads, Verifier, VerifyOptions,
    VerifyStatus, WorkerPool, WorkerState,
};

fn spec(name: &str) -> CollectionSpec {
    CollectionSpec::new("app", "app", name)
}

fn test_config() -> CaptureConfig {
    CaptureConfig {
        batch_size: 100,
        polling_interval: Duration::from_millis(25),
        force_refresh: false,
        max_capture_failures: 2,
        backoff: RetryPolicy::fast(),
        retry: RetryPolicy::fast(),
        checkpoint_every: 2,
    }
}

struct Harness {
    _tmp: TempDir,
    source: MemorySource,
    target: MemoryTarget,
    ctx: CaptureContext,
}

impl Harness {
    fn new(source: MemorySource) -> Self {
        let tmp = TempDir::new().unwrap();
        let target = MemoryTarget::new();
        let ctx = CaptureContext {
            source: Arc::new(source.clone()),
            target: Arc::new(target.clone()),
            checkpoints: Arc::new(FilesystemStore::new(tmp.path().join("progress"))),
            progress: ProgressAggregator::new(),
            failed: Arc::new(FailedDocumentSink::new(tmp.path().join("logs"))),
            config: test_config(),
        };
        Harness {
            _tmp: tmp,
            source,
            target,
            ctx,
        }
    }

    async fn bulk_copy(&self, collection: &str) {
        let copier = BulkCopier::new(
            self.ctx.source.clone(),
            self.ctx.target.clone(),
            self.ctx.checkpoints.clone(),
            self.ctx.progress.clone(),
            self.ctx.failed.clone(),
            RetryPolicy::fast(),
            200,
        );
        copier.run(&spec(collection)).await.unwrap();
    }

    fn applier(&self) -> ChangeApplier {
        ChangeApplier::new(
            self.ctx.target.clone(),
            self.ctx.progress.clone(),
            self.ctx.failed.clone(),
            RetryPolicy::fast(),
        )
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn applying_the_same_event_twice_is_idempotent() {
    let h = Harness::new(MemorySource::new());
    let applier = h.applier();
    let orders = spec("orders");

    let doc = sample_document(1, 42, Utc::now());
    let upsert = ChangeEvent::upsert("orders", ChangeOp::Insert, doc.clone());

    applier.apply(&orders, &upsert).await.unwrap();
    let after_first = h.target.get_document("orders", &DocumentId::Int(1)).unwrap();
    applier.apply(&orders, &upsert).await.unwrap();
    let after_second = h.target.get_document("orders", &DocumentId::Int(1)).unwrap();

    assert_eq!(h.target.len("orders"), 1);
    assert_eq!(fingerprint(&after_first), fingerprint(&after_second));

    let delete = ChangeEvent::delete("orders", DocumentId::Int(1));
    assert_eq!(
        applier.apply(&orders, &delete).await.unwrap(),
        ApplyOutcome::Deleted
    );
    assert_eq!(
        applier.apply(&orders, &delete).await.unwrap(),
        ApplyOutcome::Noop
    );
    assert_eq!(h.target.len("orders"), 0);
}

#[tokio::test]
async fn poisoned_event_does_not_block_the_stream() {
    let h = Harness::new(MemorySource::new());
    let applier = h.applier();
    let orders = spec("orders");
    let now = Utc::now();

    h.target.reject_document(DocumentId::Int(2));
    let events = vec![
        ChangeEvent::upsert("orders", ChangeOp::Insert, sample_document(1, 1, now)),
        ChangeEvent::upsert("orders", ChangeOp::Insert, sample_document(2, 2, now)),
        ChangeEvent::upsert("orders", ChangeOp::Insert, sample_document(3, 3, now)),
    ];

    let stats = applier.apply_batch(&orders, &events).await.unwrap();
    assert_eq!(stats.updates, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(h.target.len("orders"), 2);
    assert_eq!(h.ctx.failed.read("orders").len(), 1);
}

#[tokio::test]
async fn streaming_applies_feed_order_and_commits_resume_token() {
    let h = Harness::new(MemorySource::with_streaming());
    let orders = spec("orders");
    let now = Utc::now();

    let mut worker = CaptureWorker::new(h.ctx.clone(), orders.clone());
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = {
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { worker.run(rx).await })
    };

    // Three revisions of the same document, then a delete of another.
    h.target.put("orders", sample_document(9, 0, now));
    h.source
        .push_change(ChangeEvent::upsert(
            "orders",
            ChangeOp::Insert,
            sample_document(1, 1, now),
        ));
    h.source
        .push_change(ChangeEvent::upsert(
            "orders",
            ChangeOp::Update,
            sample_document(1, 2, now),
        ));
    h.source
        .push_change(ChangeEvent::upsert(
            "orders",
            ChangeOp::Replace,
            sample_document(1, 3, now),
        ));
    h.source
        .push_change(ChangeEvent::delete("orders", DocumentId::Int(9)));

    let progress = h.ctx.progress.clone();
    wait_for("all events applied", || {
        progress
            .get("orders")
            .is_some_and(|s| s.deletions_applied == 1 && s.updates_applied == 3)
    })
    .await;

    // Feed order preserved: the last revision wins.
    let doc = h.target.get_document("orders", &DocumentId::Int(1)).unwrap();
    let expected = sample_document(1, 3, now);
    assert_eq!(fingerprint(&doc), fingerprint(&expected));
    assert!(h.target.get_document("orders", &DocumentId::Int(9)).is_none());

    // The resume token is committed periodically, not only at shutdown.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if h.ctx.checkpoints.get("orders").await.resume_token.is_some() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for resume token commit"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(()).unwrap();
    let state = handle.await.unwrap();
    assert_eq!(state, WorkerState::Stopped);
    assert_eq!(
        h.ctx.progress.get("orders").unwrap().state,
        CollectionState::Completed
    );
}

#[tokio::test]
async fn disconnected_feed_escalates_to_failed_after_bounded_retries() {
    let h = Harness::new(MemorySource::with_streaming());
    let orders = spec("orders");

    let mut worker = CaptureWorker::new(h.ctx.clone(), orders.clone());
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = {
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { worker.run(rx).await })
    };

    // Dropping the feed sender disconnects the stream; the re-subscribe
    // also fails, exhausting the bounded retry count.
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.source.close_feed();

    let state = handle.await.unwrap();
    assert_eq!(state, WorkerState::Failed);
    assert_eq!(
        h.ctx.progress.get("orders").unwrap().state,
        CollectionState::Failed
    );
    assert!(h.ctx.progress.any_failed());
}

#[tokio::test]
async fn update_cycle_syncs_updates_and_deletions() {
    // A thousand orders are copied; five are then updated and three
    // deleted at the source. One update cycle converges the target.
    let h = Harness::new(MemorySource::new());
    let t0 = Utc::now();
    for i in 0..1000 {
        h.source.put("orders", sample_document(i, i, t0));
    }
    h.bulk_copy("orders").await;
    assert_eq!(h.target.len("orders"), 1000);

    let t1 = t0 + chrono::Duration::seconds(30);
    for i in 0..5 {
        h.source.put("orders", sample_document(i, 9000 + i, t1));
    }
    for i in [100, 101, 102] {
        h.source.remove("orders", &DocumentId::Int(i));
    }

    let mut worker = CaptureWorker::new(h.ctx.clone(), spec("orders"));
    let stats = worker.update_cycle(false).await.unwrap();

    assert_eq!(stats.updates, 5);
    assert_eq!(stats.deletions, 3);
    assert_eq!(h.target.len("orders"), 997);

    let snapshot = h.ctx.progress.get("orders").unwrap();
    assert_eq!(snapshot.updates_applied, 5);
    assert_eq!(snapshot.deletions_applied, 3);
    assert_eq!(snapshot.source_count, 997);
    assert_eq!(snapshot.target_count, 997);

    // Zero verification mismatches afterwards.
    let verifier = Verifier::new(
        h.ctx.source.clone(),
        h.ctx.target.clone(),
        VerifyOptions {
            sample_size: 100,
            exhaustive: true,
        },
    );
    let result = verifier.compare(&spec("orders")).await.unwrap();
    assert_eq!(result.status, VerifyStatus::Ok);
    assert!(result.mismatched_ids.is_empty());

    // A second cycle finds nothing left to do.
    let stats = worker.update_cycle(false).await.unwrap();
    assert_eq!(stats.updates, 0);
    assert_eq!(stats.deletions, 0);
}

#[tokio::test]
async fn force_refresh_clears_a_fully_deleted_collection() {
    // Ten documents, all deleted at the source afterwards: a force-refresh
    // cycle must empty the target and count every deletion.
    let h = Harness::new(MemorySource::new());
    let t0 = Utc::now();
    for i in 0..10 {
        h.source.put("orders", sample_document(i, i, t0));
    }
    h.bulk_copy("orders").await;
    assert_eq!(h.target.len("orders"), 10);

    h.source.clear("orders");

    let mut worker = CaptureWorker::new(h.ctx.clone(), spec("orders"));
    let stats = worker.update_cycle(true).await.unwrap();

    assert_eq!(stats.deletions, 10);
    assert_eq!(h.target.len("orders"), 0);
    assert_eq!(h.ctx.progress.get("orders").unwrap().deletions_applied, 10);
}

#[tokio::test]
async fn force_refresh_detects_content_changes_without_timestamps() {
    // A document whose content changed but whose modification timestamp
    // did not (or does not exist) is invisible to polling; force-refresh
    // catches it by fingerprint.
    let h = Harness::new(MemorySource::new());
    let t0 = Utc::now();
    h.source.put("orders", sample_document(1, 10, t0));
    h.bulk_copy("orders").await;

    // Establish the timestamp watermark, then change content without
    // touching the timestamp.
    let mut worker = CaptureWorker::new(h.ctx.clone(), spec("orders"));
    worker.update_cycle(false).await.unwrap();
    h.source.put("orders", sample_document(1, 99, t0));

    let stats = worker.update_cycle(false).await.unwrap();
    assert_eq!(stats.updates, 0, "timestamp polling must not see this");

    let stats = worker.update_cycle(true).await.unwrap();
    assert_eq!(stats.updates, 1);

    let doc = h.target.get_document("orders", &DocumentId::Int(1)).unwrap();
    let expected = sample_document(1, 99, t0);
    assert_eq!(fingerprint(&doc), fingerprint(&expected));
}

#[tokio::test]
async fn repeated_cycles_converge_to_a_mirror() {
    let h = Harness::new(MemorySource::new());
    let t0 = Utc::now();
    for i in 0..50 {
        h.source.put("orders", sample_document(i, i, t0));
    }
    h.bulk_copy("orders").await;

    // Concurrent-looking churn: updates, deletions, and fresh inserts.
    let t1 = t0 + chrono::Duration::seconds(10);
    for i in 0..10 {
        h.source.put("orders", sample_document(i, 1000 + i, t1));
    }
    for i in 20..25 {
        h.source.remove("orders", &DocumentId::Int(i));
    }
    for i in 100..107 {
        h.source.put("orders", sample_document(i, i, t1));
    }

    let mut worker = CaptureWorker::new(h.ctx.clone(), spec("orders"));
    for _ in 0..5 {
        let stats = worker.update_cycle(false).await.unwrap();
        if stats.updates == 0 && stats.deletions == 0 {
            break;
        }
    }

    assert_eq!(h.target.len("orders"), h.source.len("orders"));
    let verifier = Verifier::new(
        h.ctx.source.clone(),
        h.ctx.target.clone(),
        VerifyOptions {
            sample_size: 100,
            exhaustive: true,
        },
    );
    let result = verifier.compare(&spec("orders")).await.unwrap();
    assert_eq!(result.status, VerifyStatus::Ok);
}

#[tokio::test]
async fn polling_worker_stops_gracefully_with_committed_checkpoint() {
    let h = Harness::new(MemorySource::new());
    let t0 = Utc::now();
    for i in 0..3 {
        h.source.put("orders", sample_document(i, i, t0));
    }

    let mut worker = CaptureWorker::new(h.ctx.clone(), spec("orders"));
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = {
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { worker.run(rx).await })
    };

    let target = h.target.clone();
    wait_for("first polling cycle", || target.len("orders") == 3).await;

    shutdown_tx.send(()).unwrap();
    let state = handle.await.unwrap();
    assert_eq!(state, WorkerState::Stopped);

    // The cycle committed its watermark before the worker reported
    // stopped.
    let checkpoint = h.ctx.checkpoints.get("orders").await;
    assert!(checkpoint.last_timestamp.is_some());
    assert_eq!(
        h.ctx.progress.get("orders").unwrap().state,
        CollectionState::Completed
    );
}

#[tokio::test]
async fn fixed_pool_rotates_collections_round_robin() {
    let h = Harness::new(MemorySource::new());
    let t0 = Utc::now();
    for name in ["alpha", "beta", "gamma"] {
        for i in 0..2 {
            h.source.put(name, sample_document(i, i, t0));
        }
    }
    let specs: Vec<CollectionSpec> = ["alpha", "beta", "gamma"]
        .into_iter()
        .map(spec)
        .collect();

    let (shutdown_tx, _) = broadcast::channel(1);
    let pool = WorkerPool::new(h.ctx.clone(), Threads::Fixed(2))
        .with_grace(Duration::from_secs(2));
    let handle = {
        let specs = specs.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move { pool.run(&specs, &shutdown_tx).await })
    };

    let target = h.target.clone();
    wait_for("all collections synced", || {
        ["alpha", "beta", "gamma"]
            .iter()
            .all(|name| target.len(name) == 2)
    })
    .await;

    shutdown_tx.send(()).unwrap();
    let states = handle.await.unwrap();
    assert_eq!(states.len(), 3);
    assert!(states.values().all(|s| *s == WorkerState::Stopped));
}

#[tokio::test]
async fn lease_allows_only_one_active_worker_per_collection() {
    let h = Harness::new(MemorySource::new());
    let t0 = Utc::now();
    h.source.put("orders", sample_document(1, 1, t0));

    // The same collection listed twice must yield exactly one worker.
    let specs = vec![spec("orders"), spec("orders")];
    let (shutdown_tx, _) = broadcast::channel(1);
    let pool = WorkerPool::new(h.ctx.clone(), Threads::Auto)
        .with_grace(Duration::from_secs(2));
    let handle = {
        let specs = specs.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move { pool.run(&specs, &shutdown_tx).await })
    };

    let target = h.target.clone();
    wait_for("collection synced", || target.len("orders") == 1).await;

    shutdown_tx.send(()).unwrap();
    let states = handle.await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states.get("orders"), Some(&WorkerState::Stopped));
}

#[tokio::test]
async fn failure_in_one_collection_does_not_affect_others() {
    let h = Harness::new(MemorySource::new());
    let t0 = Utc::now();
    for name in ["healthy", "poisoned"] {
        for i in 0..3 {
            h.source.put(name, sample_document(i, i, t0));
        }
    }

    // Every read of the poisoned collection fails; the healthy one syncs.
    let mut healthy = CaptureWorker::new(h.ctx.clone(), spec("healthy"));
    healthy.update_cycle(true).await.unwrap();
    assert_eq!(h.target.len("healthy"), 3);

    h.source.fail_reads_after(0);
    let mut poisoned = CaptureWorker::new(h.ctx.clone(), spec("poisoned"));
    assert!(poisoned.update_cycle(true).await.is_err());
    h.source.allow_all_reads();

    // The healthy collection's state is untouched by the failure.
    assert_eq!(h.target.len("healthy"), 3);
    assert_eq!(
        h.ctx.progress.get("healthy").unwrap().target_count,
        3
    );
}
