//! Per-collection change capture.
//!
//! One logical worker per collection keeps the target synchronized after
//! the initial bulk copy. A worker prefers the source's live change feed
//! (streaming mode) and falls back to modification-time polling when the
//! source cannot provide one. Either way the worker owns its collection's
//! checkpoint: the resume token in streaming mode, the timestamp watermark
//! in polling mode, both sub-fields of the same record.
//!
//! # Worker lifecycle
//!
//! ```text
//! Init ──▶ Streaming │ Polling ──▶ Stopped        (shutdown signal)
//!   ▲           │
//!   └─ backoff ─┘ recoverable error; bounded retries, then Failed
//! ```
//!
//! Failure of one collection's worker never affects the others; a Failed
//! collection is surfaced through the progress aggregator and the process
//! exit status.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use checkpoint::CheckpointStore;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use sync_core::{
    fingerprint, retry_with_backoff, ChangeEvent, ChangeOp, CollectionSpec, CollectionState,
    Document, ProgressAggregator, RetryPolicy, SyncError,
};

use crate::apply::ChangeApplier;
use crate::config::Threads;
use crate::failed::FailedDocumentSink;
use crate::sink::TargetWriter;
use crate::source::{ChangeFeed, SourceReader};
use crate::verify::{Verifier, VerifyOptions, DELETION_SAMPLE};

/// Capture worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Streaming,
    Polling,
    Stopped,
    Failed,
}

/// Capture tuning shared by all workers.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub batch_size: usize,
    pub polling_interval: Duration,
    /// Ignore checkpoints and re-scan the full collection every cycle.
    pub force_refresh: bool,
    /// Consecutive capture failures before a collection is marked Failed.
    pub max_capture_failures: u32,
    /// Backoff between capture re-initializations.
    pub backoff: RetryPolicy,
    /// Retry policy for individual target writes.
    pub retry: RetryPolicy,
    /// Streaming mode: commit the resume token every this many events.
    pub checkpoint_every: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            batch_size: 1000,
            polling_interval: Duration::from_secs(5),
            force_refresh: false,
            max_capture_failures: 5,
            backoff: RetryPolicy::default(),
            retry: RetryPolicy::default(),
            checkpoint_every: 100,
        }
    }
}

/// Everything a worker needs, cheaply clonable per collection.
#[derive(Clone)]
pub struct CaptureContext {
    pub source: Arc<dyn SourceReader>,
    pub target: Arc<dyn TargetWriter>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub progress: ProgressAggregator,
    pub failed: Arc<FailedDocumentSink>,
    pub config: CaptureConfig,
}

/// Counters for one polling/refresh cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub scanned: u64,
    pub updates: u64,
    pub deletions: u64,
    pub failed: u64,
}

/// Continuous synchronization worker for a single collection.
pub struct CaptureWorker {
    ctx: CaptureContext,
    spec: CollectionSpec,
    applier: ChangeApplier,
    state: WorkerState,
    /// The first polling cycle always re-scans, so a worker that was down
    /// for a while starts from a known-good mirror state.
    first_cycle: bool,
    made_progress: bool,
}

impl CaptureWorker {
    pub fn new(ctx: CaptureContext, spec: CollectionSpec) -> Self {
        let applier = ChangeApplier::new(
            Arc::clone(&ctx.target),
            ctx.progress.clone(),
            Arc::clone(&ctx.failed),
            ctx.config.retry.clone(),
        );
        CaptureWorker {
            ctx,
            spec,
            applier,
            state: WorkerState::Init,
            first_cycle: true,
            made_progress: false,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn collection(&self) -> &str {
        self.spec.key()
    }

    /// Run until shutdown (→ Stopped) or until the failure bound is
    /// exhausted (→ Failed).
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> WorkerState {
        let key = self.spec.key().to_string();
        self.ctx.progress.register(&key);
        self.ctx.progress.set_state(&key, CollectionState::Running);

        let mut failures = 0u32;
        loop {
            match self.run_capture(&mut shutdown).await {
                Ok(()) => {
                    tracing::info!(collection = %key, "capture worker stopped cleanly");
                    self.state = WorkerState::Stopped;
                    self.ctx.progress.set_state(&key, CollectionState::Completed);
                    return self.state;
                }
                Err(err) => {
                    if std::mem::take(&mut self.made_progress) {
                        failures = 0;
                    }
                    failures += 1;
                    if failures >= self.ctx.config.max_capture_failures {
                        tracing::error!(
                            collection = %key,
                            failures,
                            "capture failed too many times, giving up: {err}"
                        );
                        self.state = WorkerState::Failed;
                        self.ctx.progress.set_state(&key, CollectionState::Failed);
                        return self.state;
                    }

                    let delay = self.ctx.config.backoff.delay(failures - 1);
                    tracing::warn!(
                        collection = %key,
                        failures,
                        "capture error, re-initializing in {delay:?}: {err}"
                    );
                    self.state = WorkerState::Init;
                    tokio::select! {
                        _ = shutdown.recv() => {
                            self.state = WorkerState::Stopped;
                            self.ctx.progress.set_state(&key, CollectionState::Completed);
                            return self.state;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One capture session: streaming when the source supports it, polling
    /// otherwise. Returns `Ok(())` only on shutdown.
    async fn run_capture(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), SyncError> {
        let checkpoint = self.ctx.checkpoints.get(self.spec.key()).await;
        let token = checkpoint.resume_token.clone();

        match self.ctx.source.subscribe(&self.spec, token.as_deref()).await {
            Ok(feed) => self.stream_loop(feed, shutdown).await,
            Err(SyncError::CaptureUnsupported(reason)) => {
                tracing::info!(
                    collection = %self.spec.collection,
                    "change feed unavailable ({reason}), falling back to polling"
                );
                self.poll_loop(shutdown).await
            }
            Err(err) if token.is_some() => {
                // A stale resume token must not wedge the worker; restart
                // the stream from the present and let the next polling-style
                // refresh cover the gap.
                tracing::warn!(
                    collection = %self.spec.collection,
                    "resume from stored token failed ({err}), restarting stream from now"
                );
                let feed = self.ctx.source.subscribe(&self.spec, None).await?;
                self.stream_loop(feed, shutdown).await
            }
            Err(err) => Err(err),
        }
    }

    /// Consume the live feed, preserving its delivery order end-to-end.
    async fn stream_loop(
        &mut self,
        mut feed: Box<dyn ChangeFeed>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), SyncError> {
        self.state = WorkerState::Streaming;
        let key = self.spec.key().to_string();
        let mut checkpoint = self.ctx.checkpoints.get(&key).await;
        let mut processed = 0u64;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    self.commit_stream_checkpoint(&mut checkpoint, &mut *feed).await?;
                    tracing::info!(collection = %key, processed, "streaming stopped on shutdown");
                    return Ok(());
                }
                next = feed.next() => {
                    let event = match next {
                        Some(Ok(event)) => event,
                        Some(Err(err)) => {
                            self.commit_stream_checkpoint(&mut checkpoint, &mut *feed).await?;
                            return Err(err);
                        }
                        None => {
                            self.commit_stream_checkpoint(&mut checkpoint, &mut *feed).await?;
                            return Err(SyncError::CaptureDisconnect(
                                "change feed closed".to_string(),
                            ));
                        }
                    };

                    self.applier
                        .apply_batch(&self.spec, std::slice::from_ref(&event))
                        .await?;
                    self.made_progress = true;
                    processed += 1;

                    if let Some(ts) = event.source_timestamp {
                        checkpoint.advance_timestamp(ts);
                    }
                    if processed % self.ctx.config.checkpoint_every == 0 {
                        self.commit_stream_checkpoint(&mut checkpoint, &mut *feed).await?;
                        tracing::debug!(collection = %key, processed, "resume token committed");
                    }
                }
            }
        }
    }

    async fn commit_stream_checkpoint(
        &self,
        checkpoint: &mut checkpoint::Checkpoint,
        feed: &mut dyn ChangeFeed,
    ) -> Result<(), SyncError> {
        if let Some(token) = feed.resume_token() {
            checkpoint.resume_token = Some(token);
        }
        checkpoint.updated_at = chrono::Utc::now();
        self.ctx
            .checkpoints
            .commit(checkpoint)
            .await
            .map_err(|err| SyncError::CheckpointIo(err.to_string()))
    }

    /// Timer-driven polling; cancellation is observed at every sleep
    /// boundary.
    async fn poll_loop(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), SyncError> {
        self.state = WorkerState::Polling;
        let mut interval = tokio::time::interval(self.ctx.config.polling_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(collection = %self.spec.collection, "polling stopped on shutdown");
                    return Ok(());
                }
                _ = interval.tick() => {
                    let stats = self.poll_once().await?;
                    tracing::debug!(
                        collection = %self.spec.collection,
                        scanned = stats.scanned,
                        updates = stats.updates,
                        deletions = stats.deletions,
                        "polling cycle complete"
                    );
                }
            }
        }
    }

    /// One polling cycle, honoring the first-cycle and force-refresh
    /// re-scan rules.
    pub async fn poll_once(&mut self) -> Result<CycleStats, SyncError> {
        let force = self.ctx.config.force_refresh || self.first_cycle;
        let stats = self.update_cycle(force).await?;
        self.first_cycle = false;
        Ok(stats)
    }

    /// One full synchronization cycle: upsert changed documents, then
    /// delete documents that vanished from the source, then commit the
    /// checkpoint.
    ///
    /// With `force_refresh` the cycle ignores the timestamp watermark,
    /// re-scans the entire collection comparing content fingerprints, and
    /// widens deletion detection to near-exhaustive - the only mode that
    /// catches deletions and content-only changes for documents without a
    /// modification timestamp.
    pub async fn update_cycle(&mut self, force_refresh: bool) -> Result<CycleStats, SyncError> {
        let key = self.spec.key().to_string();
        let mut checkpoint = self.ctx.checkpoints.get(&key).await;
        let mut stats = CycleStats::default();

        if force_refresh {
            self.refresh_pass(&mut checkpoint, &mut stats).await?;
        } else {
            self.incremental_pass(&mut checkpoint, &mut stats).await?;
        }

        self.deletion_pass(force_refresh, &mut stats).await?;

        checkpoint.updated_at = chrono::Utc::now();
        self.ctx
            .checkpoints
            .commit(&checkpoint)
            .await
            .map_err(|err| SyncError::CheckpointIo(err.to_string()))?;

        self.made_progress = true;
        Ok(stats)
    }

    /// Full id-ordered scan, fingerprint-comparing every document.
    async fn refresh_pass(
        &self,
        checkpoint: &mut checkpoint::Checkpoint,
        stats: &mut CycleStats,
    ) -> Result<(), SyncError> {
        let mut after = None;
        loop {
            let batch = self.read_batch_with_retry(after.as_ref()).await?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.id.clone());

            stats.scanned += batch.len() as u64;
            let events = self.changed_events(&batch).await?;
            let applied = self.applier.apply_batch(&self.spec, &events).await?;
            stats.updates += applied.updates;
            stats.failed += applied.failed;

            for doc in &batch {
                if let Some(ts) = doc.modified_at() {
                    checkpoint.advance_timestamp(ts);
                }
            }

            if batch.len() < self.ctx.config.batch_size {
                break;
            }
        }
        Ok(())
    }

    /// Timestamp-filtered scan from the checkpoint watermark.
    ///
    /// Documents without a modification timestamp are invisible here; the
    /// force-refresh pass is what picks those up.
    async fn incremental_pass(
        &self,
        checkpoint: &mut checkpoint::Checkpoint,
        stats: &mut CycleStats,
    ) -> Result<(), SyncError> {
        let mut since = checkpoint.last_timestamp;
        loop {
            let batch = {
                let source = Arc::clone(&self.ctx.source);
                let spec = self.spec.clone();
                let limit = self.ctx.config.batch_size;
                retry_with_backoff(&self.ctx.config.retry, "modified-since read", move || {
                    let source = Arc::clone(&source);
                    let spec = spec.clone();
                    async move { source.read_modified_since(&spec, since, limit).await }
                })
                .await?
            };
            if batch.is_empty() {
                break;
            }

            stats.scanned += batch.len() as u64;
            let events = self.changed_events(&batch).await?;
            let applied = self.applier.apply_batch(&self.spec, &events).await?;
            stats.updates += applied.updates;
            stats.failed += applied.failed;

            let batch_max = batch.iter().filter_map(Document::modified_at).max();
            match batch_max {
                Some(ts) if Some(ts) != since => {
                    since = Some(ts);
                    checkpoint.advance_timestamp(ts);
                }
                _ => {
                    // No watermark progress is possible; stop the cycle
                    // rather than spin on the same window.
                    break;
                }
            }
            if batch.len() < self.ctx.config.batch_size {
                break;
            }
        }
        Ok(())
    }

    async fn read_batch_with_retry(
        &self,
        after: Option<&sync_core::DocumentId>,
    ) -> Result<Vec<Document>, SyncError> {
        let after = after.cloned();
        let source = Arc::clone(&self.ctx.source);
        let spec = self.spec.clone();
        let limit = self.ctx.config.batch_size;
        retry_with_backoff(&self.ctx.config.retry, "source batch read", move || {
            let source = Arc::clone(&source);
            let spec = spec.clone();
            let after = after.clone();
            async move { source.read_batch(&spec, after.as_ref(), limit).await }
        })
        .await
    }

    /// Reduce a batch of source documents to the events actually worth
    /// applying: documents missing from the target or with differing
    /// content fingerprints.
    async fn changed_events(&self, batch: &[Document]) -> Result<Vec<ChangeEvent>, SyncError> {
        let mut events = Vec::new();
        for doc in batch {
            match self.ctx.target.get(&self.spec, &doc.id).await? {
                None => {
                    events.push(ChangeEvent::upsert(
                        self.spec.collection.clone(),
                        ChangeOp::Insert,
                        doc.clone(),
                    ));
                }
                Some(target_doc) => {
                    if fingerprint(doc) != fingerprint(&target_doc) {
                        events.push(ChangeEvent::upsert(
                            self.spec.collection.clone(),
                            ChangeOp::Replace,
                            doc.clone(),
                        ));
                    }
                }
            }
        }
        Ok(events)
    }

    /// Polling cannot observe deletions, so each cycle delegates to the
    /// verifier's sampling: target ids absent from the source become
    /// delete events.
    async fn deletion_pass(
        &self,
        force_refresh: bool,
        stats: &mut CycleStats,
    ) -> Result<(), SyncError> {
        let key = self.spec.key();
        let source_count = self.ctx.source.count(&self.spec).await?;
        let target_count = self.ctx.target.count(&self.spec).await?;
        self.ctx.progress.set_counts(key, source_count, target_count);

        let widen = target_count > source_count;
        if target_count > 0 {
            let verifier = Verifier::new(
                Arc::clone(&self.ctx.source),
                Arc::clone(&self.ctx.target),
                VerifyOptions {
                    sample_size: DELETION_SAMPLE,
                    exhaustive: force_refresh,
                },
            );
            let extra = verifier.sample_extra_ids(&self.spec, widen).await?;
            if !extra.is_empty() {
                tracing::info!(
                    collection = %key,
                    count = extra.len(),
                    "removing documents deleted at source"
                );
                let deletes: Vec<ChangeEvent> = extra
                    .into_iter()
                    .map(|id| ChangeEvent::delete(self.spec.collection.clone(), id))
                    .collect();
                let applied = self.applier.apply_batch(&self.spec, &deletes).await?;
                stats.deletions += applied.deletions;
                stats.failed += applied.failed;
            }
        }

        // Deletion pass changes the target count; keep monitoring honest.
        if stats.deletions > 0 {
            let target_count = self.ctx.target.count(&self.spec).await?;
            self.ctx.progress.set_counts(key, source_count, target_count);
        }
        Ok(())
    }
}

/// Single-active-worker lease, keyed by collection.
struct Lease {
    registry: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Lease {
    fn acquire(registry: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Lease> {
        let mut held = registry.lock().expect("lease registry lock poisoned");
        if !held.insert(key.to_string()) {
            return None;
        }
        Some(Lease {
            registry: Arc::clone(registry),
            key: key.to_string(),
        })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut held = self.registry.lock().expect("lease registry lock poisoned");
        held.remove(&self.key);
    }
}

/// Bounded pool of capture workers.
///
/// `Threads::Auto` runs one worker per collection, each free to use
/// streaming capture. A fixed size runs that many rotation tasks, each
/// polling its round-robin share of collections once per interval.
pub struct WorkerPool {
    ctx: CaptureContext,
    threads: Threads,
    grace: Duration,
}

impl WorkerPool {
    pub fn new(ctx: CaptureContext, threads: Threads) -> Self {
        WorkerPool {
            ctx,
            threads,
            grace: Duration::from_secs(10),
        }
    }

    /// Grace period allowed for workers to finish their in-flight unit of
    /// work after shutdown; stragglers past it are force-terminated.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run workers for every spec until shutdown. Returns final states
    /// keyed by collection; force-terminated stragglers are absent.
    pub async fn run(
        &self,
        specs: &[CollectionSpec],
        shutdown: &broadcast::Sender<()>,
    ) -> BTreeMap<String, WorkerState> {
        let leases: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut tasks: JoinSet<Vec<(String, WorkerState)>> = JoinSet::new();

        match self.threads {
            Threads::Auto => {
                tracing::info!(
                    workers = specs.len(),
                    "starting capture pool, one worker per collection"
                );
                for spec in specs {
                    let ctx = self.ctx.clone();
                    let spec = spec.clone();
                    let shutdown_rx = shutdown.subscribe();
                    let leases = Arc::clone(&leases);
                    tasks.spawn(async move {
                        let Some(_lease) = Lease::acquire(&leases, spec.key()) else {
                            tracing::warn!(
                                collection = %spec.collection,
                                "collection already has an active worker, skipping"
                            );
                            return Vec::new();
                        };
                        let mut worker = CaptureWorker::new(ctx, spec.clone());
                        let state = worker.run(shutdown_rx).await;
                        vec![(spec.collection.clone(), state)]
                    });
                }
            }
            Threads::Fixed(n) => {
                let n = n.clamp(1, specs.len().max(1));
                tracing::info!(
                    workers = n,
                    collections = specs.len(),
                    "starting capture pool, collections queued round-robin"
                );
                let mut buckets: Vec<Vec<CollectionSpec>> = vec![Vec::new(); n];
                for (i, spec) in specs.iter().enumerate() {
                    buckets[i % n].push(spec.clone());
                }
                for bucket in buckets.into_iter().filter(|b| !b.is_empty()) {
                    let ctx = self.ctx.clone();
                    let shutdown_rx = shutdown.subscribe();
                    let leases = Arc::clone(&leases);
                    tasks.spawn(rotate_collections(ctx, bucket, shutdown_rx, leases));
                }
            }
        }

        self.drain(tasks, shutdown).await
    }

    async fn drain(
        &self,
        mut tasks: JoinSet<Vec<(String, WorkerState)>>,
        shutdown: &broadcast::Sender<()>,
    ) -> BTreeMap<String, WorkerState> {
        let mut states = BTreeMap::new();
        let mut shutdown_rx = shutdown.subscribe();
        let mut deadline: Option<Instant> = None;

        loop {
            if tasks.is_empty() {
                break;
            }
            if let Some(deadline) = deadline {
                match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                    Ok(Some(Ok(results))) => {
                        states.extend(results);
                    }
                    Ok(Some(Err(err))) => {
                        tracing::warn!("capture worker task failed: {err}");
                    }
                    Ok(None) => break,
                    Err(_) => {
                        tracing::warn!(
                            stragglers = tasks.len(),
                            "grace period expired, force-terminating remaining workers"
                        );
                        tasks.abort_all();
                        while tasks.join_next().await.is_some() {}
                        break;
                    }
                }
            } else {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        deadline = Some(Instant::now() + self.grace);
                    }
                    joined = tasks.join_next() => match joined {
                        Some(Ok(results)) => {
                            states.extend(results);
                        }
                        Some(Err(err)) => {
                            tracing::warn!("capture worker task failed: {err}");
                        }
                        None => break,
                    }
                }
            }
        }
        states
    }
}

/// Rotation task for fixed-size pools: polls each assigned collection once
/// per interval, in turn. Failures are isolated per collection.
async fn rotate_collections(
    ctx: CaptureContext,
    specs: Vec<CollectionSpec>,
    mut shutdown: broadcast::Receiver<()>,
    leases: Arc<Mutex<HashSet<String>>>,
) -> Vec<(String, WorkerState)> {
    let interval_duration = ctx.config.polling_interval;
    let max_failures = ctx.config.max_capture_failures;

    let mut workers: Vec<CaptureWorker> = specs
        .iter()
        .map(|spec| CaptureWorker::new(ctx.clone(), spec.clone()))
        .collect();
    let mut failures = vec![0u32; workers.len()];
    let mut states = vec![WorkerState::Polling; workers.len()];

    for worker in &workers {
        ctx.progress.register(worker.collection());
        ctx.progress
            .set_state(worker.collection(), CollectionState::Running);
    }

    let mut interval = tokio::time::interval(interval_duration);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                for (i, state) in states.iter_mut().enumerate() {
                    if *state != WorkerState::Failed {
                        *state = WorkerState::Stopped;
                        ctx.progress
                            .set_state(workers[i].collection(), CollectionState::Completed);
                    }
                }
                return workers
                    .iter()
                    .zip(states)
                    .map(|(w, s)| (w.collection().to_string(), s))
                    .collect();
            }
            _ = interval.tick() => {
                for (i, worker) in workers.iter_mut().enumerate() {
                    if states[i] == WorkerState::Failed {
                        continue;
                    }
                    let Some(_lease) = Lease::acquire(&leases, worker.collection()) else {
                        tracing::warn!(
                            collection = worker.collection(),
                            "lease held elsewhere, skipping cycle"
                        );
                        continue;
                    };
                    match worker.poll_once().await {
                        Ok(stats) => {
                            failures[i] = 0;
                            tracing::debug!(
                                collection = worker.collection(),
                                scanned = stats.scanned,
                                updates = stats.updates,
                                deletions = stats.deletions,
                                "cycle complete"
                            );
                        }
                        Err(err) => {
                            failures[i] += 1;
                            tracing::warn!(
                                collection = worker.collection(),
                                failures = failures[i],
                                "cycle failed: {err}"
                            );
                            if failures[i] >= max_failures {
                                tracing::error!(
                                    collection = worker.collection(),
                                    "collection failed too many cycles, giving up"
                                );
                                states[i] = WorkerState::Failed;
                                ctx.progress
                                    .set_state(worker.collection(), CollectionState::Failed);
                            }
                        }
                    }
                }
            }
        }
    }
}
