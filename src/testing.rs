//! In-memory source and target backends.
//!
//! These implement the engine's database seams over plain maps so the
//! copier, capture workers, applier, and verifier can be exercised without
//! a running database. Failure injection mirrors the error taxonomy:
//! transient failures consume retries, validation failures are permanent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use sync_core::{ChangeEvent, CollectionSpec, Document, DocumentId, SyncError, Value};

use crate::source::{ChangeFeed, IndexSpec, SourceReader};
use crate::sink::TargetWriter;

type Collections = HashMap<String, BTreeMap<DocumentId, Document>>;

/// Build a small test document with an id, a payload field, and a
/// modification timestamp.
pub fn sample_document(id: i64, value: i64, updated_at: DateTime<Utc>) -> Document {
    let mut fields = BTreeMap::new();
    fields.insert("value".to_string(), Value::Int64(value));
    fields.insert(
        sync_core::MODIFIED_AT_FIELD.to_string(),
        Value::DateTime(updated_at),
    );
    Document::new(DocumentId::Int(id), fields)
}

#[derive(Default)]
struct MemorySourceInner {
    collections: Collections,
    indexes: HashMap<String, Vec<IndexSpec>>,
    /// `None` means reads always succeed; `Some(n)` allows n more
    /// successful reads before every read fails transiently.
    reads_before_failure: Option<u64>,
    streaming_enabled: bool,
}

/// In-memory [`SourceReader`].
#[derive(Clone, Default)]
pub struct MemorySource {
    inner: Arc<Mutex<MemorySourceInner>>,
    feed: Arc<Mutex<Option<mpsc::UnboundedReceiver<ChangeEvent>>>>,
    feed_tx: Arc<Mutex<Option<mpsc::UnboundedSender<ChangeEvent>>>>,
}

impl MemorySource {
    /// A polling-only source: `subscribe` reports capture as unsupported.
    pub fn new() -> Self {
        MemorySource::default()
    }

    /// A source with a live change feed; push events with
    /// [`MemorySource::push_change`].
    pub fn with_streaming() -> Self {
        let source = MemorySource::default();
        let (tx, rx) = mpsc::unbounded_channel();
        source.inner.lock().unwrap().streaming_enabled = true;
        *source.feed.lock().unwrap() = Some(rx);
        *source.feed_tx.lock().unwrap() = Some(tx);
        source
    }

    pub fn put(&self, collection: &str, document: Document) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(document.id.clone(), document);
    }

    pub fn remove(&self, collection: &str, id: &DocumentId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(docs) = inner.collections.get_mut(collection) {
            docs.remove(id);
        }
    }

    pub fn clear(&self, collection: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(docs) = inner.collections.get_mut(collection) {
            docs.clear();
        }
    }

    pub fn len(&self, collection: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.collections.get(collection).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    pub fn add_index(&self, collection: &str, index: IndexSpec) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .indexes
            .entry(collection.to_string())
            .or_default()
            .push(index);
    }

    /// Allow `n` more successful reads, then fail every read transiently
    /// until [`MemorySource::allow_all_reads`].
    pub fn fail_reads_after(&self, n: u64) {
        self.inner.lock().unwrap().reads_before_failure = Some(n);
    }

    pub fn allow_all_reads(&self) {
        self.inner.lock().unwrap().reads_before_failure = None;
    }

    /// Deliver an event on the live feed.
    pub fn push_change(&self, event: ChangeEvent) {
        let tx = self.feed_tx.lock().unwrap();
        tx.as_ref()
            .expect("push_change requires with_streaming")
            .send(event)
            .expect("feed receiver dropped");
    }

    /// Close the live feed; the subscribed worker observes a disconnect.
    pub fn close_feed(&self) {
        self.feed_tx.lock().unwrap().take();
    }

    fn check_read_budget(&self) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().unwrap();
        match &mut inner.reads_before_failure {
            None => Ok(()),
            Some(0) => Err(SyncError::Transient("injected read failure".to_string())),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn count(&self, spec: &CollectionSpec) -> Result<u64, SyncError> {
        Ok(self.len(&spec.collection) as u64)
    }

    async fn read_batch(
        &self,
        spec: &CollectionSpec,
        after: Option<&DocumentId>,
        limit: usize,
    ) -> Result<Vec<Document>, SyncError> {
        self.check_read_budget()?;
        let inner = self.inner.lock().unwrap();
        let Some(docs) = inner.collections.get(&spec.collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .values()
            .filter(|doc| after.is_none_or(|a| doc.id > *a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn read_modified_since(
        &self,
        spec: &CollectionSpec,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Document>, SyncError> {
        self.check_read_budget()?;
        let inner = self.inner.lock().unwrap();
        let Some(docs) = inner.collections.get(&spec.collection) else {
            return Ok(Vec::new());
        };
        let mut candidates: Vec<Document> = docs
            .values()
            .filter(|doc| match since {
                None => true,
                Some(ts) => doc.modified_at().is_some_and(|m| m > ts),
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            (a.modified_at(), &a.id).cmp(&(b.modified_at(), &b.id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn get(
        &self,
        spec: &CollectionSpec,
        id: &DocumentId,
    ) -> Result<Option<Document>, SyncError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .collections
            .get(&spec.collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn contains(&self, spec: &CollectionSpec, id: &DocumentId) -> Result<bool, SyncError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .collections
            .get(&spec.collection)
            .is_some_and(|docs| docs.contains_key(id)))
    }

    async fn indexes(&self, spec: &CollectionSpec) -> Result<Vec<IndexSpec>, SyncError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .indexes
            .get(&spec.collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe(
        &self,
        _spec: &CollectionSpec,
        _resume_token: Option<&[u8]>,
    ) -> Result<Box<dyn ChangeFeed>, SyncError> {
        if !self.inner.lock().unwrap().streaming_enabled {
            return Err(SyncError::CaptureUnsupported(
                "memory source has no change feed".to_string(),
            ));
        }
        let Some(rx) = self.feed.lock().unwrap().take() else {
            return Err(SyncError::CaptureDisconnect(
                "change feed already consumed".to_string(),
            ));
        };
        Ok(Box::new(MemoryFeed { rx, delivered: 0 }))
    }
}

struct MemoryFeed {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    delivered: u64,
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn next(&mut self) -> Option<Result<ChangeEvent, SyncError>> {
        let event = self.rx.recv().await?;
        self.delivered += 1;
        Some(Ok(event))
    }

    fn resume_token(&self) -> Option<Vec<u8>> {
        (self.delivered > 0).then(|| self.delivered.to_be_bytes().to_vec())
    }
}

#[derive(Default)]
struct MemoryTargetInner {
    collections: Collections,
    indexes: HashMap<String, Vec<IndexSpec>>,
    /// Upserts/deletes that fail transiently before writes succeed again.
    transient_failures: u64,
    /// Ids whose upsert is rejected as a validation failure.
    validation_ids: HashSet<DocumentId>,
}

/// In-memory [`TargetWriter`].
#[derive(Clone, Default)]
pub struct MemoryTarget {
    inner: Arc<Mutex<MemoryTargetInner>>,
    batch_attempts: Arc<AtomicU64>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        MemoryTarget::default()
    }

    pub fn len(&self, collection: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.collections.get(collection).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    pub fn get_document(&self, collection: &str, id: &DocumentId) -> Option<Document> {
        let inner = self.inner.lock().unwrap();
        inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    pub fn ids(&self, collection: &str) -> Vec<DocumentId> {
        let inner = self.inner.lock().unwrap();
        inner
            .collections
            .get(collection)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Seed the target directly, bypassing failure injection.
    pub fn put(&self, collection: &str, document: Document) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(document.id.clone(), document);
    }

    pub fn index_names(&self, collection: &str) -> Vec<Option<String>> {
        let inner = self.inner.lock().unwrap();
        inner
            .indexes
            .get(collection)
            .map(|v| v.iter().map(|i| i.name.clone()).collect())
            .unwrap_or_default()
    }

    /// The next `n` writes fail transiently.
    pub fn fail_next_writes(&self, n: u64) {
        self.inner.lock().unwrap().transient_failures = n;
    }

    /// Upserts of this id are rejected as validation failures.
    pub fn reject_document(&self, id: DocumentId) {
        self.inner.lock().unwrap().validation_ids.insert(id);
    }

    /// Number of `upsert_batch` calls observed, including failed ones.
    pub fn batch_attempts(&self) -> u64 {
        self.batch_attempts.load(Ordering::SeqCst)
    }

    fn check_write(&self, id: &DocumentId) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            return Err(SyncError::Transient("injected write failure".to_string()));
        }
        if inner.validation_ids.contains(id) {
            return Err(SyncError::Validation(format!(
                "document {id} rejected by target"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TargetWriter for MemoryTarget {
    async fn count(&self, spec: &CollectionSpec) -> Result<u64, SyncError> {
        Ok(self.len(&spec.collection) as u64)
    }

    async fn upsert(&self, spec: &CollectionSpec, document: &Document) -> Result<(), SyncError> {
        self.check_write(&document.id)?;
        self.put(&spec.collection, document.clone());
        Ok(())
    }

    async fn upsert_batch(
        &self,
        spec: &CollectionSpec,
        documents: &[Document],
    ) -> Result<(), SyncError> {
        self.batch_attempts.fetch_add(1, Ordering::SeqCst);
        for document in documents {
            self.upsert(spec, document).await?;
        }
        Ok(())
    }

    async fn delete(&self, spec: &CollectionSpec, id: &DocumentId) -> Result<bool, SyncError> {
        self.check_write(id)?;
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .collections
            .get_mut(&spec.collection)
            .is_some_and(|docs| docs.remove(id).is_some()))
    }

    async fn get(
        &self,
        spec: &CollectionSpec,
        id: &DocumentId,
    ) -> Result<Option<Document>, SyncError> {
        Ok(self.get_document(&spec.collection, id))
    }

    async fn list_ids(
        &self,
        spec: &CollectionSpec,
        limit: usize,
    ) -> Result<Vec<DocumentId>, SyncError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .collections
            .get(&spec.collection)
            .map(|docs| docs.keys().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn ensure_index(
        &self,
        spec: &CollectionSpec,
        index: &IndexSpec,
    ) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().unwrap();
        let indexes = inner
            .indexes
            .entry(spec.collection.clone())
            .or_default();
        if !indexes.iter().any(|existing| existing.name == index.name) {
            indexes.push(index.clone());
        }
        Ok(())
    }
}
