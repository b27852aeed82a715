//! Source database access.
//!
//! The engine reads the source only through the [`SourceReader`] and
//! [`ChangeFeed`] traits: ordered batch reads for the bulk copier,
//! modification-time queries for polling capture, and a live change feed
//! for streaming capture. [`MongoSource`] is the production implementation;
//! the in-memory implementation for tests lives in [`crate::testing`].

use async_trait::async_trait;
use bson::doc;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::options::{ClientOptions, FullDocumentType};
use mongodb::Client;
use std::time::Duration;
use sync_core::{
    ChangeEvent, ChangeOp, CollectionSpec, Document, DocumentId, SyncError, MODIFIED_AT_FIELD,
};

use crate::convert::{
    classify_mongo_error, document_from_bson, document_id_to_bson,
};

/// A replicated index definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: Option<String>,
    /// Key fields with sort direction (1 ascending, -1 descending).
    pub keys: Vec<(String, i32)>,
    pub unique: bool,
}

/// Read access to the source database.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Number of documents in the replicated subset.
    async fn count(&self, spec: &CollectionSpec) -> Result<u64, SyncError>;

    /// Read up to `limit` documents with id greater than `after`, in id
    /// order. The stable order is what makes bulk copy resumable.
    async fn read_batch(
        &self,
        spec: &CollectionSpec,
        after: Option<&DocumentId>,
        limit: usize,
    ) -> Result<Vec<Document>, SyncError>;

    /// Read up to `limit` documents modified after `since`, ordered by
    /// modification time. With `since = None` every document is a
    /// candidate. Documents without a modification timestamp are only
    /// returned in the unfiltered case.
    async fn read_modified_since(
        &self,
        spec: &CollectionSpec,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Document>, SyncError>;

    /// Fetch a single document by id.
    async fn get(
        &self,
        spec: &CollectionSpec,
        id: &DocumentId,
    ) -> Result<Option<Document>, SyncError>;

    /// Whether a document with this id exists at the source.
    async fn contains(&self, spec: &CollectionSpec, id: &DocumentId) -> Result<bool, SyncError>;

    /// Index definitions of the source collection, excluding the implicit
    /// primary-id index.
    async fn indexes(&self, spec: &CollectionSpec) -> Result<Vec<IndexSpec>, SyncError>;

    /// Subscribe to the collection's live change feed, resuming from an
    /// opaque token when one is given.
    ///
    /// Returns [`SyncError::CaptureUnsupported`] when the source cannot
    /// provide a feed at all; capture then falls back to polling.
    async fn subscribe(
        &self,
        spec: &CollectionSpec,
        resume_token: Option<&[u8]>,
    ) -> Result<Box<dyn ChangeFeed>, SyncError>;
}

/// A live feed of source changes for one collection.
#[async_trait]
pub trait ChangeFeed: Send {
    /// Next change in feed delivery order. `None` means the feed closed;
    /// errors mean it disconnected and the worker should re-init.
    async fn next(&mut self) -> Option<Result<ChangeEvent, SyncError>>;

    /// Opaque position marker for resuming this feed later.
    fn resume_token(&self) -> Option<Vec<u8>>;
}

/// MongoDB-backed source.
pub struct MongoSource {
    client: Client,
}

impl MongoSource {
    /// Connect to the source deployment.
    pub async fn connect(uri: &str) -> Result<Self, SyncError> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(classify_mongo_error)?;
        // Bounded timeouts so a dead server fails the run instead of
        // hanging it.
        options.connect_timeout = Some(Duration::from_secs(10));
        options.server_selection_timeout = Some(Duration::from_secs(10));
        options.app_name = Some("mongo-mirror".to_string());

        let client = Client::with_options(options).map_err(classify_mongo_error)?;
        Ok(MongoSource { client })
    }

    /// Round-trip to the server; used to validate the connection before a
    /// run starts.
    pub async fn ping(&self) -> Result<(), SyncError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(classify_mongo_error)?;
        Ok(())
    }

    fn collection(&self, spec: &CollectionSpec) -> mongodb::Collection<bson::Document> {
        self.client
            .database(&spec.source_db)
            .collection(&spec.collection)
    }
}

/// Base query filter from the spec's optional subset filter.
pub(crate) fn base_filter(spec: &CollectionSpec) -> bson::Document {
    match &spec.filter {
        Some(json) => match bson::to_bson(json) {
            Ok(bson::Bson::Document(doc)) => doc,
            _ => {
                tracing::warn!(
                    collection = %spec.collection,
                    "ignoring non-object collection filter"
                );
                bson::Document::new()
            }
        },
        None => bson::Document::new(),
    }
}

fn and_filter(base: bson::Document, extra: bson::Document) -> bson::Document {
    if base.is_empty() {
        extra
    } else if extra.is_empty() {
        base
    } else {
        doc! { "$and": [base, extra] }
    }
}

async fn collect_documents(
    mut cursor: mongodb::Cursor<bson::Document>,
) -> Result<Vec<Document>, SyncError> {
    let mut documents = Vec::new();
    while cursor.advance().await.map_err(classify_mongo_error)? {
        let raw: bson::Document = cursor
            .deserialize_current()
            .map_err(classify_mongo_error)?;
        documents.push(document_from_bson(raw)?);
    }
    Ok(documents)
}

#[async_trait]
impl SourceReader for MongoSource {
    async fn count(&self, spec: &CollectionSpec) -> Result<u64, SyncError> {
        self.collection(spec)
            .count_documents(base_filter(spec))
            .await
            .map_err(classify_mongo_error)
    }

    async fn read_batch(
        &self,
        spec: &CollectionSpec,
        after: Option<&DocumentId>,
        limit: usize,
    ) -> Result<Vec<Document>, SyncError> {
        let extra = match after {
            Some(id) => doc! { "_id": { "$gt": document_id_to_bson(id) } },
            None => bson::Document::new(),
        };
        let cursor = self
            .collection(spec)
            .find(and_filter(base_filter(spec), extra))
            .sort(doc! { "_id": 1 })
            .limit(limit as i64)
            .await
            .map_err(classify_mongo_error)?;
        collect_documents(cursor).await
    }

    async fn read_modified_since(
        &self,
        spec: &CollectionSpec,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Document>, SyncError> {
        let extra = match since {
            Some(ts) => {
                doc! { MODIFIED_AT_FIELD: { "$gt": bson::DateTime::from_chrono(ts) } }
            }
            None => bson::Document::new(),
        };
        let cursor = self
            .collection(spec)
            .find(and_filter(base_filter(spec), extra))
            .sort(doc! { MODIFIED_AT_FIELD: 1, "_id": 1 })
            .limit(limit as i64)
            .await
            .map_err(classify_mongo_error)?;
        collect_documents(cursor).await
    }

    async fn get(
        &self,
        spec: &CollectionSpec,
        id: &DocumentId,
    ) -> Result<Option<Document>, SyncError> {
        let found = self
            .collection(spec)
            .find_one(doc! { "_id": document_id_to_bson(id) })
            .await
            .map_err(classify_mongo_error)?;
        found.map(document_from_bson).transpose()
    }

    async fn contains(&self, spec: &CollectionSpec, id: &DocumentId) -> Result<bool, SyncError> {
        let count = self
            .collection(spec)
            .count_documents(doc! { "_id": document_id_to_bson(id) })
            .await
            .map_err(classify_mongo_error)?;
        Ok(count > 0)
    }

    async fn indexes(&self, spec: &CollectionSpec) -> Result<Vec<IndexSpec>, SyncError> {
        let mut cursor = self
            .collection(spec)
            .list_indexes()
            .await
            .map_err(classify_mongo_error)?;

        let mut specs = Vec::new();
        while cursor.advance().await.map_err(classify_mongo_error)? {
            let model = cursor
                .deserialize_current()
                .map_err(classify_mongo_error)?;
            let name = model.options.as_ref().and_then(|o| o.name.clone());
            if name.as_deref() == Some("_id_") {
                continue;
            }
            let keys: Vec<(String, i32)> = model
                .keys
                .iter()
                .map(|(field, direction)| {
                    let dir = match direction {
                        bson::Bson::Int32(i) => *i,
                        bson::Bson::Int64(i) => *i as i32,
                        bson::Bson::Double(f) => *f as i32,
                        _ => 1,
                    };
                    (field.clone(), dir)
                })
                .collect();
            let unique = model
                .options
                .as_ref()
                .and_then(|o| o.unique)
                .unwrap_or(false);
            specs.push(IndexSpec { name, keys, unique });
        }
        Ok(specs)
    }

    async fn subscribe(
        &self,
        spec: &CollectionSpec,
        resume_token: Option<&[u8]>,
    ) -> Result<Box<dyn ChangeFeed>, SyncError> {
        let collection = self.collection(spec);
        let mut action = collection
            .watch()
            .full_document(FullDocumentType::UpdateLookup);

        if let Some(bytes) = resume_token {
            let token: ResumeToken = bson::from_slice(bytes).map_err(|err| {
                SyncError::CaptureDisconnect(format!("stored resume token unusable: {err}"))
            })?;
            action = action.resume_after(token);
        }

        let stream = action.await.map_err(classify_mongo_error)?;
        tracing::info!(
            collection = %spec.collection,
            resumed = resume_token.is_some(),
            "change stream established"
        );
        Ok(Box::new(MongoChangeFeed {
            stream,
            collection: spec.collection.clone(),
        }))
    }
}

struct MongoChangeFeed {
    stream: ChangeStream<ChangeStreamEvent<bson::Document>>,
    collection: String,
}

impl MongoChangeFeed {
    fn map_event(&self, event: ChangeStreamEvent<bson::Document>) -> Option<ChangeEvent> {
        let source_timestamp = event.cluster_time.and_then(|ts| {
            chrono::DateTime::from_timestamp(i64::from(ts.time), ts.increment)
        });

        match event.operation_type {
            OperationType::Insert | OperationType::Update | OperationType::Replace => {
                let op = match event.operation_type {
                    OperationType::Insert => ChangeOp::Insert,
                    OperationType::Update => ChangeOp::Update,
                    _ => ChangeOp::Replace,
                };
                let raw = match event.full_document {
                    Some(doc) => doc,
                    None => {
                        tracing::warn!(
                            collection = %self.collection,
                            "change event without full document, skipping"
                        );
                        return None;
                    }
                };
                match document_from_bson(raw) {
                    Ok(document) => {
                        let mut change = ChangeEvent::upsert(self.collection.clone(), op, document);
                        change.source_timestamp = change.source_timestamp.or(source_timestamp);
                        Some(change)
                    }
                    Err(err) => {
                        tracing::warn!(
                            collection = %self.collection,
                            "undecodable change event document, skipping: {err}"
                        );
                        None
                    }
                }
            }
            OperationType::Delete => {
                let key = event.document_key?;
                let id_bson = key.get("_id")?;
                match crate::convert::document_id_from_bson(id_bson) {
                    Ok(id) => {
                        let mut change = ChangeEvent::delete(self.collection.clone(), id);
                        change.source_timestamp = source_timestamp;
                        Some(change)
                    }
                    Err(err) => {
                        tracing::warn!(
                            collection = %self.collection,
                            "delete event with unusable document key, skipping: {err}"
                        );
                        None
                    }
                }
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ChangeFeed for MongoChangeFeed {
    async fn next(&mut self) -> Option<Result<ChangeEvent, SyncError>> {
        loop {
            match self.stream.next().await {
                None => return None,
                Some(Err(err)) => {
                    return Some(Err(SyncError::CaptureDisconnect(err.to_string())));
                }
                Some(Ok(event)) => {
                    if event.operation_type == OperationType::Invalidate {
                        return Some(Err(SyncError::CaptureDisconnect(
                            "change stream invalidated".to_string(),
                        )));
                    }
                    match self.map_event(event) {
                        Some(change) => return Some(Ok(change)),
                        None => continue,
                    }
                }
            }
        }
    }

    fn resume_token(&self) -> Option<Vec<u8>> {
        let token = self.stream.resume_token()?;
        match bson::to_vec(&token) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::warn!(
                    collection = %self.collection,
                    "failed to serialize resume token: {err}"
                );
                None
            }
        }
    }
}
