//! Target database access.
//!
//! All target writes go through the [`TargetWriter`] trait and are
//! idempotent at the per-document level: upserts are keyed by id, deletes
//! remove by id. [`MongoTarget`] is the production implementation; the
//! in-memory implementation for tests lives in [`crate::testing`].

use async_trait::async_trait;
use bson::doc;
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, IndexModel};
use std::time::Duration;
use sync_core::{CollectionSpec, Document, DocumentId, SyncError};

use crate::convert::{
    classify_mongo_error, document_from_bson, document_id_to_bson, document_to_bson,
    is_index_exists_error,
};
use crate::source::IndexSpec;

/// Write access to the target database.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Number of documents currently in the target collection.
    async fn count(&self, spec: &CollectionSpec) -> Result<u64, SyncError>;

    /// Insert-or-replace one document, keyed by its id.
    async fn upsert(&self, spec: &CollectionSpec, document: &Document) -> Result<(), SyncError>;

    /// Insert-or-replace a batch. Not atomic; callers rely on per-document
    /// idempotence for safe replay after partial failure.
    async fn upsert_batch(
        &self,
        spec: &CollectionSpec,
        documents: &[Document],
    ) -> Result<(), SyncError>;

    /// Delete by id. Returns whether a document was actually removed.
    async fn delete(&self, spec: &CollectionSpec, id: &DocumentId) -> Result<bool, SyncError>;

    /// Fetch a single document by id.
    async fn get(
        &self,
        spec: &CollectionSpec,
        id: &DocumentId,
    ) -> Result<Option<Document>, SyncError>;

    /// Up to `limit` document ids, in id order. Used for deletion sampling.
    async fn list_ids(
        &self,
        spec: &CollectionSpec,
        limit: usize,
    ) -> Result<Vec<DocumentId>, SyncError>;

    /// Create an index if it does not already exist; an existing index with
    /// the same definition counts as success.
    async fn ensure_index(
        &self,
        spec: &CollectionSpec,
        index: &IndexSpec,
    ) -> Result<(), SyncError>;
}

/// MongoDB-backed target.
pub struct MongoTarget {
    client: Client,
}

impl MongoTarget {
    /// Connect to the target deployment.
    pub async fn connect(uri: &str) -> Result<Self, SyncError> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(classify_mongo_error)?;
        options.connect_timeout = Some(Duration::from_secs(10));
        options.server_selection_timeout = Some(Duration::from_secs(10));
        options.app_name = Some("mongo-mirror".to_string());

        let client = Client::with_options(options).map_err(classify_mongo_error)?;
        Ok(MongoTarget { client })
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
            .database(&spec.target_db)
            .collection(&spec.collection)
    }
}

#[async_trait]
impl TargetWriter for MongoTarget {
    async fn count(&self, spec: &CollectionSpec) -> Result<u64, SyncError> {
        self.collection(spec)
            .count_documents(doc! {})
            .await
            .map_err(classify_mongo_error)
    }

    async fn upsert(&self, spec: &CollectionSpec, document: &Document) -> Result<(), SyncError> {
        let filter = doc! { "_id": document_id_to_bson(&document.id) };
        self.collection(spec)
            .replace_one(filter, document_to_bson(document))
            .upsert(true)
            .await
            .map_err(classify_mongo_error)?;
        Ok(())
    }

    async fn upsert_batch(
        &self,
        spec: &CollectionSpec,
        documents: &[Document],
    ) -> Result<(), SyncError> {
        for document in documents {
            self.upsert(spec, document).await?;
        }
        Ok(())
    }

    async fn delete(&self, spec: &CollectionSpec, id: &DocumentId) -> Result<bool, SyncError> {
        let result = self
            .collection(spec)
            .delete_one(doc! { "_id": document_id_to_bson(id) })
            .await
            .map_err(classify_mongo_error)?;
        Ok(result.deleted_count > 0)
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

    async fn list_ids(
        &self,
        spec: &CollectionSpec,
        limit: usize,
    ) -> Result<Vec<DocumentId>, SyncError> {
        let collection = self.collection(spec);
        let mut action = collection
            .find(doc! {})
            .projection(doc! { "_id": 1 })
            .sort(doc! { "_id": 1 });
        if limit < usize::MAX {
            action = action.limit(limit as i64);
        }
        let mut cursor = action.await.map_err(classify_mongo_error)?;

        let mut ids = Vec::new();
        while cursor.advance().await.map_err(classify_mongo_error)? {
            let raw: bson::Document = cursor
                .deserialize_current()
                .map_err(classify_mongo_error)?;
            if let Some(id_bson) = raw.get("_id") {
                ids.push(crate::convert::document_id_from_bson(id_bson)?);
            }
        }
        Ok(ids)
    }

    async fn ensure_index(
        &self,
        spec: &CollectionSpec,
        index: &IndexSpec,
    ) -> Result<(), SyncError> {
        let mut keys = bson::Document::new();
        for (field, direction) in &index.keys {
            keys.insert(field.clone(), bson::Bson::Int32(*direction));
        }
        let options = IndexOptions::builder()
            .name(index.name.clone())
            .unique(Some(index.unique))
            .build();
        let model = IndexModel::builder().keys(keys).options(options).build();

        match self.collection(spec).create_index(model).await {
            Ok(_) => Ok(()),
            Err(err) if is_index_exists_error(&err) => {
                tracing::debug!(
                    collection = %spec.collection,
                    index = ?index.name,
                    "index already exists"
                );
                Ok(())
            }
            Err(err) => Err(classify_mongo_error(err)),
        }
    }
}
