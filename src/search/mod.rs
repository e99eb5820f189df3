//! Search store integration: idempotent indexing plus the thin query glue behind the HTTP API.

pub mod elastic;
pub mod memory;
pub mod types;

pub use elastic::ElasticsearchClient;
pub use memory::MemoryStore;
pub use types::{IndexResult, SearchHit, SearchStoreError};

use crate::ingest::{EMBEDDING_FIELD, IndexDocument};
use async_trait::async_trait;

/// Upper bound on hits fetched when a query has to touch every match.
pub const MAX_RESULT_WINDOW: usize = 10_000;

/// Write side of the search store.
///
/// `upsert` is a full replacement keyed by `doc_id`: applying the same document twice leaves the
/// store exactly as applying it once, which is what makes redelivered jobs harmless.
#[async_trait]
pub trait IndexingClient: Send + Sync {
    /// Create `collection` when missing, declaring a dense vector field when `vector_dims` is set.
    async fn ensure_collection(
        &self,
        collection: &str,
        vector_dims: Option<usize>,
    ) -> Result<(), SearchStoreError>;

    /// Insert or fully replace the document stored under `doc_id`.
    async fn upsert(&self, collection: &str, doc_id: &str, document: &IndexDocument)
    -> IndexResult;
}

/// Read/delete side of the search store used by the request handlers.
#[async_trait]
pub trait SearchQueries: Send + Sync {
    /// Whether `collection` exists.
    async fn collection_exists(&self, collection: &str) -> Result<bool, SearchStoreError>;

    /// Documents whose `field` exactly matches `value` (keyword term match).
    async fn term_search(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        size: usize,
    ) -> Result<Vec<SearchHit>, SearchStoreError>;

    /// Delete a single document; returns whether it existed.
    async fn delete_document(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> Result<bool, SearchStoreError>;

    /// Number of distinct keyword values held by `field`.
    async fn unique_count(&self, collection: &str, field: &str) -> Result<u64, SearchStoreError>;

    /// Nearest documents to `vector` by cosine similarity, highest first.
    async fn vector_search(
        &self,
        collection: &str,
        vector: &[f32],
        size: usize,
    ) -> Result<Vec<SearchHit>, SearchStoreError>;

    /// Delete every document whose `field` matches `value`; returns the deleted ids.
    async fn delete_by_term(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<String>, SearchStoreError> {
        let hits = self
            .term_search(collection, field, value, MAX_RESULT_WINDOW)
            .await?;
        let mut deleted = Vec::with_capacity(hits.len());
        for hit in hits {
            if self.delete_document(collection, &hit.id).await? {
                tracing::info!(collection, id = %hit.id, "Document deleted");
                deleted.push(hit.id);
            }
        }
        Ok(deleted)
    }
}

/// Remove the vector payload from hits before they are returned to callers.
pub fn strip_embeddings(hits: &mut [SearchHit]) {
    for hit in hits {
        hit.source.remove(EMBEDDING_FIELD);
    }
}
