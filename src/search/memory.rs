//! Process-local search store used for development runs and tests.

use super::types::{SearchHit, SearchStoreError};
use super::{IndexResult, IndexingClient, SearchQueries, strip_embeddings};
use crate::ingest::{EMBEDDING_FIELD, IndexDocument};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;

type Collection = BTreeMap<String, Map<String, Value>>;

/// In-memory document store with the same upsert and query semantics as the HTTP backend.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a stored document.
    pub async fn document(&self, collection: &str, doc_id: &str) -> Option<Map<String, Value>> {
        let guard = self.collections.read().await;
        guard.get(collection)?.get(doc_id).cloned()
    }

    /// Number of documents held by `collection`.
    pub async fn count(&self, collection: &str) -> usize {
        let guard = self.collections.read().await;
        guard.get(collection).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl IndexingClient for MemoryStore {
    async fn ensure_collection(
        &self,
        collection: &str,
        _vector_dims: Option<usize>,
    ) -> Result<(), SearchStoreError> {
        let mut guard = self.collections.write().await;
        guard.entry(collection.to_string()).or_default();
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        doc_id: &str,
        document: &IndexDocument,
    ) -> IndexResult {
        let source = document.to_json()?;
        let mut guard = self.collections.write().await;
        guard
            .entry(collection.to_string())
            .or_default()
            .insert(doc_id.to_string(), source);
        Ok(())
    }
}

#[async_trait]
impl SearchQueries for MemoryStore {
    async fn collection_exists(&self, collection: &str) -> Result<bool, SearchStoreError> {
        Ok(self.collections.read().await.contains_key(collection))
    }

    async fn term_search(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        size: usize,
    ) -> Result<Vec<SearchHit>, SearchStoreError> {
        let guard = self.collections.read().await;
        let docs = guard
            .get(collection)
            .ok_or_else(|| SearchStoreError::CollectionNotFound(collection.into()))?;
        Ok(docs
            .iter()
            .filter(|(_, source)| keywords(source.get(field)).iter().any(|kw| kw == value))
            .take(size)
            .map(|(id, source)| SearchHit {
                id: id.clone(),
                score: Some(1.0),
                source: source.clone(),
            })
            .collect())
    }

    async fn delete_document(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> Result<bool, SearchStoreError> {
        let mut guard = self.collections.write().await;
        Ok(guard
            .get_mut(collection)
            .is_some_and(|docs| docs.remove(doc_id).is_some()))
    }

    async fn unique_count(&self, collection: &str, field: &str) -> Result<u64, SearchStoreError> {
        let guard = self.collections.read().await;
        let docs = guard
            .get(collection)
            .ok_or_else(|| SearchStoreError::CollectionNotFound(collection.into()))?;
        let distinct: BTreeSet<String> = docs
            .values()
            .flat_map(|source| keywords(source.get(field)))
            .collect();
        Ok(distinct.len() as u64)
    }

    async fn vector_search(
        &self,
        collection: &str,
        vector: &[f32],
        size: usize,
    ) -> Result<Vec<SearchHit>, SearchStoreError> {
        let guard = self.collections.read().await;
        let docs = guard
            .get(collection)
            .ok_or_else(|| SearchStoreError::CollectionNotFound(collection.into()))?;

        let mut scored: Vec<SearchHit> = docs
            .iter()
            .filter_map(|(id, source)| {
                let stored = as_vector(source.get(EMBEDDING_FIELD)?)?;
                let score = cosine_similarity(vector, &stored)? + 1.0;
                Some(SearchHit {
                    id: id.clone(),
                    score: Some(score),
                    source: source.clone(),
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.unwrap_or(0.0).total_cmp(&a.score.unwrap_or(0.0)));
        scored.truncate(size);
        strip_embeddings(&mut scored);
        Ok(scored)
    }
}

fn keywords(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(text)) => vec![text.clone()],
        Some(Value::Number(number)) => vec![number.to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn as_vector(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|item| item.as_f64().map(|f| f as f32))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a * norm_b))
}
