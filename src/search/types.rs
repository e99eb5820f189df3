//! Shared types used by the search store clients.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors returned while interacting with the search store.
#[derive(Debug, Error)]
pub enum SearchStoreError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid search store URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The store responded with an unexpected status code.
    #[error("Unexpected search store response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the store.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// The target collection does not exist.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),
    /// The store rejected or could not hold the document.
    #[error("Document rejected: {0}")]
    Rejected(String),
    /// The document could not be serialized into its stored shape.
    #[error("Document serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of the indexing stage for a single record.
pub type IndexResult = Result<(), SearchStoreError>;

/// Single search result in the store's native hit shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Document key.
    #[serde(rename = "_id")]
    pub id: String,
    /// Relevance score, when the query computes one.
    #[serde(rename = "_score", default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    /// Stored document.
    #[serde(rename = "_source", default)]
    pub source: Map<String, Value>,
}

#[derive(Deserialize)]
pub(crate) struct SearchResponse {
    pub(crate) hits: HitsEnvelope,
    #[serde(default)]
    pub(crate) aggregations: Option<Value>,
}

#[derive(Deserialize)]
pub(crate) struct HitsEnvelope {
    #[serde(default)]
    pub(crate) hits: Vec<SearchHit>,
}
