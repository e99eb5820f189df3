//! HTTP client wrapper for interacting with Elasticsearch.

use super::types::{SearchHit, SearchResponse, SearchStoreError};
use super::{IndexResult, IndexingClient, SearchQueries, strip_embeddings};
use crate::config::Config;
use crate::ingest::{EMBEDDING_FIELD, IndexDocument};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::{Value, json};

/// Lightweight HTTP client for Elasticsearch document and query operations.
pub struct ElasticsearchClient {
    pub(crate) client: Client,
    pub(crate) base_url: Url,
    pub(crate) api_key: Option<String>,
    pub(crate) refresh: bool,
}

impl ElasticsearchClient {
    /// Construct a client from the service configuration.
    pub fn from_config(config: &Config) -> Result<Self, SearchStoreError> {
        let url = config
            .es_url
            .as_deref()
            .ok_or_else(|| SearchStoreError::InvalidUrl("ES_URL is not set".into()))?;
        Self::new(url, config.es_api_key.clone(), config.es_refresh)
    }

    /// Construct a client for `url`.
    pub fn new(
        url: &str,
        api_key: Option<String>,
        refresh: bool,
    ) -> Result<Self, SearchStoreError> {
        let client = Client::builder().user_agent("reelindex/0.1").build()?;
        let base_url = normalize_base_url(url).map_err(SearchStoreError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            has_api_key = api_key.as_deref().is_some_and(|value| !value.is_empty()),
            refresh,
            "Initialized Elasticsearch HTTP client"
        );

        Ok(Self {
            client,
            base_url,
            api_key,
            refresh,
        })
    }

    fn request(
        &self,
        method: Method,
        segments: &[&str],
    ) -> Result<reqwest::RequestBuilder, SearchStoreError> {
        let url = endpoint(&self.base_url, segments)?;
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("Authorization", format!("ApiKey {api_key}"));
        }
        Ok(req)
    }

    async fn ensure_success<F>(
        &self,
        response: reqwest::Response,
        on_success: F,
    ) -> Result<(), SearchStoreError>
    where
        F: FnOnce(),
    {
        if response.status().is_success() {
            on_success();
            Ok(())
        } else {
            let error = unexpected(response).await;
            tracing::error!(error = %error, "Elasticsearch request failed");
            Err(error)
        }
    }

    /// Store `body` as the source of document `doc_id`, creating the index on first write.
    pub(crate) async fn put_source(
        &self,
        index: &str,
        doc_id: &str,
        body: &Value,
    ) -> Result<(), SearchStoreError> {
        let response = self
            .request(Method::PUT, &[index, "_doc", doc_id])?
            .json(body)
            .send()
            .await?;
        self.ensure_success(response, || {
            tracing::trace!(index, doc_id, "Source stored");
        })
        .await
    }

    /// Fetch the source of document `doc_id`; `None` when the index or document is missing.
    pub(crate) async fn get_source(
        &self,
        index: &str,
        doc_id: &str,
    ) -> Result<Option<Value>, SearchStoreError> {
        let response = self
            .request(Method::GET, &[index, "_doc", doc_id])?
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                let mut body: Value = response.json().await?;
                Ok(body.get_mut("_source").map(Value::take))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => {
                let error = unexpected(response).await;
                tracing::error!(index, doc_id, error = %error, "Document lookup failed");
                Err(error)
            }
        }
    }

    async fn search(&self, collection: &str, body: Value) -> Result<SearchResponse, SearchStoreError> {
        let response = self
            .request(Method::POST, &[collection, "_search"])?
            .json(&body)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(SearchStoreError::CollectionNotFound(collection.into())),
            _ => {
                let error = unexpected(response).await;
                tracing::error!(collection, error = %error, "Elasticsearch search failed");
                Err(error)
            }
        }
    }
}

#[async_trait]
impl IndexingClient for ElasticsearchClient {
    async fn ensure_collection(
        &self,
        collection: &str,
        vector_dims: Option<usize>,
    ) -> Result<(), SearchStoreError> {
        if self.collection_exists(collection).await? {
            return Ok(());
        }

        let body = match vector_dims {
            Some(dims) => json!({
                "mappings": {
                    "properties": {
                        EMBEDDING_FIELD: {
                            "type": "dense_vector",
                            "dims": dims,
                            "index": true,
                            "similarity": "cosine"
                        }
                    }
                }
            }),
            None => json!({}),
        };

        tracing::debug!(collection, ?vector_dims, "Creating collection");
        let response = self
            .request(Method::PUT, &[collection])?
            .json(&body)
            .send()
            .await?;

        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            // Another worker created it between the existence check and the PUT.
            if body.contains("resource_already_exists_exception") {
                return Ok(());
            }
            let error = SearchStoreError::UnexpectedStatus {
                status: StatusCode::BAD_REQUEST,
                body,
            };
            tracing::error!(collection, error = %error, "Collection creation failed");
            return Err(error);
        }

        self.ensure_success(response, || {
            tracing::info!(collection, ?vector_dims, "Collection created");
        })
        .await
    }

    async fn upsert(
        &self,
        collection: &str,
        doc_id: &str,
        document: &IndexDocument,
    ) -> IndexResult {
        let source = document.to_json()?;
        let mut request = self
            .request(Method::PUT, &[collection, "_doc", doc_id])?
            .json(&source);
        if self.refresh {
            request = request.query(&[("refresh", "true")]);
        }
        let response = request.send().await?;

        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(collection, doc_id, body = %body, "Document rejected");
            return Err(SearchStoreError::Rejected(body));
        }

        self.ensure_success(response, || {
            tracing::debug!(collection, doc_id, "Document indexed");
        })
        .await
    }
}

#[async_trait]
impl SearchQueries for ElasticsearchClient {
    async fn collection_exists(&self, collection: &str) -> Result<bool, SearchStoreError> {
        let response = self.request(Method::HEAD, &[collection])?.send().await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let error = SearchStoreError::UnexpectedStatus {
                    status,
                    body: String::new(),
                };
                tracing::error!(collection, error = %error, "Collection existence check failed");
                Err(error)
            }
        }
    }

    async fn term_search(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        size: usize,
    ) -> Result<Vec<SearchHit>, SearchStoreError> {
        let body = json!({
            "size": size,
            "query": {
                "constant_score": {
                    "filter": { "term": { keyword_field(field): value } }
                }
            }
        });
        let response = self.search(collection, body).await?;
        Ok(response.hits.hits)
    }

    async fn delete_document(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> Result<bool, SearchStoreError> {
        let mut request = self.request(Method::DELETE, &[collection, "_doc", doc_id])?;
        if self.refresh {
            request = request.query(&[("refresh", "true")]);
        }
        let response = request.send().await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => {
                let error = unexpected(response).await;
                tracing::error!(collection, doc_id, error = %error, "Delete failed");
                Err(error)
            }
        }
    }

    async fn unique_count(&self, collection: &str, field: &str) -> Result<u64, SearchStoreError> {
        let body = json!({
            "size": 0,
            "aggs": {
                "type_count": { "cardinality": { "field": keyword_field(field) } }
            }
        });
        let response = self.search(collection, body).await?;
        Ok(response
            .aggregations
            .as_ref()
            .and_then(|aggs| aggs.pointer("/type_count/value"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    async fn vector_search(
        &self,
        collection: &str,
        vector: &[f32],
        size: usize,
    ) -> Result<Vec<SearchHit>, SearchStoreError> {
        let body = json!({
            "size": size,
            "query": {
                "script_score": {
                    "query": { "match_all": {} },
                    "script": {
                        "source": format!("cosineSimilarity(params.query_vector, '{EMBEDDING_FIELD}') + 1.0"),
                        "params": { "query_vector": vector }
                    }
                }
            }
        });
        let mut hits = self.search(collection, body).await?.hits.hits;
        strip_embeddings(&mut hits);
        Ok(hits)
    }
}

fn keyword_field(field: &str) -> String {
    format!("{field}.keyword")
}

async fn unexpected(response: reqwest::Response) -> SearchStoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    SearchStoreError::UnexpectedStatus { status, body }
}

fn normalize_base_url(url: &str) -> Result<Url, String> {
    let mut parsed = Url::parse(url).map_err(|err| err.to_string())?;
    if parsed.cannot_be_a_base() {
        return Err(format!("{url} cannot be used as a base URL"));
    }
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed)
}

fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, SearchStoreError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| SearchStoreError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
