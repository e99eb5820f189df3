//! HTTP embedding providers (Ollama and OpenAI-compatible endpoints).

use super::{EmbeddingClient, EmbeddingClientError};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Embedding client for a local Ollama runtime (`POST /api/embed`).
pub struct OllamaEmbeddingClient {
    client: Client,
    endpoint: String,
    model: String,
}

impl OllamaEmbeddingClient {
    /// Build a client targeting `base_url`.
    pub fn new(base_url: &str, model: &str) -> Result<Self, EmbeddingClientError> {
        let client = Client::builder()
            .user_agent("reelindex/0.1")
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/embed", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingClient for OllamaEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        tracing::debug!(model = %self.model, inputs = texts.len(), "Requesting Ollama embeddings");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&OllamaRequest {
                model: &self.model,
                input: &texts,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingClientError::UnexpectedStatus { status, body });
        }

        let parsed: OllamaResponse = response.json().await?;
        ensure_count(parsed.embeddings.len(), texts.len())?;
        Ok(parsed.embeddings)
    }
}

/// Embedding client for OpenAI-compatible `POST /embeddings` endpoints.
pub struct OpenAiEmbeddingClient {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
}

impl OpenAiEmbeddingClient {
    /// Build a client authenticated with `api_key`.
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        dimensions: Option<usize>,
    ) -> Result<Self, EmbeddingClientError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim())).map_err(|_| {
            EmbeddingClientError::GenerationFailed("invalid OpenAI API key".to_string())
        })?;
        headers.insert(AUTHORIZATION, auth);
        let client = Client::builder()
            .user_agent("reelindex/0.1")
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            dimensions,
        })
    }
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        tracing::debug!(model = %self.model, inputs = texts.len(), "Requesting OpenAI embeddings");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&OpenAiRequest {
                model: &self.model,
                input: &texts,
                dimensions: self.dimensions,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingClientError::UnexpectedStatus { status, body });
        }

        let mut parsed: OpenAiResponse = response.json().await?;
        parsed.data.sort_by_key(|entry| entry.index);
        ensure_count(parsed.data.len(), texts.len())?;
        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

fn ensure_count(returned: usize, requested: usize) -> Result<(), EmbeddingClientError> {
    if returned == requested {
        Ok(())
    } else {
        Err(EmbeddingClientError::GenerationFailed(format!(
            "provider returned {returned} embeddings for {requested} inputs"
        )))
    }
}
