//! Embedding engine: field selection, token budgeting, and provider clients.

mod budget;
mod hash;
mod onnx;
mod remote;
pub mod selection;

pub use budget::TokenBudget;
pub use hash::HashEmbeddingClient;
pub use onnx::OnnxEmbeddingClient;
pub use remote::{OllamaEmbeddingClient, OpenAiEmbeddingClient};
pub use selection::{PreparedText, is_url, prepare_text};

use crate::config::{Config, EmbeddingProvider};
use crate::ingest::Record;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Dense vector produced for a record or query.
pub type EmbeddingVector = Vec<f32>;

/// Outcome of the embedding stage for a single record.
pub type EmbedResult = Result<EmbeddingVector, EmbedError>;

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingClientError {
    /// Provider was unable to produce embeddings for the supplied input.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
    /// A local model could not be found or loaded.
    #[error("Embedding model unavailable: {0}")]
    ModelUnavailable(String),
    /// HTTP layer failed before receiving a response.
    #[error("Embedding request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Provider responded with an unexpected status code.
    #[error("Unexpected embedding provider response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the provider.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient {
    /// Produce an embedding vector for each supplied text.
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError>;
}

/// Errors surfaced by [`EmbeddingEngine`].
#[derive(Debug, Error)]
pub enum EmbedError {
    /// The provider failed.
    #[error(transparent)]
    Client(#[from] EmbeddingClientError),
    /// Returned embedding dimension does not match configuration.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Dimension produced by the provider.
        actual: usize,
    },
    /// Provider returned no vectors.
    #[error("Embedding provider returned no vectors")]
    EmptyEmbedding,
    /// The engine was shut down while waiting for an inference slot.
    #[error("Embedding engine is closed")]
    Closed,
}

/// Build an embedding client suitable for the current configuration.
pub fn build_embedding_client(
    config: &Config,
) -> Result<Arc<dyn EmbeddingClient + Send + Sync>, EmbeddingClientError> {
    let missing = |key: &str| EmbeddingClientError::GenerationFailed(format!("{key} is not set"));
    let client: Arc<dyn EmbeddingClient + Send + Sync> = match config.embedding_provider {
        EmbeddingProvider::Onnx => {
            let model_dir = config
                .embedding_model_dir
                .as_deref()
                .ok_or_else(|| missing("EMBEDDING_MODEL_DIR"))?;
            Arc::new(OnnxEmbeddingClient::load(
                model_dir,
                &config.embedding_model,
                config.embedding_threads,
                config.embedding_max_tokens,
            )?)
        }
        EmbeddingProvider::Hash => Arc::new(HashEmbeddingClient::new(config.embedding_dimension)),
        EmbeddingProvider::Ollama => {
            let url = config.ollama_url.as_deref().ok_or_else(|| missing("OLLAMA_URL"))?;
            Arc::new(OllamaEmbeddingClient::new(url, &config.embedding_model)?)
        }
        EmbeddingProvider::OpenAI => {
            let key = config
                .openai_api_key
                .as_deref()
                .ok_or_else(|| missing("OPENAI_API_KEY"))?;
            Arc::new(OpenAiEmbeddingClient::new(
                key,
                &config.openai_base_url,
                &config.embedding_model,
                Some(config.embedding_dimension),
            )?)
        }
    };
    Ok(client)
}

/// Turns records into fixed-length vectors.
///
/// One engine is shared read-only by every worker. Inference calls are bounded by a semaphore
/// sized from `EMBEDDING_THREADS`, so the pool never oversubscribes the provider regardless of
/// how many workers run. The local ONNX provider additionally uses the same value as its
/// intra-op thread count.
pub struct EmbeddingEngine {
    client: Arc<dyn EmbeddingClient + Send + Sync>,
    budget: TokenBudget,
    dimension: usize,
    permits: Semaphore,
}

impl EmbeddingEngine {
    /// Assemble an engine from its parts.
    pub fn new(
        client: Arc<dyn EmbeddingClient + Send + Sync>,
        budget: TokenBudget,
        dimension: usize,
        parallelism: usize,
    ) -> Self {
        Self {
            client,
            budget,
            dimension,
            permits: Semaphore::new(parallelism.max(1)),
        }
    }

    /// Build the engine described by the configuration.
    pub fn from_config(config: &Config) -> Result<Self, EmbeddingClientError> {
        let client = build_embedding_client(config)?;
        let budget = TokenBudget::for_model(&config.embedding_model, config.embedding_max_tokens);
        tracing::info!(
            provider = ?config.embedding_provider,
            model = %config.embedding_model,
            dimension = config.embedding_dimension,
            max_tokens = config.embedding_max_tokens,
            threads = config.embedding_threads,
            "Embedding engine initialized"
        );
        Ok(Self::new(
            client,
            budget,
            config.embedding_dimension,
            config.embedding_threads,
        ))
    }

    /// Configured vector length.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed the selected fields of `record`.
    pub async fn embed(&self, record: &Record) -> EmbedResult {
        let PreparedText { text, excluded } = prepare_text(record);
        tracing::info!(excluded = ?excluded, "Skipping these fields during embedding");
        self.encode(text).await
    }

    /// Embed free-form query text under the same token budget.
    pub async fn embed_query(&self, query: &str) -> EmbedResult {
        self.encode(query.to_string()).await
    }

    async fn encode(&self, text: String) -> EmbedResult {
        let input = self.budget.truncate(&text).into_owned();
        let _permit = self.permits.acquire().await.map_err(|_| EmbedError::Closed)?;
        let mut vectors = self.client.generate_embeddings(vec![input]).await?;
        let vector = vectors.pop().ok_or(EmbedError::EmptyEmbedding)?;

        if vector.len() != self.dimension {
            return Err(EmbedError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }
}
