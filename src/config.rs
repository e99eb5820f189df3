use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the ingestion service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend used to persist indexed documents.
    pub search_store: SearchStoreKind,
    /// Base URL of the Elasticsearch cluster.
    pub es_url: Option<String>,
    /// Optional API key sent as `Authorization: ApiKey <key>`.
    pub es_api_key: Option<String>,
    /// Ask Elasticsearch to refresh the index after each write.
    pub es_refresh: bool,
    /// AMQP URI of the status channel broker; in-process channel when absent.
    pub status_channel_url: Option<String>,
    /// Queue name carrying status events.
    pub status_queue: String,
    /// Job broker implementation.
    pub job_broker: JobBrokerKind,
    /// AMQP URI of the job broker.
    pub job_broker_url: String,
    /// Durable queue carrying job messages.
    pub job_queue: String,
    /// Elasticsearch index holding job results.
    pub job_results_index: String,
    /// How long settled job results are kept before they read as pending again.
    pub job_result_ttl: Duration,
    /// Embedding provider used for the `insert_emb` task kind and vector search.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Directory holding the ONNX model and its `tokenizer.json`.
    pub embedding_model_dir: Option<PathBuf>,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Token budget applied to the serialized record before encoding.
    pub embedding_max_tokens: usize,
    /// Intra-op threads of the local model and concurrent inference calls across workers.
    pub embedding_threads: usize,
    /// Base URL of a local Ollama runtime.
    pub ollama_url: Option<String>,
    /// API key for the hosted OpenAI embeddings API.
    pub openai_api_key: Option<String>,
    /// Base URL for OpenAI-compatible endpoints.
    pub openai_base_url: String,
    /// Number of workers consuming the job queue.
    pub worker_count: usize,
    /// How long a claimed job may stay unacknowledged before redelivery.
    pub job_visibility_timeout: Duration,
    /// Payload file used when a submission request carries no body.
    pub ingest_source_file: PathBuf,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supported search store backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchStoreKind {
    /// Remote Elasticsearch cluster over HTTP.
    Elasticsearch,
    /// Process-local store, useful for development and tests.
    Memory,
}

/// Supported job broker backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobBrokerKind {
    /// Durable AMQP queue.
    Amqp,
    /// In-process queue; jobs are lost on restart.
    Memory,
}

/// Supported embedding backends for the processing pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingProvider {
    /// In-process ONNX Runtime session.
    Onnx,
    /// Deterministic local feature-hashing encoder.
    Hash,
    /// Local Ollama runtime.
    Ollama,
    /// Hosted OpenAI embeddings API.
    OpenAI,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let search_store = match optional("SEARCH_STORE") {
            Some(value) => value
                .parse()
                .map_err(|()| ConfigError::InvalidValue("SEARCH_STORE".into()))?,
            None => SearchStoreKind::Elasticsearch,
        };
        let es_url = optional("ES_URL");
        if search_store == SearchStoreKind::Elasticsearch && es_url.is_none() {
            return Err(ConfigError::MissingVariable("ES_URL".into()));
        }

        let embedding_provider = match optional("EMBEDDING_PROVIDER") {
            Some(value) => value
                .parse()
                .map_err(|()| ConfigError::InvalidValue("EMBEDDING_PROVIDER".into()))?,
            None => EmbeddingProvider::Onnx,
        };
        let job_broker = match optional("JOB_BROKER") {
            Some(value) => value
                .parse()
                .map_err(|()| ConfigError::InvalidValue("JOB_BROKER".into()))?,
            None => JobBrokerKind::Amqp,
        };

        let config = Self {
            search_store,
            es_url,
            es_api_key: optional("ES_API_KEY"),
            es_refresh: parse_or(&optional, "ES_REFRESH", false)?,
            status_channel_url: optional("STATUS_CHANNEL_URL"),
            status_queue: optional("STATUS_QUEUE").unwrap_or_else(|| "task-queue".into()),
            job_broker,
            job_broker_url: optional("JOB_BROKER_URL")
                .unwrap_or_else(|| "amqp://127.0.0.1:5672/%2f".into()),
            job_queue: optional("JOB_QUEUE").unwrap_or_else(|| "ingest-jobs".into()),
            job_results_index: optional("JOB_RESULTS_INDEX")
                .unwrap_or_else(|| "job-results".into()),
            job_result_ttl: Duration::from_millis(parse_or(
                &optional,
                "JOB_RESULT_TTL_MS",
                86_400_000,
            )?),
            embedding_provider,
            embedding_model: optional("EMBEDDING_MODEL").unwrap_or_else(|| "BAAI/bge-m3".into()),
            embedding_model_dir: optional("EMBEDDING_MODEL_DIR").map(PathBuf::from),
            embedding_dimension: parse_or(&optional, "EMBEDDING_DIMENSION", 1024)?,
            embedding_max_tokens: parse_or(&optional, "EMBEDDING_MAX_TOKENS", 512)?,
            embedding_threads: parse_or(&optional, "EMBEDDING_THREADS", 1)?,
            ollama_url: optional("OLLAMA_URL"),
            openai_api_key: optional("OPENAI_API_KEY"),
            openai_base_url: optional("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".into()),
            worker_count: parse_or(&optional, "WORKER_COUNT", 2)?,
            job_visibility_timeout: Duration::from_millis(parse_or(
                &optional,
                "JOB_VISIBILITY_TIMEOUT_MS",
                300_000,
            )?),
            ingest_source_file: optional("INGEST_SOURCE_FILE")
                .unwrap_or_else(|| "Movies_DB.json".into())
                .into(),
            server_port: optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        };

        for (key, value) in [
            ("EMBEDDING_DIMENSION", config.embedding_dimension),
            ("EMBEDDING_MAX_TOKENS", config.embedding_max_tokens),
            ("EMBEDDING_THREADS", config.embedding_threads),
            ("WORKER_COUNT", config.worker_count),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(key.into()));
            }
        }

        match config.embedding_provider {
            EmbeddingProvider::OpenAI if config.openai_api_key.is_none() => {
                return Err(ConfigError::MissingVariable("OPENAI_API_KEY".into()));
            }
            EmbeddingProvider::Ollama if config.ollama_url.is_none() => {
                return Err(ConfigError::MissingVariable("OLLAMA_URL".into()));
            }
            EmbeddingProvider::Onnx if config.embedding_model_dir.is_none() => {
                return Err(ConfigError::MissingVariable("EMBEDDING_MODEL_DIR".into()));
            }
            _ => {}
        }

        tracing::debug!(
            search_store = ?config.search_store,
            status_channel = config.status_channel_url.is_some(),
            job_broker = ?config.job_broker,
            embedding_provider = ?config.embedding_provider,
            workers = config.worker_count,
            server_port = ?config.server_port,
            "Loaded configuration"
        );

        Ok(config)
    }
}

fn parse_or<F, T>(optional: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match optional(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "onnx" => Ok(Self::Onnx),
            "hash" => Ok(Self::Hash),
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            _ => Err(()),
        }
    }
}

impl std::str::FromStr for JobBrokerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "amqp" | "rabbitmq" => Ok(Self::Amqp),
            "memory" => Ok(Self::Memory),
            _ => Err(()),
        }
    }
}

impl std::str::FromStr for SearchStoreKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "elasticsearch" | "es" => Ok(Self::Elasticsearch),
            "memory" => Ok(Self::Memory),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_for_memory_store() {
        let config = Config::from_lookup(lookup(&[
            ("SEARCH_STORE", "memory"),
            ("EMBEDDING_MODEL_DIR", "models/bge-m3"),
        ]))
        .expect("config");
        assert_eq!(config.search_store, SearchStoreKind::Memory);
        assert_eq!(config.status_queue, "task-queue");
        assert_eq!(config.job_broker, JobBrokerKind::Amqp);
        assert_eq!(config.job_broker_url, "amqp://127.0.0.1:5672/%2f");
        assert_eq!(config.job_queue, "ingest-jobs");
        assert_eq!(config.job_results_index, "job-results");
        assert_eq!(config.job_result_ttl, Duration::from_secs(86_400));
        assert_eq!(config.embedding_provider, EmbeddingProvider::Onnx);
        assert_eq!(
            config.embedding_model_dir,
            Some(PathBuf::from("models/bge-m3"))
        );
        assert_eq!(config.embedding_dimension, 1024);
        assert_eq!(config.embedding_max_tokens, 512);
        assert_eq!(config.embedding_threads, 1);
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.job_visibility_timeout, Duration::from_secs(300));
        assert_eq!(config.ingest_source_file, PathBuf::from("Movies_DB.json"));
    }

    #[test]
    fn elasticsearch_requires_url() {
        let err = Config::from_lookup(lookup(&[])).expect_err("missing ES_URL");
        assert!(matches!(err, ConfigError::MissingVariable(key) if key == "ES_URL"));
    }

    #[test]
    fn rejects_zero_dimension_and_bad_numbers() {
        let err = Config::from_lookup(lookup(&[
            ("SEARCH_STORE", "memory"),
            ("EMBEDDING_DIMENSION", "0"),
        ]))
        .expect_err("zero dimension");
        assert!(matches!(err, ConfigError::InvalidValue(key) if key == "EMBEDDING_DIMENSION"));

        let err = Config::from_lookup(lookup(&[
            ("SEARCH_STORE", "memory"),
            ("WORKER_COUNT", "many"),
        ]))
        .expect_err("non-numeric worker count");
        assert!(matches!(err, ConfigError::InvalidValue(key) if key == "WORKER_COUNT"));
    }

    #[test]
    fn openai_provider_requires_key() {
        let err = Config::from_lookup(lookup(&[
            ("SEARCH_STORE", "memory"),
            ("EMBEDDING_PROVIDER", "OpenAI"),
        ]))
        .expect_err("missing key");
        assert!(matches!(err, ConfigError::MissingVariable(key) if key == "OPENAI_API_KEY"));
    }

    #[test]
    fn onnx_provider_requires_model_dir() {
        let err = Config::from_lookup(lookup(&[("SEARCH_STORE", "memory")]))
            .expect_err("missing model dir");
        assert!(matches!(err, ConfigError::MissingVariable(key) if key == "EMBEDDING_MODEL_DIR"));
    }

    #[test]
    fn memory_broker_must_be_selected_explicitly() {
        let config = Config::from_lookup(lookup(&[
            ("SEARCH_STORE", "memory"),
            ("EMBEDDING_PROVIDER", "hash"),
            ("JOB_BROKER", "Memory"),
            ("JOB_RESULT_TTL_MS", "1500"),
        ]))
        .expect("config");
        assert_eq!(config.job_broker, JobBrokerKind::Memory);
        assert_eq!(config.job_result_ttl, Duration::from_millis(1500));

        let err = Config::from_lookup(lookup(&[
            ("SEARCH_STORE", "memory"),
            ("EMBEDDING_PROVIDER", "hash"),
            ("JOB_BROKER", "kafka"),
        ]))
        .expect_err("unknown broker");
        assert!(matches!(err, ConfigError::InvalidValue(key) if key == "JOB_BROKER"));
    }

    #[test]
    fn blank_values_are_treated_as_absent() {
        let config = Config::from_lookup(lookup(&[
            ("SEARCH_STORE", "memory"),
            ("EMBEDDING_PROVIDER", "hash"),
            ("STATUS_CHANNEL_URL", "   "),
        ]))
        .expect("config");
        assert!(config.status_channel_url.is_none());
    }
}
