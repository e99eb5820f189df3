//! HTTP surface for reelindex.
//!
//! This module exposes a compact Axum router:
//!
//! - `POST /insert`, `POST /insert_emb` – Enqueue a bulk ingestion job and return its `task_id`
//!   immediately (`202 Accepted`). The request body is the `collection -> [record]` payload; an
//!   empty body falls back to the configured source file.
//! - `GET /get_status/:task_id` – Two-valued status text (`Processing` | `Completed`).
//! - `GET /jobs/:task_id` – Detailed status with the raw broker state.
//! - `DELETE /delete` – Delete every document whose field exactly matches a value.
//! - `GET /stats` – Distinct genre, director, and actor counts of a collection.
//! - `GET /exact_search` – Exact keyword match on a field.
//! - `GET /vector_search` – Cosine similarity search over an embedding collection.
//! - `GET /metrics` – Ingestion counters.
//! - `GET /commands` – Machine-readable command catalog for quick discovery by tools/hosts.
//!
//! Handlers never expose error detail: failures are logged and mapped to a short message.

use crate::broker::{BrokerError, JobBroker};
use crate::embedding::{EmbedError, EmbeddingEngine};
use crate::ingest::{JobId, JobPayload, PayloadError, TaskKind};
use crate::metrics::{IngestMetrics, MetricsSnapshot};
use crate::search::{SearchHit, SearchQueries, SearchStoreError};
use crate::status::{JobStatusView, StatusStore};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

const MISSING_FILE: &str = "Missing File.";
const INDEX_NOT_FOUND: &str = "Index Not Found.";
const DEFAULT_EXACT_SEARCH_SIZE: usize = 10;

/// Shared services behind the HTTP handlers.
pub struct AppState {
    broker: Arc<dyn JobBroker>,
    status: StatusStore,
    search: Arc<dyn SearchQueries>,
    engine: Arc<EmbeddingEngine>,
    metrics: Arc<IngestMetrics>,
    source_file: PathBuf,
}

impl AppState {
    /// Bundle the services used by the router.
    pub fn new(
        broker: Arc<dyn JobBroker>,
        search: Arc<dyn SearchQueries>,
        engine: Arc<EmbeddingEngine>,
        metrics: Arc<IngestMetrics>,
        source_file: PathBuf,
    ) -> Self {
        Self {
            status: StatusStore::new(broker.clone()),
            broker,
            search,
            engine,
            metrics,
            source_file,
        }
    }
}

/// Build the HTTP router exposing the ingestion API surface.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/insert", post(insert))
        .route("/insert_emb", post(insert_emb))
        .route("/get_status/:task_id", get(get_status))
        .route("/jobs/:task_id", get(get_job))
        .route("/delete", delete(delete_records))
        .route("/stats", get(get_stats))
        .route("/exact_search", get(exact_search))
        .route("/vector_search", get(vector_search))
        .route("/metrics", get(get_metrics))
        .route("/commands", get(get_commands))
        .with_state(state)
}

/// Success response for the submission endpoints.
#[derive(Serialize)]
struct SubmitResponse {
    task_id: JobId,
}

async fn insert(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    submit(&state, TaskKind::Insert, &body).await
}

async fn insert_emb(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    submit(&state, TaskKind::InsertWithEmbedding, &body).await
}

/// Enqueue a job; returns as soon as the broker holds it.
async fn submit(
    state: &AppState,
    task_kind: TaskKind,
    body: &[u8],
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let payload = load_payload(&state.source_file, body).await?;
    tracing::info!(
        task_kind = task_kind.as_str(),
        records = payload.record_count(),
        "Received payload; submitting job"
    );
    let task_id = state.broker.submit(task_kind, payload).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { task_id })))
}

async fn load_payload(source_file: &FsPath, body: &[u8]) -> Result<JobPayload, AppError> {
    let value: serde_json::Value = if body.iter().all(u8::is_ascii_whitespace) {
        let contents = match tokio::fs::read(source_file).await {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!(path = %source_file.display(), error = %err, "Source file unavailable");
                return Err(AppError::NotFound(MISSING_FILE.into()));
            }
        };
        serde_json::from_slice(&contents).map_err(|err| AppError::BadRequest(err.to_string()))?
    } else {
        serde_json::from_slice(body).map_err(|err| AppError::BadRequest(err.to_string()))?
    };

    if value.is_null() {
        return Err(AppError::NotFound(MISSING_FILE.into()));
    }
    JobPayload::from_json(value).map_err(|err| match err {
        PayloadError::Empty => AppError::NotFound(MISSING_FILE.into()),
        other => AppError::BadRequest(other.to_string()),
    })
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<&'static str, AppError> {
    let task_id = JobId::from(task_id);
    let status = state.status.coarse(&task_id).await?;
    tracing::info!(task_id = %task_id, status, "Fetched task status");
    Ok(status)
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<JobStatusView>, AppError> {
    Ok(Json(state.status.detailed(&JobId::from(task_id)).await?))
}

/// Query string shared by the field-matching endpoints.
#[derive(Deserialize)]
struct FieldQuery {
    index: Option<String>,
    field: Option<String>,
    value: Option<String>,
    size: Option<usize>,
}

impl FieldQuery {
    fn parts(&self) -> Result<(&str, &str, &str), AppError> {
        Ok((
            required(&self.index, INDEX_NOT_FOUND)?,
            required(&self.field, "Field Not Found.")?,
            required(&self.value, "Value Not Found.")?,
        ))
    }
}

fn required<'a>(value: &'a Option<String>, missing: &str) -> Result<&'a str, AppError> {
    value
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::NotFound(missing.into()))
}

async fn ensure_index(search: &dyn SearchQueries, index: &str) -> Result<(), AppError> {
    if search.collection_exists(index).await? {
        Ok(())
    } else {
        Err(AppError::NotFound(INDEX_NOT_FOUND.into()))
    }
}

async fn delete_records(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FieldQuery>,
) -> Result<&'static str, AppError> {
    let (index, field, value) = query.parts()?;
    ensure_index(state.search.as_ref(), index).await?;

    let deleted = state.search.delete_by_term(index, field, value).await?;
    if deleted.is_empty() {
        return Err(AppError::NotFound("Record not found".into()));
    }
    tracing::info!(index, field, deleted = deleted.len(), "Records deleted");
    Ok("Records Deleted.")
}

#[derive(Deserialize)]
struct IndexQuery {
    index: Option<String>,
}

/// Response body for `GET /stats`.
#[derive(Debug, Serialize)]
struct StatsResponse {
    #[serde(rename = "Unique Genre Count")]
    genres: u64,
    #[serde(rename = "Unique Director Count")]
    directors: u64,
    #[serde(rename = "Unique Actor Count")]
    actors: u64,
}

async fn get_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IndexQuery>,
) -> Result<Json<StatsResponse>, AppError> {
    let index = required(&query.index, INDEX_NOT_FOUND)?;
    ensure_index(state.search.as_ref(), index).await?;

    let response = StatsResponse {
        genres: state.search.unique_count(index, "genres").await?,
        directors: state.search.unique_count(index, "director").await?,
        actors: state.search.unique_count(index, "actors").await?,
    };
    tracing::info!(index, ?response, "Computed stats");
    Ok(Json(response))
}

async fn exact_search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FieldQuery>,
) -> Result<Json<Vec<SearchHit>>, AppError> {
    let (index, field, value) = query.parts()?;
    ensure_index(state.search.as_ref(), index).await?;
    let size = query.size.unwrap_or(DEFAULT_EXACT_SEARCH_SIZE);
    Ok(Json(state.search.term_search(index, field, value, size).await?))
}

#[derive(Deserialize)]
struct VectorQuery {
    index: Option<String>,
    query: Option<String>,
    size: Option<String>,
}

async fn vector_search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<VectorQuery>,
) -> Result<Json<Vec<SearchHit>>, AppError> {
    let index = required(&params.index, INDEX_NOT_FOUND)?;
    let text = required(&params.query, "Query Not Found.")?;
    let size: usize = required(&params.size, "Size not Found.")?
        .parse()
        .map_err(|_| AppError::NotFound("Size not Found.".into()))?;
    ensure_index(state.search.as_ref(), index).await?;

    let vector = state.engine.embed_query(text).await?;
    let hits = state.search.vector_search(index, &vector, size).await?;
    tracing::info!(index, size, hits = hits.len(), "Vector search completed");
    Ok(Json(hits))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Descriptor for a single command in the discovery catalog.
#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

/// Response body for `GET /commands`.
#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

/// Enumerate supported HTTP commands for discovery/UX in hosts and tools.
async fn get_commands() -> Json<CommandsResponse> {
    let payload_example = json!({
        "movies": [{"id": "1", "title": "Inception", "actors": "Leonardo DiCaprio, Elliot Page"}]
    });
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "insert",
                method: "POST",
                path: "/insert",
                description: "Enqueue a job that normalizes and indexes every record into its collection. Returns { \"task_id\": string } with 202.",
                request_example: Some(payload_example.clone()),
            },
            CommandDescriptor {
                name: "insert_emb",
                method: "POST",
                path: "/insert_emb",
                description: "Enqueue a job that also embeds each record and indexes it into <collection>_emb.",
                request_example: Some(payload_example),
            },
            CommandDescriptor {
                name: "get_status",
                method: "GET",
                path: "/get_status/:task_id",
                description: "Return \"Completed\" once the job succeeded, \"Processing\" otherwise.",
                request_example: None,
            },
            CommandDescriptor {
                name: "job",
                method: "GET",
                path: "/jobs/:task_id",
                description: "Return the raw broker state and a Processing/Completed/Failed status.",
                request_example: None,
            },
            CommandDescriptor {
                name: "delete",
                method: "DELETE",
                path: "/delete?index=&field=&value=",
                description: "Delete every document whose field exactly matches the value.",
                request_example: None,
            },
            CommandDescriptor {
                name: "stats",
                method: "GET",
                path: "/stats?index=",
                description: "Count distinct genres, directors, and actors in a collection.",
                request_example: None,
            },
            CommandDescriptor {
                name: "exact_search",
                method: "GET",
                path: "/exact_search?index=&field=&value=",
                description: "Return documents whose field exactly matches the value.",
                request_example: None,
            },
            CommandDescriptor {
                name: "vector_search",
                method: "GET",
                path: "/vector_search?index=&query=&size=",
                description: "Embed the query and return the nearest documents without their vectors.",
                request_example: None,
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Return ingestion counters useful for observability dashboards.",
                request_example: None,
            },
            CommandDescriptor {
                name: "commands",
                method: "GET",
                path: "/commands",
                description: "Return this catalog.",
                request_example: None,
            },
        ],
    })
}

enum AppError {
    NotFound(String),
    BadRequest(String),
    Internal,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message).into_response(),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            Self::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}

impl From<BrokerError> for AppError {
    fn from(err: BrokerError) -> Self {
        tracing::error!(error = %err, "Job broker request failed");
        Self::Internal
    }
}

impl From<SearchStoreError> for AppError {
    fn from(err: SearchStoreError) -> Self {
        match err {
            SearchStoreError::CollectionNotFound(_) => Self::NotFound(INDEX_NOT_FOUND.into()),
            other => {
                tracing::error!(error = %other, "Search store request failed");
                Self::Internal
            }
        }
    }
}

impl From<EmbedError> for AppError {
    fn from(err: EmbedError) -> Self {
        tracing::error!(error = %err, "Query embedding failed");
        Self::Internal
    }
}
