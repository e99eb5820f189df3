use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use httpmock::{Method::HEAD, Method::PUT, MockServer};
use regex::Regex;
use reelindex::api::{AppState, create_router};
use reelindex::broker::{JobBroker, JobState, MemoryBroker};
use reelindex::embedding::{EmbeddingEngine, HashEmbeddingClient, TokenBudget};
use reelindex::ingest::{
    IndexDocument, Job, JobId, JobPayload, JobProcessor, JobReport, RunningPool, TaskKind,
    WorkerPool,
};
use reelindex::metrics::IngestMetrics;
use reelindex::search::{
    ElasticsearchClient, IndexResult, IndexingClient, MemoryStore, SearchStoreError,
};
use reelindex::status::{MemoryStatusChannel, TaskStatus};
use serde_json::json;
use tower::ServiceExt;

const DIMENSION: usize = 16;

/// Indexing client that records every attempted document and rejects selected ids.
struct FlakyStore {
    inner: MemoryStore,
    reject: Vec<String>,
    attempts: Mutex<Vec<String>>,
}

impl FlakyStore {
    fn rejecting(ids: &[&str]) -> Self {
        Self {
            inner: MemoryStore::new(),
            reject: ids.iter().map(|id| id.to_string()).collect(),
            attempts: Mutex::new(Vec::new()),
        }
    }

    fn attempts(&self) -> Vec<String> {
        self.attempts.lock().expect("attempts lock").clone()
    }
}

#[async_trait]
impl IndexingClient for FlakyStore {
    async fn ensure_collection(
        &self,
        collection: &str,
        vector_dims: Option<usize>,
    ) -> Result<(), SearchStoreError> {
        self.inner.ensure_collection(collection, vector_dims).await
    }

    async fn upsert(
        &self,
        collection: &str,
        doc_id: &str,
        document: &IndexDocument,
    ) -> IndexResult {
        self.attempts
            .lock()
            .expect("attempts lock")
            .push(doc_id.to_string());
        if self.reject.iter().any(|id| id == doc_id) {
            return Err(SearchStoreError::Rejected(format!("{doc_id} refused")));
        }
        self.inner.upsert(collection, doc_id, document).await
    }
}

struct Service {
    app: Router,
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryStore>,
    status: Arc<MemoryStatusChannel>,
    pool: RunningPool,
}

fn engine() -> Arc<EmbeddingEngine> {
    Arc::new(EmbeddingEngine::new(
        Arc::new(HashEmbeddingClient::new(DIMENSION)),
        TokenBudget::for_model("BAAI/bge-m3", 512),
        DIMENSION,
        1,
    ))
}

fn start_service(visibility_timeout: Duration, workers: usize) -> Service {
    let broker = Arc::new(MemoryBroker::new(visibility_timeout));
    let store = Arc::new(MemoryStore::new());
    let status = Arc::new(MemoryStatusChannel::default());
    let metrics = Arc::new(IngestMetrics::new());
    let engine = engine();

    let processor = Arc::new(JobProcessor::new(
        engine.clone(),
        store.clone(),
        status.clone(),
        metrics.clone(),
    ));
    let pool = WorkerPool::new(broker.clone(), processor, workers).start();
    let state = AppState::new(
        broker.clone(),
        store.clone(),
        engine,
        metrics,
        std::env::temp_dir().join("reelindex-integration-absent.json"),
    );
    Service {
        app: create_router(Arc::new(state)),
        broker,
        store,
        status,
        pool,
    }
}

async fn call(app: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(body)
                .expect("request"),
        )
        .await
        .expect("router response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    (status, bytes.to_vec())
}

async fn wait_for_state(broker: &MemoryBroker, job_id: &JobId, expected: JobState) {
    for _ in 0..300 {
        if broker.state(job_id).await.expect("state") == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached {expected:?}");
}

fn statuses_for(channel: &MemoryStatusChannel, job_id: &JobId) -> Vec<TaskStatus> {
    channel
        .events_for(job_id)
        .into_iter()
        .map(|event| event.status)
        .collect()
}

#[tokio::test]
async fn insert_emb_end_to_end_writes_embedding_collection() {
    let service = start_service(Duration::from_secs(60), 2);
    let payload = json!({
        "movies": [
            {"id": "1", "title": "Inception", "actors": "Leonardo DiCaprio, Elliot Page",
             "director": "Christopher Nolan", "poster_url": "https://img.example.org/1.jpg"},
            {"id": "2", "title": "Heat", "actors": "Al Pacino, Robert De Niro",
             "director": "Michael Mann", "year": 1995}
        ]
    });

    let (status, body) = call(
        &service.app,
        Method::POST,
        "/insert_emb",
        Body::from(payload.to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let response: serde_json::Value = serde_json::from_slice(&body).expect("json");
    let task_id = response["task_id"].as_str().expect("task id");
    let uuid = Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("regex");
    assert!(uuid.is_match(task_id), "unexpected task id {task_id}");
    let job_id = JobId::from(task_id);

    wait_for_state(&service.broker, &job_id, JobState::Success).await;
    let (_, body) = call(
        &service.app,
        Method::GET,
        &format!("/get_status/{task_id}"),
        Body::empty(),
    )
    .await;
    assert_eq!(body, b"Completed");

    assert_eq!(service.store.count("movies").await, 0);
    assert_eq!(service.store.count("movies_emb").await, 2);
    let stored = service
        .store
        .document("movies_emb", "1")
        .await
        .expect("document 1");
    assert_eq!(stored["actors"], json!(["Leonardo DiCaprio", "Elliot Page"]));
    assert_eq!(stored["director"], json!("Christopher Nolan"));
    assert_eq!(stored["poster_url"], json!("https://img.example.org/1.jpg"));
    assert_eq!(
        stored["embedding"].as_array().map(Vec::len),
        Some(DIMENSION)
    );

    assert_eq!(
        statuses_for(&service.status, &job_id),
        vec![TaskStatus::Inprocess, TaskStatus::Completed]
    );

    let (status, body) = call(
        &service.app,
        Method::GET,
        "/vector_search?index=movies_emb&query=Inception&size=1",
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let hits: serde_json::Value = serde_json::from_slice(&body).expect("hits");
    assert_eq!(hits.as_array().map(Vec::len), Some(1));
    assert!(hits[0]["_source"].get("embedding").is_none());

    let (_, body) = call(&service.app, Method::GET, "/metrics", Body::empty()).await;
    let metrics: serde_json::Value = serde_json::from_slice(&body).expect("metrics");
    assert_eq!(metrics["jobs_completed"], 1);
    assert_eq!(metrics["embeddings_generated"], 2);

    service.pool.shutdown().await;
}

#[tokio::test]
async fn failing_record_stops_the_job_and_keeps_earlier_writes() {
    let store = Arc::new(FlakyStore::rejecting(&["2"]));
    let status = Arc::new(MemoryStatusChannel::default());
    let processor = JobProcessor::new(
        engine(),
        store.clone(),
        status.clone(),
        Arc::new(IngestMetrics::new()),
    );
    let job = Job {
        id: JobId::from("job-fail"),
        task_kind: TaskKind::Insert,
        payload: JobPayload::from_json(json!({
            "movies": [{"id": "1"}, {"id": "2"}, {"id": "3"}]
        }))
        .expect("payload"),
    };

    let report = processor.process(&job).await;

    assert!(matches!(report, JobReport::Failed { indexed: 1, .. }));
    assert_eq!(store.attempts(), vec!["1".to_string(), "2".to_string()]);
    assert!(store.inner.document("movies", "1").await.is_some());
    assert!(store.inner.document("movies", "3").await.is_none());
    let terminal: Vec<TaskStatus> = statuses_for(&status, &job.id)
        .into_iter()
        .filter(|status| status.is_terminal())
        .collect();
    assert_eq!(terminal, vec![TaskStatus::Failed]);
}

#[tokio::test]
async fn failed_job_reads_processing_but_detailed_view_reports_failure() {
    let broker = Arc::new(MemoryBroker::new(Duration::from_secs(60)));
    let status = Arc::new(MemoryStatusChannel::default());
    let metrics = Arc::new(IngestMetrics::new());
    let engine = engine();
    let processor = Arc::new(JobProcessor::new(
        engine.clone(),
        Arc::new(FlakyStore::rejecting(&["bad"])),
        status.clone(),
        metrics.clone(),
    ));
    let pool = WorkerPool::new(broker.clone(), processor, 1).start();
    let app = create_router(Arc::new(AppState::new(
        broker.clone(),
        Arc::new(MemoryStore::new()),
        engine,
        metrics,
        std::env::temp_dir().join("reelindex-integration-absent.json"),
    )));

    let payload = JobPayload::from_json(json!({"movies": [{"id": "bad"}]})).expect("payload");
    let job_id = broker.submit(TaskKind::Insert, payload).await.expect("submit");
    wait_for_state(&broker, &job_id, JobState::Failure).await;

    let (_, body) = call(&app, Method::GET, &format!("/get_status/{job_id}"), Body::empty()).await;
    assert_eq!(body, b"Processing");
    let (_, body) = call(&app, Method::GET, &format!("/jobs/{job_id}"), Body::empty()).await;
    let view: serde_json::Value = serde_json::from_slice(&body).expect("view");
    assert_eq!(view["status"], "Failed");
    assert_eq!(view["state"], "FAILURE");
    assert_eq!(
        statuses_for(&status, &job_id),
        vec![TaskStatus::Inprocess, TaskStatus::Failed]
    );

    pool.shutdown().await;
}

#[tokio::test]
async fn abandoned_delivery_is_redelivered_and_reprocessed_idempotently() {
    let broker = Arc::new(MemoryBroker::new(Duration::from_millis(50)));
    let payload = JobPayload::from_json(json!({
        "movies": [{"id": "1", "actors": "A, B"}, {"id": "2", "director": "C"}]
    }))
    .expect("payload");
    let job_id = broker.submit(TaskKind::Insert, payload).await.expect("submit");

    // A worker that claims the job and dies before settling it.
    let abandoned = broker.claim().await.expect("claim");
    assert!(!abandoned.redelivered);
    let store = Arc::new(MemoryStore::new());
    let status = Arc::new(MemoryStatusChannel::default());
    let processor = Arc::new(JobProcessor::new(
        engine(),
        store.clone(),
        status.clone(),
        Arc::new(IngestMetrics::new()),
    ));
    // The dead worker's partial run already wrote record 1.
    let job = reelindex::broker::decode_job(&abandoned.body).expect("job");
    processor.process(&job).await;
    let before = store.document("movies", "1").await;

    let pool = WorkerPool::new(broker.clone(), processor, 2).start();
    wait_for_state(&broker, &job_id, JobState::Success).await;

    assert_eq!(store.count("movies").await, 2);
    assert_eq!(store.document("movies", "1").await, before);
    let events = statuses_for(&status, &job_id);
    assert_eq!(events.first(), Some(&TaskStatus::Inprocess));
    assert_eq!(events.last(), Some(&TaskStatus::Completed));
    pool.shutdown().await;
}

#[tokio::test]
async fn undecodable_delivery_publishes_sentinel_invalid_request() {
    let service = start_service(Duration::from_secs(60), 1);
    service
        .broker
        .publish_raw(b"{\"task\": \"unknown\"}".to_vec())
        .await
        .expect("publish");

    let sentinel = JobId::sentinel();
    let mut events = Vec::new();
    for _ in 0..300 {
        events = statuses_for(&service.status, &sentinel);
        if !events.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(events, vec![TaskStatus::InvalidRequest]);
    assert!(
        service
            .status
            .events()
            .iter()
            .all(|event| event.status == TaskStatus::InvalidRequest)
    );
    service.pool.shutdown().await;
}

#[tokio::test]
async fn elasticsearch_backend_receives_idempotent_document_puts() {
    let server = MockServer::start_async().await;
    let head = server
        .mock_async(|when, then| {
            when.method(HEAD).path("/movies_emb");
            then.status(404);
        })
        .await;
    let create = server
        .mock_async(|when, then| {
            when.method(PUT).path("/movies_emb");
            then.status(200).json_body(json!({"acknowledged": true}));
        })
        .await;
    let documents = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path_matches(Regex::new(r"^/movies_emb/_doc/[12]$").expect("regex"));
            then.status(200).json_body(json!({"result": "updated"}));
        })
        .await;

    let client = Arc::new(ElasticsearchClient::new(&server.base_url(), None, false).expect("client"));
    let processor = JobProcessor::new(
        engine(),
        client,
        Arc::new(MemoryStatusChannel::default()),
        Arc::new(IngestMetrics::new()),
    );
    let job = Job {
        id: JobId::from("es-job"),
        task_kind: TaskKind::InsertWithEmbedding,
        payload: JobPayload::from_json(json!({
            "movies": [{"id": "1", "title": "Up"}, {"id": "2", "title": "Heat"}]
        }))
        .expect("payload"),
    };

    assert!(matches!(
        processor.process(&job).await,
        JobReport::Completed { indexed: 2, .. }
    ));
    assert!(matches!(
        processor.process(&job).await,
        JobReport::Completed { indexed: 2, .. }
    ));

    head.assert_hits_async(1).await;
    create.assert_hits_async(1).await;
    documents.assert_hits_async(4).await;
}
