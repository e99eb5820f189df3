//! Result backends: where job states are recorded between submission and settlement.

use super::{BrokerError, JobState};
use crate::ingest::JobId;
use crate::search::{ElasticsearchClient, SearchQueries};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Store of per-job states backing [`super::JobBroker::state`].
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Record the current state of `job_id`.
    async fn store(&self, job_id: &JobId, state: JobState) -> Result<(), BrokerError>;

    /// Last recorded state, or `None` when unknown or expired.
    async fn fetch(&self, job_id: &JobId) -> Result<Option<JobState>, BrokerError>;
}

const fn is_settled(state: JobState) -> bool {
    matches!(state, JobState::Success | JobState::Failure)
}

/// Job states with expiry of settled entries.
///
/// Pending and started entries never expire. Settlements are remembered in order, so eviction
/// only ever inspects the oldest ones.
#[derive(Debug)]
pub struct ResultTable {
    ttl: Duration,
    entries: HashMap<JobId, Entry>,
    settled: VecDeque<(Instant, JobId)>,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: JobState,
    settled_at: Option<Instant>,
}

impl ResultTable {
    /// Table whose settled entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            settled: VecDeque::new(),
        }
    }

    /// Record `state` for `job_id`.
    pub fn insert(&mut self, job_id: JobId, state: JobState) {
        let now = Instant::now();
        self.evict_expired(now);
        let settled_at = is_settled(state).then_some(now);
        if settled_at.is_some() {
            self.settled.push_back((now, job_id.clone()));
        }
        self.entries.insert(job_id, Entry { state, settled_at });
    }

    /// Current state of `job_id`, if still remembered.
    pub fn get(&mut self, job_id: &JobId) -> Option<JobState> {
        self.evict_expired(Instant::now());
        self.entries.get(job_id).map(|entry| entry.state)
    }

    /// Number of remembered jobs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no job is remembered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((settled_at, _)) = self.settled.front() {
            if now.saturating_duration_since(*settled_at) < self.ttl {
                break;
            }
            let Some((settled_at, job_id)) = self.settled.pop_front() else {
                break;
            };
            // A job re-settled after a redelivery keeps its newer entry.
            if self
                .entries
                .get(&job_id)
                .is_some_and(|entry| entry.settled_at == Some(settled_at))
            {
                self.entries.remove(&job_id);
                tracing::trace!(job_id = %job_id, "Job result expired");
            }
        }
    }
}

/// In-process result backend; states are lost on restart.
pub struct MemoryResults {
    table: Mutex<ResultTable>,
}

impl MemoryResults {
    /// Backend whose settled entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            table: Mutex::new(ResultTable::new(ttl)),
        }
    }
}

#[async_trait]
impl ResultBackend for MemoryResults {
    async fn store(&self, job_id: &JobId, state: JobState) -> Result<(), BrokerError> {
        self.table.lock().await.insert(job_id.clone(), state);
        Ok(())
    }

    async fn fetch(&self, job_id: &JobId) -> Result<Option<JobState>, BrokerError> {
        Ok(self.table.lock().await.get(job_id))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ResultDocument {
    state: JobState,
    /// Unix epoch milliseconds of the last transition.
    updated_at: i64,
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Result backend persisting one document per job in an Elasticsearch index.
///
/// Expired settled results are deleted lazily when read.
pub struct ElasticsearchResults {
    client: Arc<ElasticsearchClient>,
    index: String,
    ttl: Duration,
}

impl ElasticsearchResults {
    /// Backend writing to `index` through `client`.
    pub fn new(client: Arc<ElasticsearchClient>, index: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client,
            index: index.into(),
            ttl,
        }
    }

    fn expired(&self, document: &ResultDocument, now: i64) -> bool {
        let ttl = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        is_settled(document.state) && now.saturating_sub(document.updated_at) >= ttl
    }
}

#[async_trait]
impl ResultBackend for ElasticsearchResults {
    async fn store(&self, job_id: &JobId, state: JobState) -> Result<(), BrokerError> {
        let document = ResultDocument {
            state,
            updated_at: now_millis(),
        };
        let body = serde_json::to_value(&document)?;
        self.client
            .put_source(&self.index, job_id.as_str(), &body)
            .await?;
        tracing::trace!(job_id = %job_id, ?state, "Job result stored");
        Ok(())
    }

    async fn fetch(&self, job_id: &JobId) -> Result<Option<JobState>, BrokerError> {
        let Some(source) = self.client.get_source(&self.index, job_id.as_str()).await? else {
            return Ok(None);
        };
        let document: ResultDocument = serde_json::from_value(source)?;
        if self.expired(&document, now_millis()) {
            if let Err(err) = self
                .client
                .delete_document(&self.index, job_id.as_str())
                .await
            {
                tracing::warn!(job_id = %job_id, error = %err, "Failed to delete expired job result");
            }
            return Ok(None);
        }
        Ok(Some(document.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn settled_entries_expire_but_in_flight_ones_stay() {
        let mut table = ResultTable::new(Duration::from_millis(20));
        table.insert(JobId::from("done"), JobState::Success);
        table.insert(JobId::from("running"), JobState::Started);
        assert_eq!(table.get(&JobId::from("done")), Some(JobState::Success));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(table.get(&JobId::from("done")), None);
        assert_eq!(table.get(&JobId::from("running")), Some(JobState::Started));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn resettled_job_keeps_its_newer_result() {
        let mut table = ResultTable::new(Duration::from_millis(30));
        let job = JobId::from("j");
        table.insert(job.clone(), JobState::Failure);
        tokio::time::sleep(Duration::from_millis(20)).await;
        table.insert(job.clone(), JobState::Success);
        tokio::time::sleep(Duration::from_millis(15)).await;

        assert_eq!(table.get(&job), Some(JobState::Success));
    }

    #[tokio::test]
    async fn elasticsearch_results_round_trip_and_expire() {
        let server = MockServer::start_async().await;
        let put = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/job-results/_doc/j-1")
                    .json_body_partial(r#"{"state":"SUCCESS"}"#);
                then.status(201).json_body(json!({"result": "created"}));
            })
            .await;
        let fresh = server
            .mock_async(|when, then| {
                when.method(GET).path("/job-results/_doc/j-1");
                then.status(200).json_body(json!({
                    "found": true,
                    "_source": {"state": "SUCCESS", "updated_at": now_millis()}
                }));
            })
            .await;
        let stale = server
            .mock_async(|when, then| {
                when.method(GET).path("/job-results/_doc/old");
                then.status(200).json_body(json!({
                    "found": true,
                    "_source": {"state": "FAILURE", "updated_at": 0}
                }));
            })
            .await;
        let delete_stale = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/job-results/_doc/old");
                then.status(200).json_body(json!({"result": "deleted"}));
            })
            .await;
        let missing = server
            .mock_async(|when, then| {
                when.method(GET).path("/job-results/_doc/unknown");
                then.status(404).json_body(json!({"found": false}));
            })
            .await;

        let client = Arc::new(ElasticsearchClient::new(&server.base_url(), None, false).expect("client"));
        let results = ElasticsearchResults::new(client, "job-results", Duration::from_secs(3600));

        results
            .store(&JobId::from("j-1"), JobState::Success)
            .await
            .expect("store");
        assert_eq!(
            results.fetch(&JobId::from("j-1")).await.expect("fetch"),
            Some(JobState::Success)
        );
        assert_eq!(results.fetch(&JobId::from("old")).await.expect("fetch"), None);
        assert_eq!(
            results.fetch(&JobId::from("unknown")).await.expect("fetch"),
            None
        );

        put.assert_async().await;
        fresh.assert_async().await;
        stale.assert_async().await;
        delete_stale.assert_async().await;
        missing.assert_async().await;
    }
}
