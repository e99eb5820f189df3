//! Durable, at-least-once job queue decoupling submission from execution.
//!
//! A job is owned by the broker from `submit` until a worker settles its delivery with `ack`.
//! Deliveries that are neither acknowledged nor negatively acknowledged before the visibility
//! timeout elapses go back on the queue, so a worker that dies mid-job causes a redelivery rather
//! than a lost job. Per-job [`JobState`]s are kept in a [`ResultBackend`] and back the status
//! store.
//!
//! [`AmqpBroker`] is the durable implementation used by the service. [`MemoryBroker`] keeps the
//! same lease semantics in process memory for tests and local runs.

mod amqp;
mod memory;
mod results;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;
pub use results::{ElasticsearchResults, MemoryResults, ResultBackend, ResultTable};

use crate::config::{Config, JobBrokerKind};
use crate::ingest::{Job, JobId, JobPayload, TaskKind};
use crate::search::{ElasticsearchClient, SearchStoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker is closed or unreachable.
    #[error("Job broker is unavailable")]
    Closed,
    /// The delivery was already settled or its lease expired and was redelivered.
    #[error("Unknown or expired delivery tag: {0}")]
    UnknownDelivery(DeliveryTag),
    /// A job message or stored result could not be encoded or decoded.
    #[error("Failed to encode or decode broker data: {0}")]
    Codec(#[from] serde_json::Error),
    /// The AMQP connection or channel failed.
    #[error("Job broker transport failed: {0}")]
    Transport(#[from] lapin::Error),
    /// The broker did not confirm a published job.
    #[error("Job broker did not confirm the publish")]
    NotConfirmed,
    /// The result backend failed.
    #[error("Job result backend failed: {0}")]
    Results(#[from] SearchStoreError),
}

/// Broker-side bookkeeping for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Queued, or unknown to the broker.
    Pending,
    /// Claimed by a worker.
    Started,
    /// Settled after a successful run.
    Success,
    /// Settled after an aborted run.
    Failure,
}

/// How a worker settles a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every record was indexed.
    Success,
    /// The job was abandoned or could not be decoded.
    Failure,
}

impl From<JobOutcome> for JobState {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Success => Self::Success,
            JobOutcome::Failure => Self::Failure,
        }
    }
}

/// Opaque handle identifying one delivery of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A claimed message, leased to a single worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Tag to settle the delivery with.
    pub tag: DeliveryTag,
    /// Encoded job message.
    pub body: Vec<u8>,
    /// Whether this message was delivered before and its lease lapsed.
    pub redelivered: bool,
}

/// Work queue used by the submission API and the worker pool.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Enqueue a job and return its identifier without waiting for processing.
    async fn submit(&self, task_kind: TaskKind, payload: JobPayload) -> Result<JobId, BrokerError>;

    /// Wait for the next available delivery.
    async fn claim(&self) -> Result<Delivery, BrokerError>;

    /// Settle a delivery and record the job's final state.
    async fn ack(&self, tag: DeliveryTag, outcome: JobOutcome) -> Result<(), BrokerError>;

    /// Return a delivery to the queue immediately.
    async fn nack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Current state of `job_id`; unknown ids read as [`JobState::Pending`].
    async fn state(&self, job_id: &JobId) -> Result<JobState, BrokerError>;

    /// Stop accepting submissions and wake idle consumers.
    async fn close(&self);
}

/// Connect the broker described by the configuration.
///
/// Job states are kept next to the documents: in an Elasticsearch index when `elasticsearch`
/// is given, otherwise in process memory.
pub async fn connect(
    config: &Config,
    elasticsearch: Option<Arc<ElasticsearchClient>>,
) -> Result<Arc<dyn JobBroker>, BrokerError> {
    match config.job_broker {
        JobBrokerKind::Amqp => {
            let results: Arc<dyn ResultBackend> = match elasticsearch {
                Some(client) => Arc::new(ElasticsearchResults::new(
                    client,
                    config.job_results_index.clone(),
                    config.job_result_ttl,
                )),
                None => {
                    tracing::warn!("Job results are kept in memory and lost on restart");
                    Arc::new(MemoryResults::new(config.job_result_ttl))
                }
            };
            let broker = AmqpBroker::connect(
                &config.job_broker_url,
                &config.job_queue,
                config.worker_count,
                config.job_visibility_timeout,
                results,
            )
            .await?;
            Ok(Arc::new(broker))
        }
        JobBrokerKind::Memory => {
            tracing::warn!("JOB_BROKER=memory: queued jobs are lost on restart");
            Ok(Arc::new(MemoryBroker::with_result_ttl(
                config.job_visibility_timeout,
                config.job_result_ttl,
            )))
        }
    }
}

/// Encode a job into its queue message.
pub fn encode_job(job: &Job) -> Result<Vec<u8>, BrokerError> {
    Ok(serde_json::to_vec(job)?)
}

/// Decode a queue message back into a job.
pub fn decode_job(body: &[u8]) -> Result<Job, serde_json::Error> {
    serde_json::from_slice(body)
}
