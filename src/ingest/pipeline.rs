//! Per-job driver: normalize, optionally embed, and index every record of a job.

use super::normalize::{NormalizeResult, normalize};
use super::types::{IndexDocument, Job, JobId, NormalizeError, RawRecord, Record, TaskKind};
use crate::broker::{JobOutcome, decode_job};
use crate::embedding::{EmbedError, EmbedResult, EmbeddingEngine};
use crate::metrics::IngestMetrics;
use crate::search::{IndexResult, IndexingClient, SearchStoreError};
use crate::status::{StatusChannel, StatusChannelError, StatusEvent, TaskStatus};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Failure that aborts the remainder of a job.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A record could not be converted or normalized.
    #[error("record {position} of '{collection}' failed normalization: {source}")]
    Normalize {
        /// Source collection.
        collection: String,
        /// Zero-based record position within the collection.
        position: usize,
        /// Underlying error.
        #[source]
        source: NormalizeError,
    },
    /// The embedding engine failed for a record.
    #[error("embedding failed for document '{doc_id}': {source}")]
    Embed {
        /// Document key.
        doc_id: String,
        /// Underlying error.
        #[source]
        source: EmbedError,
    },
    /// The target collection could not be prepared.
    #[error("collection '{collection}' could not be prepared: {source}")]
    Collection {
        /// Target collection.
        collection: String,
        /// Underlying error.
        #[source]
        source: SearchStoreError,
    },
    /// The search store rejected a document.
    #[error("indexing document '{doc_id}' into '{collection}' failed: {source}")]
    Index {
        /// Target collection.
        collection: String,
        /// Document key.
        doc_id: String,
        /// Underlying error.
        #[source]
        source: SearchStoreError,
    },
    /// A lifecycle event could not be handed to the status channel.
    #[error("publishing '{status}' failed: {source}")]
    Status {
        /// Event that was being published.
        status: TaskStatus,
        /// Underlying error.
        #[source]
        source: StatusChannelError,
    },
}

/// What happened to a delivery.
#[derive(Debug)]
pub enum JobReport {
    /// Every record was indexed.
    Completed {
        /// Job identifier.
        job_id: JobId,
        /// Number of documents written.
        indexed: usize,
    },
    /// Processing stopped at the first failing record.
    Failed {
        /// Job identifier.
        job_id: JobId,
        /// Documents written before the failure; they stay persisted.
        indexed: usize,
        /// The failure.
        error: PipelineError,
    },
    /// The delivery could not be decoded into a job.
    Invalid {
        /// Decoder message.
        reason: String,
    },
}

impl JobReport {
    /// How the delivery should be settled with the broker.
    pub fn outcome(&self) -> JobOutcome {
        match self {
            Self::Completed { .. } => JobOutcome::Success,
            Self::Failed { .. } | Self::Invalid { .. } => JobOutcome::Failure,
        }
    }
}

/// Runs the ingestion pipeline for one job at a time.
///
/// The processor holds shared handles to the embedding engine, the indexing client, and the
/// status channel; one instance is shared by every worker.
pub struct JobProcessor {
    engine: Arc<EmbeddingEngine>,
    indexer: Arc<dyn IndexingClient>,
    status: Arc<dyn StatusChannel>,
    metrics: Arc<IngestMetrics>,
    prepared: Mutex<HashSet<String>>,
}

impl JobProcessor {
    /// Assemble a processor from explicit service objects.
    pub fn new(
        engine: Arc<EmbeddingEngine>,
        indexer: Arc<dyn IndexingClient>,
        status: Arc<dyn StatusChannel>,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            engine,
            indexer,
            status,
            metrics,
            prepared: Mutex::new(HashSet::new()),
        }
    }

    /// Shared ingestion counters.
    pub fn metrics(&self) -> &Arc<IngestMetrics> {
        &self.metrics
    }

    /// Decode a queue message and run its job.
    pub async fn process_delivery(&self, body: &[u8]) -> JobReport {
        match decode_job(body) {
            Ok(job) => self.process(&job).await,
            Err(err) => {
                tracing::warn!(error = %err, "Invalid Request");
                self.notify(JobId::sentinel(), TaskStatus::InvalidRequest)
                    .await;
                self.metrics.record_invalid();
                JobReport::Invalid {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Run a decoded job, reporting its lifecycle on the status channel.
    ///
    /// A transport failure while publishing `Inprocess` or `Completed` fails the job like any
    /// other stage; only the closing `Failed` event is best-effort.
    pub async fn process(&self, job: &Job) -> JobReport {
        tracing::info!(
            job_id = %job.id,
            task_kind = job.task_kind.as_str(),
            records = job.payload.record_count(),
            "Valid Request"
        );

        let mut indexed = 0;
        match self.run(job, &mut indexed).await {
            Ok(()) => {
                tracing::info!(job_id = %job.id, indexed, "Job completed");
                self.metrics.record_completed();
                JobReport::Completed {
                    job_id: job.id.clone(),
                    indexed,
                }
            }
            Err(error) => {
                tracing::error!(job_id = %job.id, indexed, error = %error, "Job failed");
                self.notify(job.id.clone(), TaskStatus::Failed).await;
                self.metrics.record_failed();
                JobReport::Failed {
                    job_id: job.id.clone(),
                    indexed,
                    error,
                }
            }
        }
    }

    async fn run(&self, job: &Job, indexed: &mut usize) -> Result<(), PipelineError> {
        self.publish(job.id.clone(), TaskStatus::Inprocess).await?;
        self.index_job(job, indexed).await?;
        self.publish(job.id.clone(), TaskStatus::Completed).await
    }

    async fn index_job(&self, job: &Job, indexed: &mut usize) -> Result<(), PipelineError> {
        for batch in job.payload.collections() {
            let target = job.task_kind.target_collection(&batch.name);
            self.prepare_collection(job.task_kind, &target).await?;

            for (position, raw) in batch.records.iter().enumerate() {
                self.index_record(job.task_kind, &batch.name, &target, position, raw)
                    .await?;
                *indexed += 1;
            }
        }
        Ok(())
    }

    async fn prepare_collection(&self, kind: TaskKind, target: &str) -> Result<(), PipelineError> {
        if self.prepared.lock().await.contains(target) {
            return Ok(());
        }
        let dims = kind.embeds().then(|| self.engine.dimension());
        self.indexer
            .ensure_collection(target, dims)
            .await
            .map_err(|source| PipelineError::Collection {
                collection: target.to_string(),
                source,
            })?;
        self.prepared.lock().await.insert(target.to_string());
        Ok(())
    }

    async fn index_record(
        &self,
        kind: TaskKind,
        collection: &str,
        target: &str,
        position: usize,
        raw: &RawRecord,
    ) -> Result<(), PipelineError> {
        let normalize_error = |source: NormalizeError| PipelineError::Normalize {
            collection: collection.to_string(),
            position,
            source,
        };

        // The embedding input is the record as submitted, before any field splitting.
        let snapshot = Record::from_raw(raw).map_err(normalize_error)?;
        let normalized: NormalizeResult = normalize(snapshot.clone());
        let fields = normalized.map_err(normalize_error)?;
        let doc_id = fields.doc_id().map_err(normalize_error)?;
        tracing::debug!(collection, doc_id = %doc_id, "Record normalized");

        let embedding = if kind.embeds() {
            let embedded: EmbedResult = self.engine.embed(&snapshot).await;
            let vector = embedded.map_err(|source| PipelineError::Embed {
                doc_id: doc_id.clone(),
                source,
            })?;
            Some(vector)
        } else {
            None
        };

        let document = IndexDocument::new(fields, embedding);
        let written: IndexResult = self.indexer.upsert(target, &doc_id, &document).await;
        written.map_err(|source| PipelineError::Index {
            collection: target.to_string(),
            doc_id: doc_id.clone(),
            source,
        })?;
        self.metrics.record_indexed(kind.embeds());
        tracing::debug!(collection = target, doc_id = %doc_id, "Document indexed");
        Ok(())
    }

    async fn publish(&self, job_id: JobId, status: TaskStatus) -> Result<(), PipelineError> {
        let event = StatusEvent::now(job_id, status);
        self.status
            .publish(&event)
            .await
            .map_err(|source| PipelineError::Status { status, source })
    }

    /// Publish an event nothing depends on; failures are only logged.
    async fn notify(&self, job_id: JobId, status: TaskStatus) {
        let event = StatusEvent::now(job_id, status);
        if let Err(err) = self.status.publish(&event).await {
            tracing::warn!(
                job_id = %event.job_id,
                status = %event.status,
                error = %err,
                "Status publish failed"
            );
        }
    }
}
