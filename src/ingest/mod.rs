//! Ingestion pipeline: job model, field normalization, per-job driver, and worker pool.

pub mod normalize;
pub mod pipeline;
pub mod types;
pub mod worker;

pub use normalize::{MULTI_VALUED_FIELDS, NormalizeResult, normalize};
pub use pipeline::{JobProcessor, JobReport, PipelineError};
pub use types::{
    CollectionBatch, EMBEDDING_COLLECTION_SUFFIX, EMBEDDING_FIELD, ID_FIELD, IndexDocument, Job,
    JobId, JobPayload, NormalizeError, PayloadError, RawRecord, Record, TaskKind, Value,
};
pub use worker::{RunningPool, WorkerPool};
