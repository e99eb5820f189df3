//! Broker-backed status store.

use crate::broker::{BrokerError, JobBroker, JobState};
use crate::ingest::JobId;
use serde::Serialize;
use std::sync::Arc;

/// Coarse text returned while a job has not succeeded.
pub const PROCESSING: &str = "Processing";
/// Coarse text returned once a job succeeded.
pub const COMPLETED: &str = "Completed";

/// Three-valued job status exposed by the detailed view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    /// Queued or running.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished after a failure.
    Failed,
}

impl From<JobState> for JobStatus {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Pending | JobState::Started => Self::Processing,
            JobState::Success => Self::Completed,
            JobState::Failure => Self::Failed,
        }
    }
}

/// Two-valued status text: only success reads as completed.
pub fn coarse_status(state: JobState) -> &'static str {
    match state {
        JobState::Success => COMPLETED,
        _ => PROCESSING,
    }
}

/// Detailed status of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusView {
    /// Job identifier.
    pub task_id: JobId,
    /// Raw broker state.
    pub state: JobState,
    /// Three-valued status.
    pub status: JobStatus,
}

/// Read-only view over the broker's job results.
#[derive(Clone)]
pub struct StatusStore {
    broker: Arc<dyn JobBroker>,
}

impl StatusStore {
    /// Wrap a broker.
    pub fn new(broker: Arc<dyn JobBroker>) -> Self {
        Self { broker }
    }

    /// `"Completed"` once the job succeeded, `"Processing"` otherwise.
    pub async fn coarse(&self, job_id: &JobId) -> Result<&'static str, BrokerError> {
        Ok(coarse_status(self.broker.state(job_id).await?))
    }

    /// Raw state alongside the three-valued status.
    pub async fn detailed(&self, job_id: &JobId) -> Result<JobStatusView, BrokerError> {
        let state = self.broker.state(job_id).await?;
        Ok(JobStatusView {
            task_id: job_id.clone(),
            state,
            status: state.into(),
        })
    }
}
