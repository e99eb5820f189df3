//! Job lifecycle notifications and the coarse status view.
//!
//! Two independent sources describe a job. The status channel carries human-readable
//! [`StatusEvent`]s published by workers as a job moves through the pipeline. Nothing waits for
//! a consumer, but a transport failure while publishing `Inprocess` or `Completed` fails the job;
//! only `Failed` and `Invalid Request` are sent best-effort. The status store reads the broker's own bookkeeping
//! and is the system of record for `/get_status`. The two may disagree briefly.

mod amqp;
mod memory;
pub mod store;

pub use amqp::AmqpStatusChannel;
pub use memory::MemoryStatusChannel;
pub use store::{JobStatus, JobStatusView, StatusStore};

use crate::config::Config;
use crate::ingest::JobId;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::task::JoinHandle;

const TASK_ID_PREFIX: &str = "Task ID:";
const STATUS_SEPARATOR: &str = " \t Task Status:";

/// Errors raised by status channel implementations.
#[derive(Debug, Error)]
pub enum StatusChannelError {
    /// The AMQP connection or channel failed.
    #[error("Status channel transport failed: {0}")]
    Transport(#[from] lapin::Error),
    /// The channel no longer accepts messages.
    #[error("Status channel is closed")]
    Closed,
    /// A message did not follow the status wire format.
    #[error("Malformed status message: {0}")]
    Malformed(String),
}

/// Lifecycle status carried by a [`StatusEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// The job was claimed and processing started.
    Inprocess,
    /// Every record was indexed.
    Completed,
    /// Processing was abandoned after a failure.
    Failed,
    /// The delivery carried no usable job.
    InvalidRequest,
}

impl TaskStatus {
    /// Wire text of the status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inprocess => "Inprocess",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::InvalidRequest => "Invalid Request",
        }
    }

    /// Whether the status ends a job's event sequence.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StatusChannelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Inprocess" => Ok(Self::Inprocess),
            "Completed" => Ok(Self::Completed),
            "Failed" => Ok(Self::Failed),
            "Invalid Request" => Ok(Self::InvalidRequest),
            other => Err(StatusChannelError::Malformed(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

/// A single job status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Job the event refers to; the sentinel id for invalid deliveries.
    pub job_id: JobId,
    /// New status.
    pub status: TaskStatus,
    /// When the transition was observed.
    pub timestamp: OffsetDateTime,
}

impl StatusEvent {
    /// Event stamped with the current time.
    pub fn now(job_id: JobId, status: TaskStatus) -> Self {
        Self {
            job_id,
            status,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Render the message body, e.g. `Task ID:42 \t Task Status:Completed`.
    pub fn wire_text(&self) -> String {
        format!(
            "{TASK_ID_PREFIX}{}{STATUS_SEPARATOR}{}",
            self.job_id, self.status
        )
    }

    /// Parse a message body, attaching the supplied timestamp.
    pub fn parse(text: &str, timestamp: OffsetDateTime) -> Result<Self, StatusChannelError> {
        let malformed = || StatusChannelError::Malformed(text.to_string());
        let rest = text.strip_prefix(TASK_ID_PREFIX).ok_or_else(malformed)?;
        let (job_id, status) = rest.split_once(STATUS_SEPARATOR).ok_or_else(malformed)?;
        Ok(Self {
            job_id: JobId::from(job_id),
            status: status.parse()?,
            timestamp,
        })
    }

    /// Timestamp formatted as RFC 3339, for logs.
    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.timestamp.unix_timestamp().to_string())
    }
}

/// Callback invoked once per received status message.
pub type StatusHandler = Box<dyn Fn(StatusEvent) + Send + Sync>;

/// One-way publish/subscribe pipe for job status events.
#[async_trait]
pub trait StatusChannel: Send + Sync {
    /// Publish an event without waiting for any consumer.
    async fn publish(&self, event: &StatusEvent) -> Result<(), StatusChannelError>;

    /// Invoke `handler` for every subsequent event until the channel closes.
    async fn subscribe(&self, handler: StatusHandler)
    -> Result<JoinHandle<()>, StatusChannelError>;
}

/// Connect the status channel described by the configuration.
pub async fn connect(config: &Config) -> Result<Arc<dyn StatusChannel>, StatusChannelError> {
    match config.status_channel_url.as_deref() {
        Some(url) => {
            let channel = AmqpStatusChannel::connect(url, &config.status_queue).await?;
            Ok(Arc::new(channel))
        }
        None => {
            tracing::info!("STATUS_CHANNEL_URL not set; using in-process status channel");
            Ok(Arc::new(MemoryStatusChannel::default()))
        }
    }
}
