use super::results::ResultBackend;
use super::{
    BrokerError, Delivery, DeliveryTag, JobBroker, JobOutcome, JobState, decode_job, encode_job,
};
use crate::ingest::{Job, JobId, JobPayload, TaskKind};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

/// AMQP delivery mode marking a message as persistent.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Upper bound on how long a consumer waits before re-checking leases.
const IDLE_POLL: Duration = Duration::from_millis(500);

struct Lease {
    acker: Acker,
    job_id: Option<JobId>,
    deadline: Instant,
}

/// Durable broker backed by an AMQP queue (e.g. RabbitMQ).
///
/// Jobs are published persistent on a confirm-mode channel into a durable queue, so `submit`
/// returns only once the broker has taken responsibility for the message. Deliveries are
/// consumed with manual acknowledgement: anything unacknowledged when a worker process dies is
/// requeued by the broker itself, and leases held past the visibility timeout are returned with
/// `basic.nack`.
pub struct AmqpBroker {
    // Held so the connection lives as long as the channel.
    _connection: Connection,
    channel: Channel,
    queue: String,
    consumer_tag: String,
    consumer: Mutex<Consumer>,
    leases: Mutex<HashMap<DeliveryTag, Lease>>,
    results: Arc<dyn ResultBackend>,
    visibility_timeout: Duration,
    closed: AtomicBool,
    closing: Notify,
}

impl AmqpBroker {
    /// Connect to `url`, declare `queue` as durable and start consuming it.
    ///
    /// `prefetch` bounds how many unacknowledged deliveries this process holds at once; it is
    /// normally the worker count.
    pub async fn connect(
        url: &str,
        queue: &str,
        prefetch: usize,
        visibility_timeout: Duration,
        results: Arc<dyn ResultBackend>,
    ) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .basic_qos(
                u16::try_from(prefetch.max(1)).unwrap_or(u16::MAX),
                BasicQosOptions::default(),
            )
            .await?;

        let consumer_tag = format!("reelindex-worker-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        tracing::info!(queue, prefetch, "Connected to job broker");

        Ok(Self {
            _connection: connection,
            channel,
            queue: queue.to_string(),
            consumer_tag,
            consumer: Mutex::new(consumer),
            leases: Mutex::new(HashMap::new()),
            results,
            visibility_timeout,
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        })
    }

    /// Return every lease past its deadline to the queue.
    async fn reclaim_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(DeliveryTag, Lease)> = {
            let mut leases = self.leases.lock().await;
            let tags: Vec<DeliveryTag> = leases
                .iter()
                .filter(|(_, lease)| lease.deadline <= now)
                .map(|(tag, _)| *tag)
                .collect();
            tags.into_iter()
                .filter_map(|tag| leases.remove(&tag).map(|lease| (tag, lease)))
                .collect()
        };

        for (tag, lease) in expired {
            tracing::warn!(%tag, job_id = ?lease.job_id, "Lease expired; requeueing job");
            if let Err(err) = self.requeue(lease).await {
                tracing::error!(%tag, error = %err, "Failed to requeue expired delivery");
            }
        }
    }

    async fn requeue(&self, lease: Lease) -> Result<(), BrokerError> {
        lease
            .acker
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await?;
        if let Some(job_id) = &lease.job_id {
            self.results.store(job_id, JobState::Pending).await?;
        }
        Ok(())
    }

    async fn next_wait(&self) -> Duration {
        let now = Instant::now();
        self.leases
            .lock()
            .await
            .values()
            .map(|lease| lease.deadline.saturating_duration_since(now))
            .min()
            .map_or(IDLE_POLL, |wait| wait.min(IDLE_POLL))
    }

    async fn take_lease(&self, tag: DeliveryTag) -> Result<Lease, BrokerError> {
        self.leases
            .lock()
            .await
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))
    }
}

#[async_trait]
impl JobBroker for AmqpBroker {
    async fn submit(&self, task_kind: TaskKind, payload: JobPayload) -> Result<JobId, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let job = Job {
            id: JobId::generate(),
            task_kind,
            payload,
        };
        let body = encode_job(&job)?;

        // Recorded first so a fast worker's STARTED is never overwritten.
        self.results.store(&job.id, JobState::Pending).await?;

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_content_type("application/json".into())
            .with_message_id(job.id.as_str().into());
        let confirmation = self
            .channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;
        if confirmation.is_nack() {
            tracing::error!(job_id = %job.id, "Job publish was not confirmed");
            return Err(BrokerError::NotConfirmed);
        }

        tracing::info!(job_id = %job.id, task_kind = task_kind.as_str(), "Job submitted");
        Ok(job.id)
    }

    async fn claim(&self) -> Result<Delivery, BrokerError> {
        loop {
            self.reclaim_expired().await;

            let closing = self.closing.notified();
            if self.closed.load(Ordering::Acquire) {
                return Err(BrokerError::Closed);
            }
            let wait = self.next_wait().await;

            let next = {
                let mut consumer = self.consumer.lock().await;
                tokio::select! {
                    _ = closing => return Err(BrokerError::Closed),
                    _ = tokio::time::sleep(wait) => continue,
                    next = consumer.next() => next,
                }
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => return Err(err.into()),
                None => return Err(BrokerError::Closed),
            };

            let tag = DeliveryTag(delivery.delivery_tag);
            let job_id = decode_job(&delivery.data).ok().map(|job| job.id);
            if let Some(job_id) = &job_id
                && let Err(err) = self.results.store(job_id, JobState::Started).await
            {
                tracing::warn!(job_id = %job_id, error = %err, "Failed to record job start");
            }
            self.leases.lock().await.insert(
                tag,
                Lease {
                    acker: delivery.acker,
                    job_id,
                    deadline: Instant::now() + self.visibility_timeout,
                },
            );
            return Ok(Delivery {
                tag,
                body: delivery.data,
                redelivered: delivery.redelivered,
            });
        }
    }

    async fn ack(&self, tag: DeliveryTag, outcome: JobOutcome) -> Result<(), BrokerError> {
        let lease = self.take_lease(tag).await?;
        if let Some(job_id) = &lease.job_id {
            self.results.store(job_id, outcome.into()).await?;
        }
        lease.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let lease = self.take_lease(tag).await?;
        self.requeue(lease).await
    }

    async fn state(&self, job_id: &JobId) -> Result<JobState, BrokerError> {
        Ok(self
            .results
            .fetch(job_id)
            .await?
            .unwrap_or(JobState::Pending))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.closing.notify_waiters();
        // Prefetched deliveries nobody claimed stay unacknowledged and are requeued by the broker
        // when the connection closes.
        if let Err(err) = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            tracing::warn!(error = %err, "Failed to cancel job consumer");
        }
        tracing::info!(queue = %self.queue, "Job broker closed");
    }
}
