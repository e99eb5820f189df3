use super::results::ResultTable;
use super::{
    BrokerError, Delivery, DeliveryTag, JobBroker, JobOutcome, JobState, decode_job, encode_job,
};
use crate::ingest::{Job, JobId, JobPayload, TaskKind};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Upper bound on how long an idle consumer sleeps before re-checking leases.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// How long settled results are kept when no TTL is given.
const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
struct Message {
    job_id: Option<JobId>,
    body: Vec<u8>,
    redelivered: bool,
}

struct Lease {
    message: Message,
    deadline: Instant,
}

struct Queues {
    ready: VecDeque<Message>,
    in_flight: HashMap<DeliveryTag, Lease>,
    results: ResultTable,
    next_tag: u64,
    closed: bool,
}

impl Queues {
    fn new(result_ttl: Duration) -> Self {
        Self {
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            results: ResultTable::new(result_ttl),
            next_tag: 0,
            closed: false,
        }
    }

    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<DeliveryTag> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in expired {
            if let Some(lease) = self.in_flight.remove(&tag) {
                tracing::warn!(%tag, job_id = ?lease.message.job_id, "Lease expired; requeueing job");
                let mut message = lease.message;
                message.redelivered = true;
                if let Some(job_id) = &message.job_id {
                    self.results.insert(job_id.clone(), JobState::Pending);
                }
                self.ready.push_front(message);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|lease| lease.deadline).min()
    }
}

/// In-process broker with lease-based redelivery.
///
/// State lives in memory only: queued jobs and results do not survive a restart. The service uses
/// [`super::AmqpBroker`] unless `JOB_BROKER=memory` is set.
pub struct MemoryBroker {
    queues: Mutex<Queues>,
    available: Notify,
    visibility_timeout: Duration,
}

impl MemoryBroker {
    /// Create a broker whose leases expire after `visibility_timeout`.
    pub fn new(visibility_timeout: Duration) -> Self {
        Self::with_result_ttl(visibility_timeout, DEFAULT_RESULT_TTL)
    }

    /// Create a broker that also forgets settled results after `result_ttl`.
    pub fn with_result_ttl(visibility_timeout: Duration, result_ttl: Duration) -> Self {
        Self {
            queues: Mutex::new(Queues::new(result_ttl)),
            available: Notify::new(),
            visibility_timeout,
        }
    }

    /// Enqueue an arbitrary message body, bypassing job encoding.
    pub async fn publish_raw(&self, body: Vec<u8>) -> Result<(), BrokerError> {
        let job_id = decode_job(&body).ok().map(|job| job.id);
        self.enqueue(Message {
            job_id,
            body,
            redelivered: false,
        })
        .await
    }

    /// Number of messages waiting to be claimed.
    pub async fn ready_len(&self) -> usize {
        self.queues.lock().await.ready.len()
    }

    /// Number of claimed but unsettled deliveries.
    pub async fn in_flight_len(&self) -> usize {
        self.queues.lock().await.in_flight.len()
    }

    async fn enqueue(&self, message: Message) -> Result<(), BrokerError> {
        {
            let mut queues = self.queues.lock().await;
            if queues.closed {
                return Err(BrokerError::Closed);
            }
            if let Some(job_id) = &message.job_id {
                queues.results.insert(job_id.clone(), JobState::Pending);
            }
            queues.ready.push_back(message);
        }
        self.available.notify_one();
        Ok(())
    }
}

#[async_trait]
impl JobBroker for MemoryBroker {
    async fn submit(&self, task_kind: TaskKind, payload: JobPayload) -> Result<JobId, BrokerError> {
        let job = Job {
            id: JobId::generate(),
            task_kind,
            payload,
        };
        let body = encode_job(&job)?;
        self.enqueue(Message {
            job_id: Some(job.id.clone()),
            body,
            redelivered: false,
        })
        .await?;
        tracing::info!(job_id = %job.id, task_kind = task_kind.as_str(), "Job submitted");
        Ok(job.id)
    }

    async fn claim(&self) -> Result<Delivery, BrokerError> {
        loop {
            let notified = self.available.notified();
            let wait = {
                let mut queues = self.queues.lock().await;
                let now = Instant::now();
                queues.requeue_expired(now);

                if let Some(message) = queues.ready.pop_front() {
                    queues.next_tag += 1;
                    let tag = DeliveryTag(queues.next_tag);
                    if let Some(job_id) = &message.job_id {
                        queues.results.insert(job_id.clone(), JobState::Started);
                    }
                    let delivery = Delivery {
                        tag,
                        body: message.body.clone(),
                        redelivered: message.redelivered,
                    };
                    queues.in_flight.insert(
                        tag,
                        Lease {
                            message,
                            deadline: now + self.visibility_timeout,
                        },
                    );
                    return Ok(delivery);
                }
                if queues.closed {
                    return Err(BrokerError::Closed);
                }
                queues
                    .next_deadline()
                    .map_or(IDLE_POLL, |deadline| deadline.saturating_duration_since(now))
                    .min(IDLE_POLL)
            };

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn ack(&self, tag: DeliveryTag, outcome: JobOutcome) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().await;
        let lease = queues
            .in_flight
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))?;
        if let Some(job_id) = lease.message.job_id {
            queues.results.insert(job_id, outcome.into());
        }
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        {
            let mut queues = self.queues.lock().await;
            let lease = queues
                .in_flight
                .remove(&tag)
                .ok_or(BrokerError::UnknownDelivery(tag))?;
            let mut message = lease.message;
            message.redelivered = true;
            if let Some(job_id) = &message.job_id {
                queues.results.insert(job_id.clone(), JobState::Pending);
            }
            queues.ready.push_front(message);
        }
        self.available.notify_one();
        Ok(())
    }

    async fn state(&self, job_id: &JobId) -> Result<JobState, BrokerError> {
        let mut queues = self.queues.lock().await;
        queues.requeue_expired(Instant::now());
        Ok(queues.results.get(job_id).unwrap_or(JobState::Pending))
    }

    async fn close(&self) {
        self.queues.lock().await.closed = true;
        self.available.notify_waiters();
        tracing::info!("Job broker closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> JobPayload {
        JobPayload::from_json(json!({"movies": [{"id": "1"}]})).expect("payload")
    }

    #[tokio::test]
    async fn submit_then_claim_tracks_job_state() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let job_id = broker.submit(TaskKind::Insert, payload()).await.expect("submit");
        assert_eq!(broker.state(&job_id).await.expect("state"), JobState::Pending);

        let delivery = broker.claim().await.expect("claim");
        let job = decode_job(&delivery.body).expect("job");
        assert_eq!(job.id, job_id);
        assert!(!delivery.redelivered);
        assert_eq!(broker.state(&job_id).await.expect("state"), JobState::Started);

        broker
            .ack(delivery.tag, JobOutcome::Success)
            .await
            .expect("ack");
        assert_eq!(broker.state(&job_id).await.expect("state"), JobState::Success);
        assert_eq!(broker.in_flight_len().await, 0);
    }

    #[tokio::test]
    async fn unacknowledged_delivery_is_redelivered_after_timeout() {
        let broker = MemoryBroker::new(Duration::from_millis(20));
        let job_id = broker.submit(TaskKind::Insert, payload()).await.expect("submit");

        let first = broker.claim().await.expect("first claim");
        let second = tokio::time::timeout(Duration::from_secs(2), broker.claim())
            .await
            .expect("redelivery within timeout")
            .expect("second claim");

        assert_ne!(first.tag, second.tag);
        assert!(second.redelivered);
        assert_eq!(decode_job(&second.body).expect("job").id, job_id);
        assert!(matches!(
            broker.ack(first.tag, JobOutcome::Success).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
        broker
            .ack(second.tag, JobOutcome::Success)
            .await
            .expect("ack");
    }

    #[tokio::test]
    async fn nack_returns_delivery_to_the_front() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let first_id = broker.submit(TaskKind::Insert, payload()).await.expect("first");
        broker.submit(TaskKind::Insert, payload()).await.expect("second");

        let delivery = broker.claim().await.expect("claim");
        broker.nack(delivery.tag).await.expect("nack");
        assert_eq!(broker.state(&first_id).await.expect("state"), JobState::Pending);

        let again = broker.claim().await.expect("claim again");
        assert_eq!(decode_job(&again.body).expect("job").id, first_id);
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn claim_waits_for_submission() {
        let broker = std::sync::Arc::new(MemoryBroker::new(Duration::from_secs(60)));
        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.claim().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let job_id = broker.submit(TaskKind::Insert, payload()).await.expect("submit");

        let delivery = consumer.await.expect("join").expect("claim");
        assert_eq!(decode_job(&delivery.body).expect("job").id, job_id);
    }

    #[tokio::test]
    async fn closed_broker_rejects_submissions_and_drains() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        broker.submit(TaskKind::Insert, payload()).await.expect("submit");
        broker.close().await;

        assert!(matches!(
            broker.submit(TaskKind::Insert, payload()).await,
            Err(BrokerError::Closed)
        ));
        assert!(broker.claim().await.is_ok());
        assert!(matches!(broker.claim().await, Err(BrokerError::Closed)));
    }

    #[tokio::test]
    async fn unknown_jobs_read_as_pending() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        assert_eq!(
            broker.state(&JobId::from("missing")).await.expect("state"),
            JobState::Pending
        );
    }

    #[tokio::test]
    async fn settled_results_expire_after_ttl() {
        let broker = MemoryBroker::with_result_ttl(Duration::from_secs(60), Duration::from_millis(20));
        let job_id = broker.submit(TaskKind::Insert, payload()).await.expect("submit");
        let delivery = broker.claim().await.expect("claim");
        broker
            .ack(delivery.tag, JobOutcome::Failure)
            .await
            .expect("ack");
        assert_eq!(broker.state(&job_id).await.expect("state"), JobState::Failure);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(broker.state(&job_id).await.expect("state"), JobState::Pending);
        assert!(broker.queues.lock().await.results.is_empty());
    }

    #[tokio::test]
    async fn raw_messages_are_delivered_untracked() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        broker.publish_raw(b"garbage".to_vec()).await.expect("publish");
        let delivery = broker.claim().await.expect("claim");
        assert_eq!(delivery.body, b"garbage");
        broker
            .ack(delivery.tag, JobOutcome::Failure)
            .await
            .expect("ack");
        assert_eq!(broker.ready_len().await, 0);
    }
}
