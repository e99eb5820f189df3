//! Worker pool consuming jobs from the broker.

use super::pipeline::{JobProcessor, JobReport};
use crate::broker::{BrokerError, JobBroker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Pause before retrying a failed claim.
const CLAIM_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Fixed-size pool of workers, each running one job at a time.
pub struct WorkerPool {
    broker: Arc<dyn JobBroker>,
    processor: Arc<JobProcessor>,
    worker_count: usize,
}

/// Handle to a started pool.
pub struct RunningPool {
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create a pool of `worker_count` workers (at least one).
    pub fn new(
        broker: Arc<dyn JobBroker>,
        processor: Arc<JobProcessor>,
        worker_count: usize,
    ) -> Self {
        Self {
            broker,
            processor,
            worker_count: worker_count.max(1),
        }
    }

    /// Spawn the workers onto the current runtime.
    pub fn start(self) -> RunningPool {
        let (shutdown_tx, _) = broadcast::channel(1);
        let workers = (0..self.worker_count)
            .map(|worker| {
                let broker = self.broker.clone();
                let processor = self.processor.clone();
                let shutdown_rx = shutdown_tx.subscribe();
                tokio::spawn(run_worker(worker, broker, processor, shutdown_rx))
            })
            .collect();
        tracing::info!(workers = self.worker_count, "Worker pool started");
        RunningPool {
            shutdown_tx,
            workers,
        }
    }
}

impl RunningPool {
    /// Stop claiming new jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.workers {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "Worker task panicked");
            }
        }
        tracing::info!("Worker pool shutdown complete");
    }

    /// Number of spawned workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

async fn run_worker(
    worker: usize,
    broker: Arc<dyn JobBroker>,
    processor: Arc<JobProcessor>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::debug!(worker, "Worker started");
    loop {
        // Shutdown only interrupts the wait for work; a claimed job always runs to completion.
        let claimed = tokio::select! {
            _ = shutdown.recv() => break,
            claimed = broker.claim() => claimed,
        };

        let delivery = match claimed {
            Ok(delivery) => delivery,
            Err(BrokerError::Closed) => {
                tracing::info!(worker, "Broker closed; worker exiting");
                break;
            }
            Err(err) => {
                tracing::warn!(worker, error = %err, "Claim failed");
                tokio::time::sleep(CLAIM_RETRY_DELAY).await;
                continue;
            }
        };

        tracing::debug!(
            worker,
            tag = %delivery.tag,
            redelivered = delivery.redelivered,
            "Job claimed"
        );
        let span = tracing::info_span!("job", worker, tag = %delivery.tag);
        let report = processor
            .process_delivery(&delivery.body)
            .instrument(span)
            .await;
        if let JobReport::Failed { job_id, indexed, .. } = &report {
            tracing::debug!(worker, job_id = %job_id, indexed, "Partial writes kept");
        }
        if let Err(err) = broker.ack(delivery.tag, report.outcome()).await {
            tracing::warn!(
                worker,
                tag = %delivery.tag,
                error = %err,
                "Acknowledgement rejected; job may be redelivered"
            );
        }
    }
    tracing::debug!(worker, "Worker stopped");
}
