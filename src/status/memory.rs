use super::{StatusChannel, StatusChannelError, StatusEvent, StatusHandler};
use crate::ingest::JobId;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

const DEFAULT_CAPACITY: usize = 1024;

/// In-process status channel built on a broadcast queue.
///
/// Keeps the most recent events so they can be inspected after the fact; subscribers that fall
/// behind lose messages, like consumers of the AMQP queue.
pub struct MemoryStatusChannel {
    sender: broadcast::Sender<StatusEvent>,
    history: Mutex<VecDeque<StatusEvent>>,
    capacity: usize,
    closed: AtomicBool,
}

impl Default for MemoryStatusChannel {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl MemoryStatusChannel {
    /// Create a channel retaining at most `capacity` recent events.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Refuse further publishes, like a status broker that went away.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Retained events in publish order.
    pub fn events(&self) -> Vec<StatusEvent> {
        match self.history.lock() {
            Ok(history) => history.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Retained events for a single job, in publish order.
    pub fn events_for(&self, job_id: &JobId) -> Vec<StatusEvent> {
        self.events()
            .into_iter()
            .filter(|event| &event.job_id == job_id)
            .collect()
    }
}

#[async_trait]
impl StatusChannel for MemoryStatusChannel {
    async fn publish(&self, event: &StatusEvent) -> Result<(), StatusChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StatusChannelError::Closed);
        }
        {
            let mut history = match self.history.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // No subscriber is not an error for a fire-and-forget channel.
        let _ = self.sender.send(event.clone());
        tracing::debug!(message = %event.wire_text(), "Status published");
        Ok(())
    }

    async fn subscribe(
        &self,
        handler: StatusHandler,
    ) -> Result<JoinHandle<()>, StatusChannelError> {
        let mut receiver = self.sender.subscribe();
        Ok(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => handler(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Status subscriber lagged; events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }
}
