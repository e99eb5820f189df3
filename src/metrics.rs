use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing ingestion activity.
#[derive(Default)]
pub struct IngestMetrics {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_invalid: AtomicU64,
    records_indexed: AtomicU64,
    embeddings_generated: AtomicU64,
}

impl IngestMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a job that indexed every record.
    pub fn record_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job aborted by a processing failure.
    pub fn record_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivery that carried no usable job.
    pub fn record_invalid(&self) {
        self.jobs_invalid.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a document written to the store, and whether it carried a vector.
    pub fn record_indexed(&self, embedded: bool) {
        self.records_indexed.fetch_add(1, Ordering::Relaxed);
        if embedded {
            self.embeddings_generated.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_invalid: self.jobs_invalid.load(Ordering::Relaxed),
            records_indexed: self.records_indexed.load(Ordering::Relaxed),
            embeddings_generated: self.embeddings_generated.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of ingestion counters used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Jobs that finished with every record indexed.
    pub jobs_completed: u64,
    /// Jobs aborted by a normalize, embed, or index failure.
    pub jobs_failed: u64,
    /// Deliveries rejected for lacking a decodable job.
    pub jobs_invalid: u64,
    /// Documents written to the search store since startup.
    pub records_indexed: u64,
    /// Documents written with an embedding vector attached.
    pub embeddings_generated: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_jobs_and_documents() {
        let metrics = IngestMetrics::new();
        metrics.record_indexed(true);
        metrics.record_indexed(false);
        metrics.record_completed();
        metrics.record_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_indexed, 2);
        assert_eq!(snapshot.embeddings_generated, 1);
        assert_eq!(snapshot.jobs_completed, 1);
        assert_eq!(snapshot.jobs_failed, 1);
        assert_eq!(snapshot.jobs_invalid, 0);
    }

    #[test]
    fn snapshot_starts_at_zero() {
        let snapshot = IngestMetrics::new().snapshot();
        assert_eq!(
            snapshot,
            MetricsSnapshot {
                jobs_completed: 0,
                jobs_failed: 0,
                jobs_invalid: 0,
                records_indexed: 0,
                embeddings_generated: 0,
            }
        );
    }
}
