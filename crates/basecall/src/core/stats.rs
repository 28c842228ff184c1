use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of a caller's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallerStats {
    /// Tasks accepted by `submit` since construction
    pub tasks_submitted: u64,
    /// Tasks whose client was handed every decoded chunk
    pub tasks_completed: u64,
    /// Tasks that ended with an error
    pub tasks_failed: u64,
    pub chunks_decoded: u64,
    /// Submission attempts beyond the first, over all batches
    pub submission_retries: u64,
    /// Tasks waiting for the accelerator
    pub pending_tasks: usize,
    /// Tasks with chunks still waiting for a decode thread
    pub decoding_tasks: usize,
    /// Highest completion id whose buffers have been released
    pub last_completion_id: u64,
    pub batch_size: usize,
    pub split_count: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    tasks_submitted: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    chunks_decoded: AtomicU64,
    submission_retries: AtomicU64,
}

impl StatCounters {
    pub fn task_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self, succeeded: bool) {
        let counter = if succeeded {
            &self.tasks_completed
        } else {
            &self.tasks_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_decoded(&self) {
        self.chunks_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submission_retried(&self) {
        self.submission_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters; the queue and geometry fields are left for the
    /// caller to fill.
    pub fn to_stats(&self) -> CallerStats {
        CallerStats {
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            chunks_decoded: self.chunks_decoded.load(Ordering::Relaxed),
            submission_retries: self.submission_retries.load(Ordering::Relaxed),
            ..CallerStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = StatCounters::default();
        counters.task_submitted();
        counters.task_submitted();
        counters.task_finished(true);
        counters.task_finished(false);
        counters.chunk_decoded();
        counters.submission_retried();

        let stats = counters.to_stats();
        assert_eq!(stats.tasks_submitted, 2);
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(stats.chunks_decoded, 1);
        assert_eq!(stats.submission_retries, 1);
        assert_eq!(stats.batch_size, 0);
    }
}
