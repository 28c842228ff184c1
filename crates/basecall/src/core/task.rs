use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::task::{Context, Poll};
use std::thread;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::backend::DecodedChunk;
use crate::error::CallerError;

/// What a client finally receives for one submission.
pub type TaskResult = Result<Vec<DecodedChunk>, CallerError>;

/// One client submission travelling through the pipeline.
///
/// The compute thread and every decode thread working on the batch share the
/// task through an `Arc`; the client holds only the receiving end of the
/// completion channel. Chunk claims and completions are counted atomically so
/// the task is never locked as a whole.
pub(crate) struct Task<I> {
    id: Uuid,
    input: I,
    num_chunks: usize,
    slots: Vec<Mutex<Option<DecodedChunk>>>,
    chunks_started: AtomicUsize,
    chunks_finished: AtomicUsize,
    completion_id: AtomicU64,
    failure: OnceLock<CallerError>,
    done: Mutex<Option<oneshot::Sender<TaskResult>>>,
}

impl<I> Task<I> {
    /// Creates a task for one submitted batch.
    ///
    /// # Parameters
    ///
    /// * `input` - The full batch handed to the model
    /// * `num_chunks` - How many leading chunks of the batch to decode
    ///
    /// # Returns
    ///
    /// The task and the [`ChunkResults`] its client waits on
    pub fn new(input: I, num_chunks: usize) -> (Self, ChunkResults) {
        let (sender, receiver) = oneshot::channel();
        let task = Self {
            id: Uuid::new_v4(),
            input,
            num_chunks,
            slots: (0..num_chunks).map(|_| Mutex::new(None)).collect(),
            chunks_started: AtomicUsize::new(0),
            chunks_finished: AtomicUsize::new(0),
            completion_id: AtomicU64::new(0),
            failure: OnceLock::new(),
            done: Mutex::new(Some(sender)),
        };
        (task, ChunkResults::new(receiver))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn input(&self) -> &I {
        &self.input
    }

    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    pub fn completion_id(&self) -> u64 {
        self.completion_id.load(Ordering::Acquire)
    }

    pub fn set_completion_id(&self, id: u64) {
        self.completion_id.store(id, Ordering::Release);
    }

    /// Claims the next chunk for decoding. Returns its index and whether it
    /// was the last one to claim.
    pub fn claim_chunk(&self) -> (usize, bool) {
        let idx = self.chunks_started.fetch_add(1, Ordering::AcqRel);
        debug_assert!(idx < self.num_chunks, "chunk claimed past the end of the task");
        (idx, idx + 1 >= self.num_chunks)
    }

    pub fn store(&self, idx: usize, chunk: DecodedChunk) {
        let mut slot = self.slots[idx].lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(slot.is_none(), "chunk {idx} decoded twice");
        *slot = Some(chunk);
    }

    /// Records why the task cannot succeed. Only the first failure is kept.
    pub fn record_failure(&self, err: CallerError) {
        let _ = self.failure.set(err);
    }

    /// Marks one chunk as finished; `true` for the call that finishes the
    /// last one.
    pub fn finish_chunk(&self) -> bool {
        self.chunks_finished.fetch_add(1, Ordering::AcqRel) + 1 == self.num_chunks
    }

    pub fn chunks_finished(&self) -> usize {
        self.chunks_finished.load(Ordering::Acquire)
    }

    /// What the client should get once every chunk has finished: the
    /// decoded chunks in order, or the first recorded failure.
    pub fn outcome(&self) -> TaskResult {
        if let Some(err) = self.failure.get() {
            return Err(err.clone());
        }
        self.slots
            .iter()
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).take())
            .collect::<Option<Vec<_>>>()
            .ok_or(CallerError::Terminated)
    }

    /// Answers the client with `result`, running `before_send` first.
    ///
    /// Returns `false`, without running `before_send`, if the client had
    /// already been answered.
    pub fn respond<F>(&self, result: TaskResult, before_send: F) -> bool
    where
        F: FnOnce(&TaskResult),
    {
        match self.take_sender() {
            Some(sender) => {
                before_send(&result);
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }

    pub fn fail(&self, err: CallerError) -> bool {
        self.respond(Err(err), |_| {})
    }

    fn take_sender(&self) -> Option<oneshot::Sender<TaskResult>> {
        self.done.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl<I> Drop for Task<I> {
    /// A task dropped unanswered was lost by a worker; the client must not
    /// be left waiting.
    fn drop(&mut self) {
        let err = match self.failure.get() {
            Some(err) => err.clone(),
            None if thread::panicking() => {
                let name = thread::current().name().unwrap_or("worker").to_string();
                CallerError::WorkerPanicked(name)
            }
            None => CallerError::Terminated,
        };
        self.fail(err);
    }
}

/// The pending outcome of a submission.
///
/// Await it from async code, or call [`ChunkResults::wait`] from a plain
/// thread.
#[must_use = "results are lost unless awaited or waited on"]
pub struct ChunkResults {
    receiver: oneshot::Receiver<TaskResult>,
}

impl ChunkResults {
    fn new(receiver: oneshot::Receiver<TaskResult>) -> Self {
        Self { receiver }
    }

    /// Results that are known without going through the pipeline.
    pub(crate) fn ready(result: TaskResult) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self::new(receiver)
    }

    /// Blocks the current thread until the results are in.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context;
    /// await the `ChunkResults` there instead.
    pub fn wait(self) -> TaskResult {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(CallerError::Terminated))
    }
}

impl Future for ChunkResults {
    type Output = TaskResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(CallerError::Terminated)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use std::sync::Arc;

    fn chunk(seq: &str) -> DecodedChunk {
        DecodedChunk {
            sequence: seq.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_claims_flag_the_last_chunk() {
        let (task, _results) = Task::new((), 3);
        assert_eq!(task.claim_chunk(), (0, false));
        assert_eq!(task.claim_chunk(), (1, false));
        assert_eq!(task.claim_chunk(), (2, true));
    }

    #[test]
    fn test_complete_delivers_every_slot() {
        let (task, results) = Task::new((), 3);
        for idx in [2, 0, 1] {
            task.store(idx, chunk(&idx.to_string()));
        }
        assert!(!task.finish_chunk());
        assert!(!task.finish_chunk());
        assert!(task.finish_chunk());
        assert_eq!(task.chunks_finished(), 3);
        assert!(task.respond(task.outcome(), |result| assert!(result.is_ok())));

        let chunks = results.wait().unwrap();
        let seqs: Vec<_> = chunks.iter().map(|c| c.sequence.as_str()).collect();
        assert_eq!(seqs, vec!["0", "1", "2"]);
    }

    #[test]
    fn test_recorded_failure_wins_over_results() {
        let (task, results) = Task::new((), 2);
        task.store(0, chunk("A"));
        task.record_failure(CallerError::Decode {
            chunk: 1,
            source: DecodeError("first".to_string()),
        });
        task.record_failure(CallerError::Decode {
            chunk: 0,
            source: DecodeError("second".to_string()),
        });
        assert!(task.respond(task.outcome(), |_| {}));
        assert!(matches!(results.wait(), Err(CallerError::Decode { chunk: 1, .. })));
    }

    #[test]
    fn test_client_answered_once() {
        let (task, results) = Task::new((), 1);
        assert!(task.fail(CallerError::SubmissionFailed { attempts: 5 }));
        assert!(!task.fail(CallerError::Terminated));
        assert!(!task.respond(Ok(vec![]), |_| panic!("answered twice")));
        assert_eq!(results.wait(), Err(CallerError::SubmissionFailed { attempts: 5 }));
    }

    #[test]
    fn test_dropped_task_releases_client() {
        let (task, results) = Task::new((), 1);
        drop(task);
        assert_eq!(results.wait(), Err(CallerError::Terminated));
    }

    #[test]
    fn test_task_dropped_by_panicking_worker() {
        let (task, results) = Task::new((), 1);
        let task = Arc::new(task);
        let worker = std::thread::Builder::new()
            .name("decode-test".to_string())
            .spawn(move || {
                let _task = task;
                panic!("decoder blew up");
            })
            .unwrap();
        assert!(worker.join().is_err());
        assert_eq!(
            results.wait(),
            Err(CallerError::WorkerPanicked("decode-test".to_string()))
        );
    }

    #[test]
    fn test_dropped_task_reports_recorded_failure() {
        let (task, results) = Task::new((), 2);
        task.record_failure(CallerError::WorkerPanicked("basecall-decode-1".to_string()));
        drop(task);
        assert_eq!(
            results.wait(),
            Err(CallerError::WorkerPanicked("basecall-decode-1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_results_can_be_awaited() {
        let (task, results) = Task::new((), 1);
        task.store(0, chunk("ACGT"));
        assert!(task.finish_chunk());
        assert!(task.respond(task.outcome(), |_| {}));
        assert_eq!(results.await.unwrap(), vec![chunk("ACGT")]);
    }

    #[tokio::test]
    async fn test_ready_results() {
        assert_eq!(ChunkResults::ready(Ok(vec![])).await, Ok(vec![]));
    }
}
