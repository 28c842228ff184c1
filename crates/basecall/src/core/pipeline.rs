//! State shared between the caller facade, the compute thread and the decode
//! pool.

use std::iter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use tracing::{debug, error, info};

use super::compute::compute_loop;
use super::decode::decode_loop;
use super::event::CompletionEvent;
use super::pill::Pill;
use super::queue::WorkQueue;
use super::stats::{CallerStats, StatCounters};
use super::task::Task;
use super::worker::WorkerHandle;
use crate::backend::{Decoder, ScoringModel};
use crate::buffers::BufferSet;
use crate::config::{DecoderOptions, DeviceLock};
use crate::error::CallerError;

pub(crate) type TaskHandle<M> = Arc<Task<<M as ScoringModel>::Input>>;

type WorkerBody<M, D> = fn(&Pipeline<M, D>);

pub(crate) struct Pipeline<M: ScoringModel, D> {
    /// Driven by the compute thread; locked elsewhere only while the workers
    /// are stopped
    pub model: Mutex<M>,
    pub decoder: D,
    pub options: DecoderOptions,
    /// Swapped only while the workers are stopped
    buffers: RwLock<Arc<BufferSet>>,
    pub input_queue: WorkQueue<TaskHandle<M>>,
    pub decode_queue: WorkQueue<TaskHandle<M>>,
    pub event: CompletionEvent,
    /// Next id handed to a dequeued task; survives restarts
    next_completion_id: AtomicU64,
    pub device_lock: DeviceLock,
    /// First error that took the pipeline down for good
    fatal: OnceLock<CallerError>,
    pub stats: StatCounters,
}

impl<M: ScoringModel, D: Decoder> Pipeline<M, D> {
    pub fn new(model: M, decoder: D, options: DecoderOptions, device_lock: DeviceLock, buffers: BufferSet) -> Self {
        Self {
            model: Mutex::new(model),
            decoder,
            options,
            buffers: RwLock::new(Arc::new(buffers)),
            input_queue: WorkQueue::new(),
            decode_queue: WorkQueue::new(),
            event: CompletionEvent::new(),
            next_completion_id: AtomicU64::new(1),
            device_lock,
            fatal: OnceLock::new(),
            stats: StatCounters::default(),
        }
    }

    /// Spawns the compute thread and `decode_threads` decode threads.
    ///
    /// Each thread carries a [`Pill`] that aborts the pipeline if it panics.
    ///
    /// # Parameters
    ///
    /// * `decode_threads` - Size of the decode pool
    ///
    /// # Returns
    ///
    /// Handles for every started thread, compute thread first. If any thread
    /// fails to spawn, the ones already running are stopped and joined before
    /// the error is returned.
    pub fn start(self: &Arc<Self>, decode_threads: usize) -> Result<Vec<WorkerHandle>, CallerError> {
        let bodies = iter::once(("basecall-compute".to_string(), compute_loop::<M, D> as WorkerBody<M, D>)).chain(
            (0..decode_threads).map(|i| (format!("basecall-decode-{i}"), decode_loop::<M, D> as WorkerBody<M, D>)),
        );

        let mut workers = Vec::with_capacity(decode_threads + 1);
        for (name, body) in bodies {
            match self.spawn_worker(name, body) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    self.input_queue.terminate();
                    self.decode_queue.terminate();
                    for worker in &mut workers {
                        worker.join();
                    }
                    return Err(err);
                }
            }
        }
        info!("Started compute thread and {} decode threads", decode_threads);
        Ok(workers)
    }

    fn spawn_worker(
        self: &Arc<Self>,
        name: String,
        body: WorkerBody<M, D>,
    ) -> Result<WorkerHandle, CallerError> {
        let pipeline = self.clone();
        let thread_name = name.clone();
        WorkerHandle::spawn(name, move || {
            let _pill = Pill::new({
                let pipeline = pipeline.clone();
                move || pipeline.abort(CallerError::WorkerPanicked(thread_name))
            });
            body(&pipeline);
        })
    }

    /// Lets stopped workers be started again.
    pub fn reopen(&self) {
        self.input_queue.reopen();
        self.decode_queue.reopen();
        self.event.reset_abandoned();
    }

    pub fn buffers(&self) -> Arc<BufferSet> {
        self.buffers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn replace_buffers(&self, buffers: BufferSet) {
        *self.buffers.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(buffers);
    }

    pub fn next_completion_id(&self) -> u64 {
        self.next_completion_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn fatal_error(&self) -> Option<CallerError> {
        self.fatal.get().cloned()
    }

    /// Puts the pipeline into the failed state.
    ///
    /// Every queued task is answered with the fatal error, both queues stop
    /// accepting work and anything waiting on buffer release is let go.
    /// Safe to call more than once; the first error is the one reported.
    pub fn abort(&self, err: CallerError) {
        if self.fatal.set(err.clone()).is_ok() {
            error!("Caller failed, rejecting all pending work: {}", err);
        }
        let fatal = self.fatal.get().cloned().unwrap_or(err);

        self.input_queue.terminate();
        self.decode_queue.terminate();
        for task in self.input_queue.drain().into_iter().chain(self.decode_queue.drain()) {
            self.fail_task(&task, fatal.clone());
        }
        self.event.abandon();
    }

    pub fn fail_task(&self, task: &TaskHandle<M>, err: CallerError) {
        task.respond(Err(err), |result| {
            if let Err(err) = result {
                debug!("Task {} failed: {}", task.id(), err);
            }
            self.stats.task_finished(false);
        });
    }

    /// Answers the client of a task whose every chunk has been decoded.
    pub fn complete_task(&self, task: &TaskHandle<M>) {
        debug_assert_eq!(task.chunks_finished(), task.num_chunks());
        task.respond(task.outcome(), |result| {
            debug!(
                "Task {} of {} chunks completed (id {}, ok {})",
                task.id(),
                task.num_chunks(),
                task.completion_id(),
                result.is_ok()
            );
            self.stats.task_finished(result.is_ok());
        });
    }

    pub fn sample_stats(&self) -> CallerStats {
        let buffers = self.buffers();
        CallerStats {
            pending_tasks: self.input_queue.len(),
            decoding_tasks: self.decode_queue.len(),
            last_completion_id: self.event.signaled_value(),
            batch_size: buffers.geometry().batch_size,
            split_count: buffers.geometry().split_count,
            ..self.stats.to_stats()
        }
    }
}
