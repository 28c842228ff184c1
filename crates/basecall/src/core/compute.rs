//! The compute thread: sole owner of accelerator submission.

use std::sync::PoisonError;
use std::thread;
use tracing::{debug, error, info};

use super::event::EventWait;
use super::pipeline::{Pipeline, TaskHandle};
use crate::backend::{Decoder, ScoringModel, Submission};
use crate::buffers::BufferSet;
use crate::config::{DeviceLock, RETRY_BACKOFF, SUBMIT_ATTEMPTS, WAKE_INTERVAL};
use crate::error::{CallerError, DeviceError};

/// Label attached to the scan/softmax command in device error reports.
pub(crate) const SCAN_COMMAND_LABEL: &str = "linear/scan/softmax";

/// Takes tasks in submission order, runs each batch on the accelerator and
/// hands it to the decode pool.
///
/// Runs until the input queue is terminated and drained, then lets the decode
/// pool stop once it has drained too.
pub(crate) fn compute_loop<M: ScoringModel, D: Decoder>(pipeline: &Pipeline<M, D>) {
    info!("Compute thread started");
    while let Some(task) = pipeline.input_queue.wait_pop(WAKE_INTERVAL) {
        let completion_id = pipeline.next_completion_id();
        task.set_completion_id(completion_id);

        match submit_with_retry(pipeline, &task, completion_id) {
            Ok(()) => {
                if let Err(task) = pipeline.decode_queue.push(task) {
                    let err = pipeline.fatal_error().unwrap_or(CallerError::Terminated);
                    pipeline.fail_task(&task, err);
                }
            }
            Err(err) => {
                if matches!(err, CallerError::SubmissionFailed { .. }) {
                    error!("Failed to successfully submit accelerator command buffers for task {}", task.id());
                }
                pipeline.abort(err.clone());
                pipeline.fail_task(&task, err);
                break;
            }
        }
    }
    pipeline.decode_queue.terminate();
    info!("Compute thread stopped");
}

/// Submits one task's batch, retrying transient device failures.
///
/// The forward pass may not write the buffers until batch `completion_id - 1`
/// has been decoded. Gives up early if the pipeline is torn down meanwhile.
fn submit_with_retry<M: ScoringModel, D: Decoder>(
    pipeline: &Pipeline<M, D>,
    task: &TaskHandle<M>,
    completion_id: u64,
) -> Result<(), CallerError> {
    let buffers = pipeline.buffers();
    let model = pipeline.model.lock().unwrap_or_else(PoisonError::into_inner);
    let wait = EventWait::new(&pipeline.event, completion_id - 1);

    for attempt in 0..SUBMIT_ATTEMPTS {
        if let Some(fatal) = pipeline.fatal_error() {
            return Err(fatal);
        }
        if attempt > 0 {
            pipeline.stats.submission_retried();
        }
        match run_batch(&*model, task.input(), Some(wait), attempt, &buffers, &pipeline.device_lock) {
            Ok(()) => return Ok(()),
            Err(err) => {
                debug!(
                    "Task {} (id {}) submission attempt {} failed: {}",
                    task.id(),
                    completion_id,
                    attempt,
                    err
                );
                if attempt + 1 < SUBMIT_ATTEMPTS {
                    thread::sleep(RETRY_BACKOFF);
                }
            }
        }
    }
    Err(CallerError::SubmissionFailed {
        attempts: SUBMIT_ATTEMPTS,
    })
}

/// One attempt at a full batch: forward pass, both scans over every split,
/// then commit and wait. The device lock is held throughout.
pub(crate) fn run_batch<M: ScoringModel>(
    model: &M,
    input: &M::Input,
    wait: Option<EventWait<'_>>,
    attempt: u32,
    buffers: &BufferSet,
    device_lock: &DeviceLock,
) -> Result<(), DeviceError> {
    let _device = device_lock.inner().lock().unwrap_or_else(PoisonError::into_inner);
    let mut submission = model.forward(input, wait, attempt, buffers)?;
    run_scan_kernels(&mut submission, buffers);
    submission.finish(SCAN_COMMAND_LABEL, attempt)
}

fn run_scan_kernels<S: Submission>(submission: &mut S, buffers: &BufferSet) {
    let args = buffers.scan_args();
    for split in buffers.splits() {
        submission.backward_scan(&args, split);
        submission.forward_scan_softmax(&args, split);
    }
}
