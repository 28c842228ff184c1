//! The decode pool: CPU threads turning scored chunks into sequence.

use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

use super::pill::Pill;
use super::pipeline::{Pipeline, TaskHandle};
use crate::backend::{Decoder, ScoringModel};
use crate::config::WAKE_INTERVAL;
use crate::error::CallerError;

/// Claims chunks one at a time from the oldest batch awaiting decode.
///
/// Several threads may work on the same batch; the one claiming its last
/// chunk takes the batch off the queue so no thread can over-claim.
pub(crate) fn decode_loop<M: ScoringModel, D: Decoder>(pipeline: &Pipeline<M, D>) {
    info!("Decode thread started");
    while let Some((_, (task, chunk_idx))) = pipeline.decode_queue.wait_claim(WAKE_INTERVAL, |task| {
        let (chunk_idx, last) = task.claim_chunk();
        ((Arc::clone(task), chunk_idx), last)
    }) {
        decode_chunk(pipeline, &task, chunk_idx);
    }
    info!("Decode thread stopped");
}

fn decode_chunk<M: ScoringModel, D: Decoder>(pipeline: &Pipeline<M, D>, task: &TaskHandle<M>, chunk_idx: usize) {
    // Another thread may hold the last reference; make sure it reports the panic
    let _pill = Pill::new(|| {
        let name = thread::current().name().unwrap_or("decode").to_string();
        task.record_failure(CallerError::WorkerPanicked(name));
    });

    let buffers = pipeline.buffers();
    let decoded = {
        let (split, offset) = buffers.read_chunk(chunk_idx);
        pipeline.decoder.decode(split.chunk(offset), &pipeline.options)
    };
    match decoded {
        Ok(chunk) => task.store(chunk_idx, chunk),
        Err(source) => {
            warn!("Task {} chunk {} failed to decode: {}", task.id(), chunk_idx, source);
            task.record_failure(CallerError::Decode {
                chunk: chunk_idx,
                source,
            });
        }
    }
    pipeline.stats.chunk_decoded();

    // Release the buffers before waking the client
    if task.finish_chunk() {
        pipeline.event.signal(task.completion_id());
        pipeline.complete_task(task);
    }
}
