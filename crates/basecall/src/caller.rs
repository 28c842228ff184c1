//! The public facade tying the model, the buffers and the worker threads
//! together.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backend::{DecodedChunk, Decoder, ScoringModel};
use crate::buffers::{BufferSet, ChunkGeometry, pad_to};
use crate::config::{BYTES_PER_GB, CallerConfig, DeviceInfo, ModelConfig, RECOMMENDED_HOST_MEMORY_BYTES};
use crate::core::pipeline::Pipeline;
use crate::core::worker::WorkerHandle;
use crate::core::{CallerStats, ChunkResults, Task, run_batch};
use crate::error::CallerError;
use crate::tune::AutoTuner;

/// Asynchronous submission of chunk batches.
///
/// The returned [`ChunkResults`] resolves once every chunk of the batch has
/// been decoded, so callers typically write `caller.call(input, n).await.await`.
#[async_trait]
pub trait ChunkCaller<I> {
    async fn call(&self, input: I, num_chunks: usize) -> ChunkResults;
}

/// Scores batches of signal chunks on an accelerator while a pool of CPU
/// threads decodes the previous batch.
///
/// One compute thread owns the accelerator and submits batches in arrival
/// order. Its output lands in a single reusable [`BufferSet`]; the next batch
/// is only allowed to overwrite it once every chunk of the previous batch has
/// been decoded.
///
/// # Example
///
/// ```ignore
/// let caller = BatchCaller::new(model, decoder, CallerConfig::new(10_000, 0))?;
/// let [batch, samples, features] = caller.input_shape();
/// let chunks = caller.submit(signal_batch, n)?;
/// ```
pub struct BatchCaller<M: ScoringModel, D: Decoder> {
    pipeline: Arc<Pipeline<M, D>>,
    model_config: ModelConfig,
    config: CallerConfig,
    /// Running threads; empty while shut down
    workers: Mutex<Vec<WorkerHandle>>,
}

impl<M: ScoringModel, D: Decoder> BatchCaller<M, D> {
    /// Sizes the buffers, benchmarking a batch size if none is requested,
    /// then starts the compute and decode threads.
    ///
    /// This method:
    /// 1. Warns if the host has less memory than recommended
    /// 2. Picks the batch size: the pinned size padded to the batch quantum,
    ///    or the fastest benchmarked candidate when `config.batch_size` is 0
    /// 3. Configures the model and allocates the shared buffers
    /// 4. Starts one compute thread and the decode pool
    ///
    /// # Parameters
    ///
    /// * `model` - The accelerator-side scoring model
    /// * `decoder` - Turns each chunk's scores into a [`DecodedChunk`]
    /// * `config` - Chunk size, batch size and thread settings
    ///
    /// # Returns
    ///
    /// A running caller, or the configuration, allocation or thread spawn
    /// error that prevented it from starting
    pub fn new(mut model: M, decoder: D, config: CallerConfig) -> Result<Self, CallerError> {
        let device = model.device_info();
        if device.physical_memory_bytes < RECOMMENDED_HOST_MEMORY_BYTES {
            warn!(
                "Less than {} GB of memory available ({} GB); consider reducing the batch size",
                RECOMMENDED_HOST_MEMORY_BYTES / BYTES_PER_GB,
                device.physical_memory_bytes / BYTES_PER_GB
            );
        }

        let model_config = model.config().clone();
        let buffers = configure(&mut model, &config, device, config.chunk_size, config.batch_size)?;
        let pipeline = Arc::new(Pipeline::new(
            model,
            decoder,
            config.decoder_options.clone(),
            config.device_lock.clone(),
            buffers,
        ));
        let workers = pipeline.start(config.decode_thread_count())?;

        Ok(Self {
            pipeline,
            model_config,
            config,
            workers: Mutex::new(workers),
        })
    }

    /// Scores and decodes `num_chunks` chunks, blocking until all of them are
    /// done.
    ///
    /// `input` holds a full batch laid out as [`BatchCaller::input_shape`];
    /// only its first `num_chunks` elements are decoded. Must not be called
    /// from within an async runtime; use [`BatchCaller::submit_async`] there.
    pub fn submit(&self, input: M::Input, num_chunks: usize) -> Result<Vec<DecodedChunk>, CallerError> {
        self.submit_async(input, num_chunks).wait()
    }

    /// Queues a batch and returns immediately with a handle to its results.
    ///
    /// # Parameters
    ///
    /// * `input` - A full batch laid out as [`BatchCaller::input_shape`]
    /// * `num_chunks` - How many leading chunks to decode, at most the batch size
    ///
    /// # Returns
    ///
    /// A [`ChunkResults`] that resolves to the decoded chunks in order. Errors
    /// found before queuing (shut down, failed, too many chunks) resolve it
    /// immediately.
    pub fn submit_async(&self, input: M::Input, num_chunks: usize) -> ChunkResults {
        self.enqueue(input, num_chunks)
            .unwrap_or_else(|err| ChunkResults::ready(Err(err)))
    }

    fn enqueue(&self, input: M::Input, num_chunks: usize) -> Result<ChunkResults, CallerError> {
        if let Some(fatal) = self.pipeline.fatal_error() {
            return Err(fatal);
        }
        if num_chunks == 0 {
            return Ok(ChunkResults::ready(Ok(Vec::new())));
        }
        let batch_size = self.batch_size();
        if num_chunks > batch_size {
            return Err(CallerError::TooManyChunks {
                chunks: num_chunks,
                batch_size,
            });
        }

        let (task, results) = Task::new(input, num_chunks);
        self.pipeline
            .input_queue
            .push(Arc::new(task))
            .map_err(|_| self.pipeline.fatal_error().unwrap_or(CallerError::Terminated))?;
        self.pipeline.stats.task_submitted();
        Ok(results)
    }

    /// Rebuilds the buffers for a new chunk size and batch size.
    ///
    /// Queued work is finished first. A `batch_size` of `0` benchmarks a new
    /// one. On error the caller is left shut down with the model back on the
    /// previous geometry, so [`BatchCaller::restart`] resumes the old
    /// configuration.
    pub fn reconfigure(&self, chunk_size: usize, batch_size: usize) -> Result<(), CallerError> {
        let mut workers = self.lock_workers();
        if let Some(fatal) = self.pipeline.fatal_error() {
            return Err(fatal);
        }
        self.stop(&mut workers);

        let buffers = {
            let mut model = self.pipeline.model.lock().unwrap_or_else(PoisonError::into_inner);
            let device = model.device_info();
            match configure(&mut *model, &self.config, device, chunk_size, batch_size) {
                Ok(buffers) => buffers,
                Err(err) => {
                    // Benchmarking may have left the model on another geometry;
                    // it must match the kept buffers before any restart.
                    let kept = self.pipeline.buffers();
                    if let Err(restore) = model.configure(kept.geometry()) {
                        warn!("Could not restore the previous geometry: {}", restore);
                        self.pipeline.abort(restore);
                    }
                    return Err(err);
                }
            }
        };
        self.pipeline.replace_buffers(buffers);

        self.pipeline.reopen();
        *workers = self.pipeline.start(self.config.decode_thread_count())?;
        Ok(())
    }

    /// Stops accepting work, lets the threads drain what is queued, and
    /// joins them. Calling it again is a no-op.
    pub fn shutdown(&self) {
        let mut workers = self.lock_workers();
        self.stop(&mut workers);
    }

    /// Relaunches the threads after [`BatchCaller::shutdown`], keeping the
    /// buffers. Does nothing if the caller is running.
    ///
    /// A caller that hit a fatal error stays failed and returns that error.
    pub fn restart(&self) -> Result<(), CallerError> {
        let mut workers = self.lock_workers();
        if let Some(fatal) = self.pipeline.fatal_error() {
            return Err(fatal);
        }
        if !self.pipeline.input_queue.is_terminated() {
            return Ok(());
        }
        self.stop(&mut workers);
        self.pipeline.reopen();
        *workers = self.pipeline.start(self.config.decode_thread_count())?;
        info!("Caller restarted");
        Ok(())
    }

    pub fn sample_stats(&self) -> CallerStats {
        self.pipeline.sample_stats()
    }

    pub fn geometry(&self) -> ChunkGeometry {
        *self.pipeline.buffers().geometry()
    }

    /// `[batch_size, chunk_size, num_features]` of the input batches
    pub fn input_shape(&self) -> [usize; 3] {
        let geometry = self.geometry();
        [geometry.batch_size, geometry.in_chunk_size, self.model_config.num_features]
    }

    pub fn batch_size(&self) -> usize {
        self.geometry().batch_size
    }

    /// Input samples per chunk
    pub fn chunk_size(&self) -> usize {
        self.geometry().in_chunk_size
    }

    fn stop(&self, workers: &mut Vec<WorkerHandle>) {
        self.pipeline.input_queue.terminate();
        for mut worker in workers.drain(..) {
            worker.join();
            debug!("Joined {}", worker.name());
        }
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<M: ScoringModel, D: Decoder> Drop for BatchCaller<M, D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl<M: ScoringModel, D: Decoder> ChunkCaller<M::Input> for BatchCaller<M, D> {
    async fn call(&self, input: M::Input, num_chunks: usize) -> ChunkResults {
        self.submit_async(input, num_chunks)
    }
}

/// Picks the batch size, then configures the model and allocates buffers for
/// it. Only called while no worker threads are running.
fn configure<M: ScoringModel>(
    model: &mut M,
    config: &CallerConfig,
    device: DeviceInfo,
    chunk_size: usize,
    batch_size: usize,
) -> Result<BufferSet, CallerError> {
    let model_config = model.config().clone();
    let batch_size = if batch_size == 0 {
        benchmark_batch_size(model, config, device, chunk_size)?
    } else {
        pad_to(batch_size, device.batch_quantum)
    };

    let geometry = ChunkGeometry::new(
        &model_config,
        chunk_size,
        batch_size,
        device.batch_quantum,
        config.max_buffer_bytes,
    )?;
    let buffers = BufferSet::allocate(geometry, &model_config)?;
    model.configure(&geometry)?;
    info!(
        "Batch size {}, chunk size {} ({} splits of {})",
        geometry.batch_size, geometry.in_chunk_size, geometry.split_count, geometry.split_batch_size
    );
    Ok(buffers)
}

/// Times one batch per candidate size on synthetic input and keeps the
/// cheapest per chunk. A candidate the device rejects is never chosen over
/// one that ran.
fn benchmark_batch_size<M: ScoringModel>(
    model: &mut M,
    config: &CallerConfig,
    device: DeviceInfo,
    chunk_size: usize,
) -> Result<usize, CallerError> {
    let model_config = model.config().clone();
    let tuner = AutoTuner::new(device, config.memory_limit_fraction);
    let candidates = tuner.candidates(AutoTuner::decode_bytes_per_element(&model_config, chunk_size));
    let benchmark_chunk_size = AutoTuner::benchmark_chunk_size(&model_config, chunk_size);

    let batch_size = tuner.select(&candidates, |batch_size| {
        let geometry = ChunkGeometry::new(
            &model_config,
            benchmark_chunk_size,
            batch_size,
            device.batch_quantum,
            config.max_buffer_bytes,
        )?;
        let buffers = BufferSet::allocate(geometry, &model_config)?;
        model.configure(&geometry)?;
        let input = model.synthetic_input(&geometry);

        let start = Instant::now();
        match run_batch(&*model, &input, None, 0, &buffers, &config.device_lock) {
            Ok(()) => Ok(start.elapsed()),
            Err(err) => {
                warn!("Benchmark of batch size {} failed: {}", batch_size, err);
                Ok(Duration::MAX)
            }
        }
    })?;
    info!("Auto batch size selected: {}", batch_size);
    Ok(batch_size)
}
