//! Batch size selection by benchmarking.
//!
//! The largest batch the tuner considers is bounded twice: by memory, so the
//! decode buffers take at most half of the usable budget, and by the device,
//! so no more than one quantum per device core is requested. Below that it
//! samples evenly down to a floor that keeps a quarter of the cores busy, and
//! keeps whichever size is cheapest per batch element.

use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, trace};

use crate::buffers::pad_to;
use crate::config::{BENCHMARK_CHUNK_STRIDES, BENCHMARK_SMALLER_SIZES, BYTES_PER_GB, DeviceInfo, ModelConfig};
use crate::error::CallerError;

#[derive(Debug, Clone)]
pub struct AutoTuner {
    device: DeviceInfo,
    memory_limit_fraction: f32,
}

impl AutoTuner {
    pub fn new(device: DeviceInfo, memory_limit_fraction: f32) -> Self {
        Self {
            device,
            memory_limit_fraction,
        }
    }

    pub fn usable_memory(&self) -> u64 {
        (self.device.physical_memory_bytes as f64 * self.memory_limit_fraction as f64) as u64
    }

    /// Decode buffer bytes needed per batch element: scores, 16-bit
    /// posteriors and 32-bit backward guides for every output step.
    pub fn decode_bytes_per_element(model: &ModelConfig, chunk_size: usize) -> u64 {
        let out_chunk_size = (chunk_size / model.stride) as u64;
        out_chunk_size
            * (model.output_width as u64
                + model.state_count as u64 * size_of::<i16>() as u64
                + model.state_count as u64 * size_of::<f32>() as u64)
    }

    pub fn max_batch_size(&self, decode_bytes_per_element: u64) -> usize {
        let quantum = self.device.batch_quantum;
        let by_memory = self.usable_memory() / (2 * decode_bytes_per_element.max(1));
        let by_memory = usize::try_from(by_memory).unwrap_or(usize::MAX - quantum);
        pad_to(by_memory, quantum).clamp(quantum, quantum * self.device.core_count.max(1))
    }

    pub fn min_batch_size(&self, max_batch_size: usize) -> usize {
        (self.device.batch_quantum * self.device.core_count.max(1) / 4).min(max_batch_size)
    }

    /// Candidate batch sizes in ascending order.
    pub fn candidates(&self, decode_bytes_per_element: u64) -> BTreeSet<usize> {
        let quantum = self.device.batch_quantum;
        let max_batch_size = self.max_batch_size(decode_bytes_per_element);
        let min_batch_size = self.min_batch_size(max_batch_size);
        trace!("max_batch_size {}", max_batch_size);
        trace!("min_batch_size {}", min_batch_size);

        let mut sizes = BTreeSet::from([max_batch_size]);
        let increment =
            (max_batch_size - min_batch_size) as f32 / BENCHMARK_SMALLER_SIZES as f32;
        for i in 0..BENCHMARK_SMALLER_SIZES {
            let size = min_batch_size + (i as f32 * increment) as usize;
            sizes.insert(pad_to(size, quantum));
        }
        sizes
    }

    /// Shorter chunk used while benchmarking.
    pub fn benchmark_chunk_size(model: &ModelConfig, chunk_size: usize) -> usize {
        (chunk_size - chunk_size % model.stride).min(model.stride * BENCHMARK_CHUNK_STRIDES)
    }

    /// Runs `run_batch` for every candidate and returns the size with the
    /// lowest time per batch element. Ties keep the smaller size.
    pub fn select<F>(&self, candidates: &BTreeSet<usize>, mut run_batch: F) -> Result<usize, CallerError>
    where
        F: FnMut(usize) -> Result<Duration, CallerError>,
    {
        debug!(
            "Physical/Usable memory available: {}/{} GB",
            self.device.physical_memory_bytes / BYTES_PER_GB,
            self.usable_memory() / BYTES_PER_GB
        );
        let mut best: Option<(u128, usize)> = None;
        for &batch_size in candidates {
            debug!("Trying batch size {}", batch_size);
            let elapsed = run_batch(batch_size)?;
            let per_element = elapsed.as_nanos() / batch_size as u128;
            debug!(
                "Batch {} us Batch element {} ns",
                elapsed.as_micros(),
                per_element
            );
            if best.is_none_or(|(best_time, _)| per_element < best_time) {
                best = Some((per_element, batch_size));
            }
        }

        let quantum = self.device.batch_quantum;
        let best_batch_size = best.map(|(_, size)| size).unwrap_or(0);
        assert!(best_batch_size >= quantum, "no usable batch size was benchmarked");
        assert_eq!(best_batch_size % quantum, 0);
        Ok(best_batch_size)
    }
}
