//! Caller configuration.
//!
//! Constants here mirror the behaviour the scheduler was tuned for; the
//! [`CallerConfig`] struct carries the per-instance inputs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Scheduling constants
// =============================================================================

/// Native batch granularity of the accelerator's recurrent kernels.
///
/// Every batch size handed to the accelerator is a multiple of this value.
pub const DEFAULT_BATCH_QUANTUM: usize = 48;

/// Target upper bound for any single output buffer.
///
/// Allocations beyond 4GB can fail outright, and the linear layer output
/// grows with batch size, so outputs are split to stay at or below 512MB.
pub const MAX_BUFFER_BYTES: usize = 1 << 29;

/// Number of times a batch is submitted before the failure is fatal.
pub const SUBMIT_ATTEMPTS: u32 = 5;

/// Pause between failed submission attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Periodic wake-up for threads blocked on an empty queue.
pub const WAKE_INTERVAL: Duration = Duration::from_millis(100);

/// Benchmark chunks are capped at this many strides to keep tuning fast.
pub const BENCHMARK_CHUNK_STRIDES: usize = 300;

/// Number of batch sizes the tuner tries between its minimum and maximum.
pub const BENCHMARK_SMALLER_SIZES: usize = 16;

/// Host memory below which a warning is logged at startup.
pub const RECOMMENDED_HOST_MEMORY_BYTES: u64 = 16 * BYTES_PER_GB;

pub const BYTES_PER_GB: u64 = 1 << 30;

/// Scores are packed into bytes; decoding rescales them by this factor.
pub const SCORE_SCALE: f32 = 5.0 / 127.0;

// =============================================================================
// Model and device description
// =============================================================================

/// Static shape of the scoring model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Decimation factor between input samples and output time steps
    pub stride: usize,
    /// Channels per input sample
    pub num_features: usize,
    /// Width of the linear layer output per time step
    pub output_width: usize,
    /// Number of CRF states (`n_base ^ state_len`)
    pub state_count: usize,
}

impl ModelConfig {
    /// Builds a config for a 4-base model with the given state length.
    pub fn with_state_len(stride: usize, num_features: usize, output_width: usize, state_len: u32) -> Self {
        Self {
            stride,
            num_features,
            output_width,
            state_count: 4usize.pow(state_len),
        }
    }
}

/// Facts about the accelerator that bound batch sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Batch granularity; see [`DEFAULT_BATCH_QUANTUM`]
    pub batch_quantum: usize,
    /// Number of parallel compute units (GPU cores)
    pub core_count: usize,
    /// Physical memory visible to the device, in bytes
    pub physical_memory_bytes: u64,
}

impl DeviceInfo {
    pub fn new(core_count: usize, physical_memory_bytes: u64) -> Self {
        Self {
            batch_quantum: DEFAULT_BATCH_QUANTUM,
            core_count,
            physical_memory_bytes,
        }
    }
}

/// Options forwarded unchanged to every decode call.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderOptions {
    pub beam_width: usize,
    pub beam_cut: f32,
    pub blank_score: f32,
    pub q_shift: f32,
    pub q_scale: f32,
    pub score_scale: f32,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            beam_width: 32,
            beam_cut: 100.0,
            blank_score: 2.0,
            q_shift: 0.0,
            q_scale: 1.0,
            score_scale: SCORE_SCALE,
        }
    }
}

// =============================================================================
// Device access lock
// =============================================================================

/// Lock held around every accelerator submission.
///
/// Several callers sharing one physical device must share one `DeviceLock`;
/// concurrent submissions from different callers otherwise fail at the
/// driver level. Clones share the same underlying lock.
#[derive(Debug, Clone, Default)]
pub struct DeviceLock(Arc<Mutex<()>>);

impl DeviceLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inner(&self) -> &Mutex<()> {
        &self.0
    }

    /// Whether two handles guard the same device.
    pub fn same_device(&self, other: &DeviceLock) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// =============================================================================
// Caller configuration
// =============================================================================

/// Per-instance configuration for [`BatchCaller`](crate::BatchCaller).
#[derive(Debug, Clone)]
pub struct CallerConfig {
    /// Input samples per chunk; rounded down to a multiple of the stride
    pub chunk_size: usize,
    /// Requested batch size, `0` selects one by benchmarking
    pub batch_size: usize,
    /// Fraction of physical memory the tuner may budget for
    pub memory_limit_fraction: f32,
    /// Upper bound on a single output buffer
    pub max_buffer_bytes: usize,
    /// Overrides the number of decode threads
    pub decode_threads: Option<usize>,
    pub decoder_options: DecoderOptions,
    pub device_lock: DeviceLock,
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            batch_size: 0,
            memory_limit_fraction: 1.0,
            max_buffer_bytes: MAX_BUFFER_BYTES,
            decode_threads: None,
            decoder_options: DecoderOptions::default(),
            device_lock: DeviceLock::new(),
        }
    }
}

impl CallerConfig {
    pub fn new(chunk_size: usize, batch_size: usize) -> Self {
        Self {
            chunk_size,
            batch_size,
            ..Self::default()
        }
    }

    pub fn with_memory_limit_fraction(mut self, fraction: f32) -> Self {
        self.memory_limit_fraction = fraction;
        self
    }

    pub fn with_max_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }

    pub fn with_decode_threads(mut self, threads: usize) -> Self {
        self.decode_threads = Some(threads);
        self
    }

    pub fn with_decoder_options(mut self, options: DecoderOptions) -> Self {
        self.decoder_options = options;
        self
    }

    /// Shares a device lock with other callers on the same accelerator.
    pub fn with_device_lock(mut self, lock: DeviceLock) -> Self {
        self.device_lock = lock;
        self
    }

    /// Number of decode threads: one fewer than the performance cores,
    /// leaving a core for the compute thread, and never fewer than one.
    pub fn decode_thread_count(&self) -> usize {
        match self.decode_threads {
            Some(threads) => threads.max(1),
            None => {
                let cores = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                cores.saturating_sub(1).max(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_count_from_state_len() {
        let config = ModelConfig::with_state_len(5, 1, 4096, 5);
        assert_eq!(config.state_count, 1024);
    }

    #[test]
    fn test_decode_threads_never_zero() {
        let config = CallerConfig::default().with_decode_threads(0);
        assert_eq!(config.decode_thread_count(), 1);
        assert!(CallerConfig::default().decode_thread_count() >= 1);
    }

    #[test]
    fn test_device_lock_clones_share_device() {
        let lock = DeviceLock::new();
        let shared = lock.clone();
        assert!(lock.same_device(&shared));
        assert!(!lock.same_device(&DeviceLock::new()));
    }
}
