//! Error types for the caller.
//!
//! [`DeviceError`] and [`DecodeError`] are produced by the collaborators
//! (accelerator and decoder). [`CallerError`] is what clients of
//! [`BatchCaller`](crate::BatchCaller) see; it is `Clone` because a single
//! fatal condition is delivered to every client waiting at the time.

use thiserror::Error;

/// Transient failure reported by the accelerator while building or
/// committing a submission. The compute thread retries these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// A command submission issued by the forward pass was rejected
    #[error("Forward submission failed: {0}")]
    Submission(String),
    /// The scan/softmax command buffer did not complete
    #[error("Command buffer '{label}' failed: {reason}")]
    CommandBuffer {
        label: String,
        reason: String,
    },
}

/// Failure reported by a [`Decoder`](crate::backend::Decoder) for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Decoding failed: {0}")]
pub struct DecodeError(pub String);

/// Errors surfaced by [`BatchCaller`](crate::BatchCaller).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallerError {
    /// Chunk or batch geometry cannot satisfy the buffer invariants
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Buffer allocation failed; the memory budget is misconfigured
    #[error("Failed to allocate {bytes} bytes for {buffer} buffers")]
    Allocation {
        buffer: &'static str,
        bytes: usize,
    },

    /// Every submission attempt for a batch failed
    #[error("Failed to successfully submit accelerator command buffers after {attempts} attempts")]
    SubmissionFailed {
        attempts: u32,
    },

    /// The decoder rejected a chunk of the task
    #[error("Chunk {chunk} of task failed to decode: {source}")]
    Decode {
        chunk: usize,
        #[source]
        source: DecodeError,
    },

    /// A submission holds more chunks than one batch
    #[error("Task of {chunks} chunks exceeds the batch size {batch_size}")]
    TooManyChunks {
        chunks: usize,
        batch_size: usize,
    },

    /// A worker thread panicked and the pipeline was torn down
    #[error("Worker thread '{0}' panicked")]
    WorkerPanicked(String),

    /// A worker thread could not be spawned
    #[error("Failed to spawn worker thread: {0}")]
    ThreadSpawnFailed(String),

    /// The caller was shut down before the task could complete
    #[error("Caller has been shut down")]
    Terminated,
}

impl CallerError {
    /// Whether this error leaves the caller unable to accept further work.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallerError::SubmissionFailed { .. } | CallerError::WorkerPanicked(_)
        )
    }
}
