//! # Basecall
//!
//! Batched accelerator inference with overlapped CPU decoding, for turning a
//! stream of fixed-size signal chunks into sequence.
//!
//! ## Overview
//!
//! A neural scoring model runs on an accelerator over whole batches of
//! chunks; a CPU decoder then turns each chunk's scores into a sequence, a
//! quality string and a move table. Both stages are expensive, so this crate
//! keeps them busy at the same time: while the decode threads work through
//! batch `N`, the accelerator is already queued to score batch `N + 1`.
//!
//! Key components include:
//!
//! - [`BatchCaller`], the facade clients submit batches to
//! - a single compute thread that owns accelerator submission, with retries
//! - a pool of decode threads sharing the work of each finished batch
//! - a fixed [`BufferSet`](buffers::BufferSet) reused for every batch
//! - an [`AutoTuner`](tune::AutoTuner) that picks a batch size by benchmark
//!
//! ## Architecture
//!
//! ### Collaborators
//!
//! The model and decoder are supplied by the user through the
//! [`ScoringModel`], [`Submission`](backend::Submission) and [`Decoder`]
//! traits. The crate never depends on a particular device API or decoding
//! algorithm.
//!
//! ### Buffer reuse
//!
//! Output buffers are allocated once per chunk/batch geometry. Every batch
//! gets a completion id; the accelerator must not write batch `N` until the
//! decode pool has signaled `N - 1` on the [`CompletionEvent`](core::CompletionEvent).
//!
//! ### Failure
//!
//! Transient device failures are retried a few times. Running out of
//! retries, or a worker thread panicking, fails the caller: every waiting
//! client gets the error and later submissions fail fast. A chunk the decoder
//! rejects only fails the submission it belongs to.
//!

pub mod backend;
pub mod buffers;
mod caller;
pub mod config;
pub mod core;
pub mod error;
pub mod tune;

pub use backend::{DecodedChunk, Decoder, ScoringModel};
pub use caller::{BatchCaller, ChunkCaller};
pub use config::{CallerConfig, DecoderOptions, DeviceInfo, DeviceLock, ModelConfig};
pub use crate::core::{CallerStats, ChunkResults, TaskResult};
pub use error::{CallerError, DecodeError, DeviceError};
