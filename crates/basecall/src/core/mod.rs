//! # Pipeline core
//!
//! The threads and shared state behind [`BatchCaller`](crate::BatchCaller).
//!
//! ## Module Structure
//!
//! * `queue` - blocking FIFO work queues with a termination flag, one feeding
//!   the compute thread and one feeding the decode pool
//! * `event` - the [`CompletionEvent`] generation token that keeps the
//!   accelerator from overwriting buffers still being decoded
//! * `task` - one client submission and its [`ChunkResults`] handle
//! * `compute` - the single thread submitting batches to the accelerator
//! * `decode` - the pool of threads decoding chunks of finished batches
//! * `pipeline` - state shared by all of the above, and the failure path
//! * `worker` / `pill` - named thread handles, and teardown on worker panic
//!
//! A batch moves compute -> decode -> client. The compute thread works on one
//! batch at a time; the decode pool may still be finishing the previous one
//! while the next is submitted, which is the overlap the event guards.

mod compute;
mod decode;
mod event;
mod pill;
pub(crate) mod pipeline;
mod queue;
mod stats;
mod task;
pub(crate) mod worker;

pub(crate) use compute::run_batch;
pub use event::{CompletionEvent, EventWait};
pub use stats::CallerStats;
pub(crate) use task::Task;
pub use task::{ChunkResults, TaskResult};
