use crate::buffers::{BufferSet, ChunkGeometry, ChunkView, ScanArgs, SplitBuffers};
use crate::config::{DecoderOptions, DeviceInfo, ModelConfig};
use crate::core::EventWait;
use crate::error::{CallerError, DecodeError, DeviceError};

/// The neural scoring model, bound to one accelerator.
///
/// The model is only driven from the compute thread, so implementations need
/// to be `Send` but not `Sync`.
pub trait ScoringModel: Send + 'static {
    /// A batch of input signal, laid out `[batch, in_chunk_size, num_features]`
    type Input: Send + Sync + 'static;

    /// The in-progress device command returned by [`ScoringModel::forward`]
    type Submission: Submission;

    /// Static shape of the model
    fn config(&self) -> &ModelConfig;

    /// Facts about the device the model runs on
    fn device_info(&self) -> DeviceInfo;

    /// Rebuilds device-side state for a new chunk/batch geometry.
    ///
    /// Called once per configuration, never while batches are in flight.
    fn configure(&mut self, geometry: &ChunkGeometry) -> Result<(), CallerError>;

    /// Input of the configured shape with arbitrary contents, used for
    /// benchmarking batch sizes.
    fn synthetic_input(&self, geometry: &ChunkGeometry) -> Self::Input;

    /// Submits the forward pass, writing packed scores into `buffers`.
    ///
    /// When `wait` is given, the device must not write into `buffers` until
    /// the wait is satisfied: the previous batch's scores are still being
    /// decoded until then. `attempt` counts retries of the same batch.
    fn forward(
        &self,
        input: &Self::Input,
        wait: Option<EventWait<'_>>,
        attempt: u32,
        buffers: &BufferSet,
    ) -> Result<Self::Submission, DeviceError>;
}

/// A forward pass that has been issued but not yet committed.
///
/// The scan kernels are appended per buffer split, then the whole command is
/// committed and awaited by [`Submission::finish`].
pub trait Submission {
    /// Backward scan over the split's scores, filling the backward guides
    fn backward_scan(&mut self, args: &ScanArgs, split: &SplitBuffers);

    /// Forward scan combined with the backward guides, then softmax into
    /// the posteriors
    fn forward_scan_softmax(&mut self, args: &ScanArgs, split: &SplitBuffers);

    /// Commits the command and waits for completion
    fn finish(self, label: &str, attempt: u32) -> Result<(), DeviceError>;
}

/// Result of decoding one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedChunk {
    pub sequence: String,
    pub qstring: String,
    pub moves: Vec<u8>,
}

/// CPU-side sequence decoder.
///
/// Called concurrently from every decode thread.
pub trait Decoder: Send + Sync + 'static {
    fn decode(&self, chunk: ChunkView<'_>, options: &DecoderOptions) -> Result<DecodedChunk, DecodeError>;
}

impl<F> Decoder for F
where
    F: Fn(ChunkView<'_>, &DecoderOptions) -> Result<DecodedChunk, DecodeError> + Send + Sync + 'static,
{
    fn decode(&self, chunk: ChunkView<'_>, options: &DecoderOptions) -> Result<DecodedChunk, DecodeError> {
        self(chunk, options)
    }
}
