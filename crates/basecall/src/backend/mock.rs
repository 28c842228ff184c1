use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::{DecodedChunk, Decoder, ScoringModel, Submission};
use crate::buffers::{BufferSet, ChunkGeometry, ChunkView, ScanArgs, SplitBuffers};
use crate::config::{DecoderOptions, DeviceInfo, ModelConfig};
use crate::core::EventWait;
use crate::error::{CallerError, DecodeError, DeviceError};

/// Tag used for the synthetic benchmark input.
pub const BENCHMARK_TAG: i16 = -1;

/// A batch whose every chunk carries the same generation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockInput(pub i16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Never,
    /// Every forward call is rejected
    AlwaysForward,
    /// The first `n` forward calls are rejected
    FirstForwards(u32),
    /// Every commit of the scan command fails
    AlwaysFinish,
}

/// What the mock accelerator saw.
#[derive(Debug, Default)]
pub struct MockLog {
    /// Tags in the order batches were first submitted
    pub submitted: Mutex<Vec<i16>>,
    /// Forward calls, including retries
    pub forward_calls: AtomicU32,
    /// Scan kernels appended, one per split per scan
    pub scan_kernels: AtomicU32,
    /// Every geometry the model was configured for
    pub configured: Mutex<Vec<ChunkGeometry>>,
}

/// Writes its input tag into every output buffer, after honouring the
/// event wait the way a device would.
pub struct MockModel {
    config: ModelConfig,
    device: DeviceInfo,
    failures: FailureMode,
    delay: Duration,
    pub log: Arc<MockLog>,
}

impl MockModel {
    pub fn new() -> Self {
        Self {
            config: ModelConfig {
                stride: 5,
                num_features: 1,
                output_width: 4,
                state_count: 4,
            },
            device: DeviceInfo::new(4, 64 << 30),
            failures: FailureMode::Never,
            delay: Duration::ZERO,
            log: Arc::new(MockLog::default()),
        }
    }

    pub fn with_failures(mut self, failures: FailureMode) -> Self {
        self.failures = failures;
        self
    }

    /// Time each forward pass takes once its wait is satisfied.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.device = device;
        self
    }
}

impl ScoringModel for MockModel {
    type Input = MockInput;
    type Submission = MockSubmission;

    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn device_info(&self) -> DeviceInfo {
        self.device
    }

    fn configure(&mut self, geometry: &ChunkGeometry) -> Result<(), CallerError> {
        self.log.configured.lock().unwrap().push(*geometry);
        Ok(())
    }

    fn synthetic_input(&self, _geometry: &ChunkGeometry) -> MockInput {
        MockInput(BENCHMARK_TAG)
    }

    fn forward(
        &self,
        input: &MockInput,
        wait: Option<EventWait<'_>>,
        attempt: u32,
        buffers: &BufferSet,
    ) -> Result<MockSubmission, DeviceError> {
        let calls = self.log.forward_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == 0 {
            self.log.submitted.lock().unwrap().push(input.0);
        }
        let rejected = match self.failures {
            FailureMode::AlwaysForward => true,
            FailureMode::FirstForwards(n) => calls <= n,
            _ => false,
        };
        if rejected {
            return Err(DeviceError::Submission(format!("mock rejected call {calls}")));
        }
        if let Some(wait) = wait {
            if !wait.wait() {
                return Err(DeviceError::Submission("wait abandoned".to_string()));
            }
        }

        thread::sleep(self.delay);
        let tag = input.0;
        for split in buffers.splits() {
            let mut guard = split.write();
            guard.scores.fill(tag as i8);
            guard.posteriors.fill(tag);
            guard.backward.fill(tag as f32);
        }
        Ok(MockSubmission {
            fail_finish: self.failures == FailureMode::AlwaysFinish,
            log: self.log.clone(),
        })
    }
}

pub struct MockSubmission {
    fail_finish: bool,
    log: Arc<MockLog>,
}

impl Submission for MockSubmission {
    fn backward_scan(&mut self, _args: &ScanArgs, _split: &SplitBuffers) {
        self.log.scan_kernels.fetch_add(1, Ordering::SeqCst);
    }

    fn forward_scan_softmax(&mut self, _args: &ScanArgs, _split: &SplitBuffers) {
        self.log.scan_kernels.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(self, label: &str, _attempt: u32) -> Result<(), DeviceError> {
        if self.fail_finish {
            return Err(DeviceError::CommandBuffer {
                label: label.to_string(),
                reason: "mock commit failure".to_string(),
            });
        }
        Ok(())
    }
}

/// Reports the generation tag it read as the sequence, after checking the
/// chunk is internally consistent.
#[derive(Default)]
pub struct MockDecoder {
    pub fail_on: Option<i16>,
    pub panic_on: Option<i16>,
    pub delay: Duration,
}

impl MockDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(tag: i16) -> Self {
        Self {
            fail_on: Some(tag),
            ..Self::default()
        }
    }

    pub fn panicking_on(tag: i16) -> Self {
        Self {
            panic_on: Some(tag),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Tag of the chunk, or an error if its buffers disagree.
pub fn read_tag(chunk: &ChunkView<'_>) -> Result<i16, DecodeError> {
    let tag = chunk.posteriors[0];
    let consistent = chunk.posteriors.iter().all(|&p| p == tag)
        && chunk.backward.iter().all(|&b| b == tag as f32)
        && chunk.scores.steps().flatten().all(|&s| s == tag as i8);
    if consistent {
        Ok(tag)
    } else {
        Err(DecodeError(format!("chunk mixes generation {tag} with another")))
    }
}

impl Decoder for MockDecoder {
    fn decode(&self, chunk: ChunkView<'_>, _options: &DecoderOptions) -> Result<DecodedChunk, DecodeError> {
        thread::sleep(self.delay);
        let tag = read_tag(&chunk)?;
        if self.panic_on == Some(tag) {
            panic!("mock decoder panicked on tag {tag}");
        }
        if self.fail_on == Some(tag) {
            return Err(DecodeError(format!("mock decoder rejected tag {tag}")));
        }
        Ok(DecodedChunk {
            sequence: tag.to_string(),
            qstring: "!".repeat(chunk.scores.time_steps()),
            moves: vec![1; chunk.scores.time_steps()],
        })
    }
}
