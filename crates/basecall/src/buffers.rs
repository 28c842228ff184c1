//! Output buffer sizing and the shared buffer pool.
//!
//! The accelerator writes three buffers per batch (packed scores, backward
//! scan guides and posteriors) which the decode threads then read chunk by
//! chunk. The same [`BufferSet`] is reused for every batch; ordering between
//! writer and readers is handled by the compute/decode handoff, not by
//! copying.
//!
//! The linear layer output buffer grows with batch size and can exceed what
//! a single allocation may hold, so a batch is split into `split_count`
//! equal pieces, each with its own buffers. The split is the smallest exact
//! divisor of `batch_size / batch_quantum` that keeps the complete linear
//! output per piece within the byte target; this keeps every piece a
//! multiple of the batch quantum.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::error::CallerError;

/// Rounds `value` up to the next multiple of `quantum`.
pub fn pad_to(value: usize, quantum: usize) -> usize {
    value.div_ceil(quantum) * quantum
}

/// Smallest `split` dividing `pieces` with `complete_bytes / split <= max_bytes`,
/// or `pieces` if no smaller divisor qualifies.
pub fn choose_split(complete_bytes: u64, pieces: usize, max_bytes: u64) -> usize {
    (1..pieces)
        .find(|&split| pieces % split == 0 && complete_bytes / split as u64 <= max_bytes)
        .unwrap_or(pieces)
}

/// Chunk and batch dimensions for one buffer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGeometry {
    /// Input samples per chunk, a multiple of the stride
    pub in_chunk_size: usize,
    /// Output time steps per chunk after decimation
    pub out_chunk_size: usize,
    pub batch_size: usize,
    pub batch_quantum: usize,
    /// Number of buffer pieces the batch is spread across
    pub split_count: usize,
    /// Batch elements held by each piece
    pub split_batch_size: usize,
}

impl ChunkGeometry {
    pub fn new(
        model: &ModelConfig,
        chunk_size: usize,
        batch_size: usize,
        batch_quantum: usize,
        max_buffer_bytes: usize,
    ) -> Result<Self, CallerError> {
        if model.stride == 0 || batch_quantum == 0 {
            return Err(CallerError::Config(format!(
                "stride ({}) and batch quantum ({}) must be non-zero",
                model.stride, batch_quantum
            )));
        }
        let out_chunk_size = chunk_size / model.stride;
        if out_chunk_size == 0 {
            return Err(CallerError::Config(format!(
                "chunk size {chunk_size} is shorter than the model stride {}",
                model.stride
            )));
        }
        if batch_size == 0 || batch_size % batch_quantum != 0 {
            return Err(CallerError::Config(format!(
                "batch size {batch_size} is not a positive multiple of {batch_quantum}"
            )));
        }

        let complete_out_bytes = (out_chunk_size as u64)
            .checked_mul(batch_size as u64)
            .and_then(|n| n.checked_mul(model.output_width as u64))
            .and_then(|n| n.checked_mul(size_of::<f32>() as u64))
            .ok_or_else(|| CallerError::Config("linear layer output size overflows".to_string()))?;

        let pieces = batch_size / batch_quantum;
        let split_count = choose_split(complete_out_bytes, pieces, max_buffer_bytes as u64);
        let piece_bytes = complete_out_bytes / split_count as u64;
        if piece_bytes > max_buffer_bytes as u64 {
            warn!(
                "Did not hit linear layer target output size {} - got {}",
                max_buffer_bytes, piece_bytes
            );
        }
        debug!("Linear layer split {}", split_count);

        let split_batch_size = batch_size / split_count;
        debug_assert_eq!(pieces % split_count, 0);
        debug_assert_eq!(split_batch_size % batch_quantum, 0);

        Ok(Self {
            in_chunk_size: out_chunk_size * model.stride,
            out_chunk_size,
            batch_size,
            batch_quantum,
            split_count,
            split_batch_size,
        })
    }

    /// Maps a chunk index within the batch to `(split, offset within split)`.
    pub fn locate(&self, chunk_idx: usize) -> (usize, usize) {
        (chunk_idx / self.split_batch_size, chunk_idx % self.split_batch_size)
    }
}

/// Arguments shared by both scan kernels: `[T, N, Cs]` for one split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanArgs {
    pub out_chunk_size: usize,
    pub batch_size: usize,
    pub state_count: usize,
}

/// A host-visible buffer of fixed shape.
#[derive(Debug)]
pub struct DeviceBuffer<T> {
    shape: [usize; 3],
    data: RwLock<Vec<T>>,
}

impl<T: Copy + Default> DeviceBuffer<T> {
    fn allocate(shape: [usize; 3], name: &'static str) -> Result<Self, CallerError> {
        let len = shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or(CallerError::Allocation {
                buffer: name,
                bytes: usize::MAX,
            })?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| CallerError::Allocation {
                buffer: name,
                bytes: len.saturating_mul(size_of::<T>()),
            })?;
        data.resize(len, T::default());
        Ok(Self {
            shape,
            data: RwLock::new(data),
        })
    }
}

impl<T> DeviceBuffer<T> {
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Buffers for one piece of a split batch.
#[derive(Debug)]
pub struct SplitBuffers {
    /// `[T, N, C]` packed linear layer output
    pub scores: DeviceBuffer<i8>,
    /// `[N, T + 1, Cs]` posteriors
    pub posteriors: DeviceBuffer<i16>,
    /// `[N, T + 1, Cs]` backward scan guides
    pub backward: DeviceBuffer<f32>,
}

impl SplitBuffers {
    fn allocate(geometry: &ChunkGeometry, model: &ModelConfig) -> Result<Self, CallerError> {
        let t = geometry.out_chunk_size;
        let n = geometry.split_batch_size;
        Ok(Self {
            scores: DeviceBuffer::allocate([t, n, model.output_width], "scores")?,
            posteriors: DeviceBuffer::allocate([n, t + 1, model.state_count], "posteriors")?,
            backward: DeviceBuffer::allocate([n, t + 1, model.state_count], "backward")?,
        })
    }

    /// Read access for decoding.
    pub fn read(&self) -> SplitReadGuard<'_> {
        SplitReadGuard {
            shape: self.scores.shape(),
            scores: self.scores.read(),
            posteriors: self.posteriors.read(),
            backward: self.backward.read(),
        }
    }

    /// Write access for the accelerator.
    pub fn write(&self) -> SplitWriteGuard<'_> {
        SplitWriteGuard {
            scores: self.scores.write(),
            posteriors: self.posteriors.write(),
            backward: self.backward.write(),
        }
    }
}

pub struct SplitWriteGuard<'a> {
    pub scores: RwLockWriteGuard<'a, Vec<i8>>,
    pub posteriors: RwLockWriteGuard<'a, Vec<i16>>,
    pub backward: RwLockWriteGuard<'a, Vec<f32>>,
}

pub struct SplitReadGuard<'a> {
    shape: [usize; 3],
    scores: RwLockReadGuard<'a, Vec<i8>>,
    posteriors: RwLockReadGuard<'a, Vec<i16>>,
    backward: RwLockReadGuard<'a, Vec<f32>>,
}

impl SplitReadGuard<'_> {
    /// Views the buffers of the chunk at `offset` within this split.
    pub fn chunk(&self, offset: usize) -> ChunkView<'_> {
        let [t, n, width] = self.shape;
        debug_assert!(offset < n);
        let per_chunk = self.posteriors.len() / n;
        let range = offset * per_chunk..(offset + 1) * per_chunk;
        ChunkView {
            scores: ScoreView {
                data: self.scores.as_slice(),
                offset,
                time_steps: t,
                batch_size: n,
                width,
            },
            backward: &self.backward[range.clone()],
            posteriors: &self.posteriors[range],
        }
    }
}

/// Strided view over one chunk's scores in a `[T, N, C]` buffer.
#[derive(Debug, Clone, Copy)]
pub struct ScoreView<'a> {
    data: &'a [i8],
    offset: usize,
    time_steps: usize,
    batch_size: usize,
    width: usize,
}

impl<'a> ScoreView<'a> {
    pub fn time_steps(&self) -> usize {
        self.time_steps
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Scores for time step `t`.
    pub fn step(&self, t: usize) -> &'a [i8] {
        let start = (t * self.batch_size + self.offset) * self.width;
        &self.data[start..start + self.width]
    }

    pub fn steps(&self) -> impl Iterator<Item = &'a [i8]> + '_ {
        (0..self.time_steps).map(move |t| self.step(t))
    }
}

/// Everything a decoder reads for one chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkView<'a> {
    pub scores: ScoreView<'a>,
    /// `(T + 1) * Cs` backward guides
    pub backward: &'a [f32],
    /// `(T + 1) * Cs` posteriors
    pub posteriors: &'a [i16],
}

/// The reusable pool of output buffers for one geometry.
#[derive(Debug)]
pub struct BufferSet {
    geometry: ChunkGeometry,
    state_count: usize,
    splits: Vec<SplitBuffers>,
}

impl BufferSet {
    /// Allocates `split_count` copies of each buffer. Allocation failure is
    /// reported, not retried.
    pub fn allocate(geometry: ChunkGeometry, model: &ModelConfig) -> Result<Self, CallerError> {
        let splits = (0..geometry.split_count)
            .map(|_| SplitBuffers::allocate(&geometry, model))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            geometry,
            state_count: model.state_count,
            splits,
        })
    }

    pub fn geometry(&self) -> &ChunkGeometry {
        &self.geometry
    }

    pub fn splits(&self) -> &[SplitBuffers] {
        &self.splits
    }

    pub fn scan_args(&self) -> ScanArgs {
        ScanArgs {
            out_chunk_size: self.geometry.out_chunk_size,
            batch_size: self.geometry.split_batch_size,
            state_count: self.state_count,
        }
    }

    /// Locks the split holding `chunk_idx` for reading; returns the guard and
    /// the chunk's offset within it.
    pub fn read_chunk(&self, chunk_idx: usize) -> (SplitReadGuard<'_>, usize) {
        let (split, offset) = self.geometry.locate(chunk_idx);
        (self.splits[split].read(), offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(output_width: usize, state_count: usize) -> ModelConfig {
        ModelConfig {
            stride: 5,
            num_features: 1,
            output_width,
            state_count,
        }
    }

    #[test]
    fn test_pad_to_rounds_up() {
        assert_eq!(pad_to(0, 48), 0);
        assert_eq!(pad_to(1, 48), 48);
        assert_eq!(pad_to(48, 48), 48);
        assert_eq!(pad_to(49, 48), 96);
    }

    #[test]
    fn test_split_always_divides_pieces() {
        for pieces in 1..=64usize {
            for complete in [0u64, 1, 1 << 20, 1 << 29, 1 << 31, 1 << 34, u64::MAX / 2] {
                for max in [1u64, 1 << 16, 1 << 29] {
                    let split = choose_split(complete, pieces, max);
                    assert!(split >= 1 && split <= pieces);
                    assert_eq!(pieces % split, 0, "split {split} does not divide {pieces}");
                    let per_split_batch = pieces / split * 48;
                    assert_eq!(per_split_batch % 48, 0);
                }
            }
        }
    }

    #[test]
    fn test_split_is_smallest_satisfying_divisor() {
        // 12 pieces, 1200 bytes, limit 250: 5 would fit but does not divide, 6 does.
        assert_eq!(choose_split(1200, 12, 250), 6);
        assert_eq!(choose_split(1200, 12, 1200), 1);
        assert_eq!(choose_split(1200, 12, 600), 2);
    }

    #[test]
    fn test_split_falls_back_to_piece_count() {
        assert_eq!(choose_split(1 << 40, 10, 1), 10);
        assert_eq!(choose_split(1 << 40, 1, 1), 1);
    }

    #[test]
    fn test_geometry_scenario() {
        // 2000 samples at stride 5 -> 400 steps; 480 = 10 * 48.
        // complete output = 400 * 480 * 16 * 4 bytes, so half of it fits the limit.
        let config = model(16, 16);
        let complete = 400 * 480 * 16 * 4;
        let geometry = ChunkGeometry::new(&config, 2000, 480, 48, complete / 2).unwrap();
        assert_eq!(geometry.out_chunk_size, 400);
        assert_eq!(geometry.in_chunk_size, 2000);
        assert_eq!(geometry.split_count, 2);
        assert_eq!(geometry.split_batch_size, 240);

        let buffers = BufferSet::allocate(geometry, &config).unwrap();
        assert_eq!(buffers.splits().len(), 2);
        for split in buffers.splits() {
            assert_eq!(split.scores.shape(), [400, 240, 16]);
            assert_eq!(split.posteriors.shape(), [240, 401, 16]);
            assert_eq!(split.backward.shape(), [240, 401, 16]);
        }
    }

    #[test]
    fn test_input_chunk_rounded_to_stride() {
        let geometry = ChunkGeometry::new(&model(4, 4), 2003, 48, 48, MAX_BYTES).unwrap();
        assert_eq!(geometry.out_chunk_size, 400);
        assert_eq!(geometry.in_chunk_size, 2000);
    }

    const MAX_BYTES: usize = 1 << 29;

    #[test]
    fn test_geometry_rejects_bad_batch() {
        let config = model(4, 4);
        assert!(matches!(
            ChunkGeometry::new(&config, 2000, 50, 48, MAX_BYTES),
            Err(CallerError::Config(_))
        ));
        assert!(matches!(
            ChunkGeometry::new(&config, 2000, 0, 48, MAX_BYTES),
            Err(CallerError::Config(_))
        ));
        assert!(matches!(
            ChunkGeometry::new(&config, 3, 48, 48, MAX_BYTES),
            Err(CallerError::Config(_))
        ));
    }

    #[test]
    fn test_locate_chunk() {
        let config = model(16, 16);
        let geometry = ChunkGeometry::new(&config, 2000, 480, 48, 400 * 480 * 16 * 2).unwrap();
        assert_eq!(geometry.locate(0), (0, 0));
        assert_eq!(geometry.locate(239), (0, 239));
        assert_eq!(geometry.locate(240), (1, 0));
        assert_eq!(geometry.locate(479), (1, 239));
    }

    #[test]
    fn test_chunk_view_reads_strided_scores() {
        let config = model(2, 3);
        let geometry = ChunkGeometry::new(&config, 15, 48, 48, MAX_BYTES).unwrap();
        let buffers = BufferSet::allocate(geometry, &config).unwrap();
        {
            let mut guard = buffers.splits()[0].write();
            // scores[t][n][c] = n for every t and c
            for (i, v) in guard.scores.iter_mut().enumerate() {
                *v = ((i / 2) % 48) as i8;
            }
            for (i, v) in guard.posteriors.iter_mut().enumerate() {
                *v = (i / (4 * 3)) as i16;
            }
        }
        let (guard, offset) = buffers.read_chunk(7);
        let view = guard.chunk(offset);
        assert_eq!(view.scores.time_steps(), 3);
        assert!(view.scores.steps().all(|step| step == [7, 7]));
        assert_eq!(view.posteriors.len(), 4 * 3);
        assert!(view.posteriors.iter().all(|&p| p == 7));
        assert_eq!(view.backward.len(), 4 * 3);
    }
}
