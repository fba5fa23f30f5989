//! Shard ranges over the flat parameter vector and the gather / scatter /
//! distribute operations built on them.
//!
//! The flat vector of `total` elements is split first across processes and
//! then across the local devices of each process. Local shard `i` on rank `r`
//! is global shard `r * local_count + i`.

use super::CollectiveCommunicator;
use crate::training::unit::ExecutionUnit;
use crate::utils::error::{Result, TrainingError};
use candle_core::{DType, Device, Tensor};
use std::ops::Range;
use tracing::debug;

/// Collects per-shard state into one tensor. The argument returns the state
/// of a local shard index.
pub type GatherFn<'a> = dyn Fn(&dyn Fn(usize) -> Result<Tensor>) -> Result<Tensor> + 'a;

/// Splits one full tensor back out. The callback receives a local shard
/// index and that shard's slice.
pub type ScatterFn<'a> =
    dyn Fn(&Tensor, &mut dyn FnMut(usize, Tensor) -> Result<()>) -> Result<()> + 'a;

/// Brings every unit back to one consistent full parameter vector after
/// shards changed their slices.
pub type DistributeFn<'a> = dyn Fn(&mut [Box<dyn ExecutionUnit>]) -> Result<()> + 'a;

/// `[begin, end)` of chunk `index` when `total` elements are cut into `count`
/// chunks of `ceil(total / count)`; trailing chunks may be short or empty.
pub fn shard_range(total: usize, index: usize, count: usize) -> Range<usize> {
    let count = count.max(1);
    let size = total.div_ceil(count);
    let begin = (index * size).min(total);
    let end = (begin + size).min(total);
    begin..end
}

/// Placement of local shards within the global flat vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    pub total: usize,
    pub rank: usize,
    pub world_size: usize,
    pub local_count: usize,
}

impl ShardLayout {
    pub fn new(total: usize, local_count: usize, communicator: &dyn CollectiveCommunicator) -> Self {
        Self {
            total,
            rank: communicator.rank(),
            world_size: communicator.world_size().max(1),
            local_count: local_count.max(1),
        }
    }

    /// Layout for a single process.
    pub fn local(total: usize, local_count: usize) -> Self {
        Self {
            total,
            rank: 0,
            world_size: 1,
            local_count: local_count.max(1),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.world_size * self.local_count
    }

    /// Chunk length every process pads its segment to before an all-gather.
    fn process_chunk(&self) -> usize {
        self.total.div_ceil(self.world_size)
    }

    /// Elements owned by this process.
    pub fn process_range(&self) -> Range<usize> {
        shard_range(self.total, self.rank, self.world_size)
    }

    /// Absolute range of local shard `index`.
    pub fn local_range(&self, index: usize) -> Range<usize> {
        let process = self.process_range();
        let inner = shard_range(process.len(), index, self.local_count);
        (process.start + inner.start)..(process.start + inner.end)
    }

    pub fn global_index(&self, index: usize) -> usize {
        self.rank * self.local_count + index
    }

    /// Concatenate local shard states; across processes when `communicator`
    /// spans more than one rank. The result lives on the CPU.
    pub fn gather(
        &self,
        communicator: &dyn CollectiveCommunicator,
        get: &dyn Fn(usize) -> Result<Tensor>,
    ) -> Result<Tensor> {
        let segment = self.process_segment(get)?;
        if self.world_size == 1 {
            return Ok(segment);
        }

        let padded = self.pad_to_chunk(&segment)?;
        let gathered = communicator.all_gather(&padded)?;
        let mut pieces = Vec::with_capacity(self.world_size);
        for rank in 0..self.world_size {
            let range = shard_range(self.total, rank, self.world_size);
            pieces.push(gathered.narrow(0, rank * self.process_chunk(), range.len())?);
        }
        Ok(Tensor::cat(&pieces, 0)?)
    }

    /// Hand every local shard its slice of `full`. With several processes the
    /// writer's copy wins.
    pub fn scatter(
        &self,
        communicator: &dyn CollectiveCommunicator,
        full: &Tensor,
        set: &mut dyn FnMut(usize, Tensor) -> Result<()>,
    ) -> Result<()> {
        let len = full.dim(0)?;
        if len != self.total {
            return Err(TrainingError::SizeMismatch {
                context: "scattered vector".to_string(),
                expected: self.total,
                actual: len,
            });
        }

        let full = if self.world_size > 1 {
            communicator.broadcast(full, 0)?
        } else {
            full.clone()
        };

        for index in 0..self.local_count {
            let range = self.local_range(index);
            set(index, full.narrow(0, range.start, range.len())?)?;
        }
        Ok(())
    }

    /// Make every unit hold the full parameter vector assembled from the
    /// shard each unit owns.
    pub fn distribute(
        &self,
        communicator: &dyn CollectiveCommunicator,
        units: &mut [Box<dyn ExecutionUnit>],
    ) -> Result<()> {
        if units.len() != self.local_count {
            return Err(TrainingError::ShardCountMismatch {
                units: units.len(),
                shards: self.local_count,
            });
        }

        let full = {
            let units: &[Box<dyn ExecutionUnit>] = units;
            self.gather(communicator, &|index: usize| {
                let range = self.local_range(index);
                units[index].parameter_range(range)
            })?
        };

        for unit in units.iter_mut() {
            unit.set_parameters(&full)?;
        }
        debug!(
            total = self.total,
            shards = self.shard_count(),
            "Distributed parameters to all units"
        );
        Ok(())
    }

    fn process_segment(&self, get: &dyn Fn(usize) -> Result<Tensor>) -> Result<Tensor> {
        let mut pieces = Vec::with_capacity(self.local_count);
        for index in 0..self.local_count {
            let piece = get(index)?.flatten_all()?.to_device(&Device::Cpu)?;
            let expected = self.local_range(index).len();
            if piece.dim(0)? != expected {
                return Err(TrainingError::SizeMismatch {
                    context: format!("gathered shard {}", self.global_index(index)),
                    expected,
                    actual: piece.dim(0)?,
                });
            }
            pieces.push(piece);
        }
        Ok(Tensor::cat(&pieces, 0)?)
    }

    fn pad_to_chunk(&self, segment: &Tensor) -> Result<Tensor> {
        let missing = self.process_chunk() - segment.dim(0)?;
        if missing == 0 {
            return Ok(segment.clone());
        }
        let dtype: DType = segment.dtype();
        let pad = Tensor::zeros((missing,), dtype, segment.device())?;
        Ok(Tensor::cat(&[segment, &pad], 0)?)
    }
}
