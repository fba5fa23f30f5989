//! The per-device execution unit contract.
//!
//! One unit is one replica of the model bound to one device. It builds a
//! loss for a batch, runs forward/backward, and exposes its parameters and
//! gradients as flat vectors so the coordinator can shard them.

use crate::utils::error::{Result, TrainingError};
use candle_core::{DType, Device, Tensor};
use std::ops::Range;
use std::path::Path;

/// Shape description of one training batch, with optional token data.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Length of every input stream; the last stream is the target
    pub stream_lengths: Vec<usize>,
    /// Number of sentences
    pub size: usize,
    /// Target labels, normally `size * target length`
    pub target_words: usize,
    /// Token ids per stream, `size x length` u32; synthetic when absent
    pub data: Option<Vec<Tensor>>,
}

impl Batch {
    /// Batch without data, used for memory probing.
    pub fn fake(stream_lengths: Vec<usize>, size: usize) -> Self {
        let target = stream_lengths.last().copied().unwrap_or(0);
        Self {
            target_words: size * target,
            stream_lengths,
            size,
            data: None,
        }
    }

    pub fn with_data(data: Vec<Tensor>) -> Result<Self> {
        let mut stream_lengths = Vec::with_capacity(data.len());
        let mut size = None;
        for stream in &data {
            let (rows, cols) = stream.dims2()?;
            if *size.get_or_insert(rows) != rows {
                return Err(TrainingError::Training(
                    "all streams of a batch need the same number of rows".to_string(),
                ));
            }
            stream_lengths.push(cols);
        }
        let size = size.unwrap_or(0);
        let target = stream_lengths.last().copied().unwrap_or(0);
        Ok(Self {
            target_words: size * target,
            stream_lengths,
            size,
            data: Some(data),
        })
    }

    pub fn target_length(&self) -> usize {
        self.stream_lengths.last().copied().unwrap_or(0)
    }
}

/// A model replica on one device.
pub trait ExecutionUnit: Send {
    fn device(&self) -> &Device;

    /// Numeric type of the live parameters.
    fn dtype(&self) -> DType;

    /// Build the loss graph for `batch`; nothing is computed yet.
    fn build(&mut self, batch: &Batch) -> Result<()>;

    /// Whether the last built graph fits the memory budget.
    fn fits(&self) -> bool;

    /// Materialize parameters and, when a graph is built, compute its summed
    /// loss. An unbuilt unit only allocates parameter storage.
    fn forward(&mut self) -> Result<Option<Tensor>>;

    /// Backpropagate `loss` (already multiplied by any cost scale).
    fn backward(&mut self, loss: &Tensor) -> Result<()>;

    /// Drop the built graph and gradients.
    fn clear(&mut self);

    fn throw_nan(&self) -> bool;

    fn set_throw_nan(&mut self, throw: bool);

    fn num_parameters(&self) -> usize;

    /// Whether parameter storage has been allocated.
    fn is_materialized(&self) -> bool;

    /// All parameters as one flat vector of `dtype()`.
    fn parameters(&self) -> Result<Tensor>;

    /// Overwrite all parameters; `values` is moved and converted as needed.
    fn set_parameters(&mut self, values: &Tensor) -> Result<()>;

    /// Flat f32 gradient of the last backward pass.
    fn gradients(&self) -> Result<Tensor>;

    /// Load weights from a model file. Non-strict loading skips tensors that
    /// are missing or shaped differently.
    fn load(&mut self, path: &Path, strict: bool) -> Result<()>;

    fn save(&self, path: &Path) -> Result<()>;

    fn parameter_range(&self, range: Range<usize>) -> Result<Tensor> {
        Ok(self.parameters()?.narrow(0, range.start, range.len())?)
    }

    fn gradient_range(&self, range: Range<usize>) -> Result<Tensor> {
        Ok(self.gradients()?.narrow(0, range.start, range.len())?)
    }

    fn set_parameter_range(&mut self, range: Range<usize>, values: &Tensor) -> Result<()> {
        let current = self.parameters()?;
        let total = current.dim(0)?;
        let values = values.to_device(current.device())?.to_dtype(current.dtype())?;
        if values.dim(0)? != range.len() || range.end > total {
            return Err(TrainingError::SizeMismatch {
                context: format!("parameter range {}..{} of {}", range.start, range.end, total),
                expected: range.len(),
                actual: values.elem_count(),
            });
        }

        let mut pieces = Vec::with_capacity(3);
        if range.start > 0 {
            pieces.push(current.narrow(0, 0, range.start)?);
        }
        pieces.push(values);
        if range.end < total {
            pieces.push(current.narrow(0, range.end, total - range.end)?);
        }
        let updated = Tensor::cat(&pieces, 0)?;
        self.set_parameters(&updated)
    }
}

/// Restores the NaN-throw switch of a unit when dropped.
pub struct ThrowNanGuard<'a> {
    unit: &'a mut dyn ExecutionUnit,
    previous: bool,
}

impl<'a> ThrowNanGuard<'a> {
    pub fn new(unit: &'a mut dyn ExecutionUnit, throw: bool) -> Self {
        let previous = unit.throw_nan();
        unit.set_throw_nan(throw);
        Self { unit, previous }
    }
}

impl<'a> std::ops::Deref for ThrowNanGuard<'a> {
    type Target = dyn ExecutionUnit + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.unit
    }
}

impl<'a> std::ops::DerefMut for ThrowNanGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.unit
    }
}

impl Drop for ThrowNanGuard<'_> {
    fn drop(&mut self) {
        self.unit.set_throw_nan(self.previous);
    }
}
