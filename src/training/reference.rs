//! A small candle language model implementing [`ExecutionUnit`].
//!
//! Embedding, tanh, projection back to the vocabulary, trained with summed
//! next-token cross-entropy. Memory use is estimated analytically against a
//! per-device workspace so the batch-fit search has something real to probe.

use crate::training::unit::{Batch, ExecutionUnit};
use crate::utils::checkpoint::{save_items, Item};
use crate::utils::config::CoordinatorConfig;
use crate::utils::error::{Result, TrainingError};
use candle_core::{safetensors, DType, Device, Tensor, Var, D};
use candle_nn::ops;
use std::path::Path;
use tracing::{debug, info, warn};

/// Shape of the reference model.
#[derive(Debug, Clone, Copy)]
pub struct ModelShape {
    pub vocab: usize,
    pub dim: usize,
}

impl Default for ModelShape {
    fn default() -> Self {
        Self { vocab: 256, dim: 32 }
    }
}

/// Pick CUDA device `ordinal` when compiled in and present, otherwise the CPU.
pub fn select_device(ordinal: usize) -> Result<Device> {
    if candle_core::utils::cuda_is_available() {
        info!(ordinal, "Using CUDA device");
        Ok(Device::new_cuda(ordinal)?)
    } else {
        debug!(ordinal, "CUDA unavailable, using CPU");
        Ok(Device::Cpu)
    }
}

/// Summed cross-entropy for next-token prediction.
///
/// `logits` is `(n, vocab)`, `targets` is `(n,)` u32.
pub fn cross_entropy_sum(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let log_probs = ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let target_log_probs = log_probs
        .gather(&targets.to_dtype(DType::U32)?.unsqueeze(1)?, 1)?
        .squeeze(1)?;
    Ok(target_log_probs.neg()?.sum_all()?)
}

struct Parameter {
    name: &'static str,
    shape: (usize, usize),
    var: Var,
}

pub struct CandleExecutionUnit {
    device: Device,
    dtype: DType,
    shape: ModelShape,
    workspace_bytes: usize,
    params: Option<Vec<Parameter>>,
    batch: Option<Batch>,
    loss: Option<Tensor>,
    grads: Option<Tensor>,
    throw_nan: bool,
}

impl CandleExecutionUnit {
    pub fn new(device: Device, dtype: DType, shape: ModelShape, workspace_mb: usize) -> Self {
        Self {
            device,
            dtype,
            shape,
            workspace_bytes: workspace_mb * 1024 * 1024,
            params: None,
            batch: None,
            loss: None,
            grads: None,
            throw_nan: false,
        }
    }

    fn layout(&self) -> [(&'static str, (usize, usize)); 2] {
        [
            ("embedding", (self.shape.vocab, self.shape.dim)),
            ("projection", (self.shape.dim, self.shape.vocab)),
        ]
    }

    /// Deterministic initialisation so every replica starts identical.
    fn init_tensor(&self, offset: usize, shape: (usize, usize)) -> Result<Tensor> {
        let n = shape.0 * shape.1;
        let scale = 1.0 / (shape.0 as f64).sqrt();
        let t = Tensor::arange(offset as u32, (offset + n) as u32, &self.device)?
            .to_dtype(DType::F32)?
            .affine(0.7548776662, 0.0)?
            .sin()?
            .affine(scale, 0.0)?;
        Ok(t.reshape(shape)?.to_dtype(self.dtype)?)
    }

    fn materialize(&mut self) -> Result<()> {
        if self.params.is_some() {
            return Ok(());
        }
        let mut params = Vec::with_capacity(2);
        let mut offset = 0;
        for (name, shape) in self.layout() {
            let var = Var::from_tensor(&self.init_tensor(offset, shape)?)?;
            offset += shape.0 * shape.1;
            params.push(Parameter { name, shape, var });
        }
        debug!(parameters = offset, dtype = ?self.dtype, "Materialized parameters");
        self.params = Some(params);
        Ok(())
    }

    fn params(&self) -> Result<&[Parameter]> {
        self.params.as_deref().ok_or_else(|| {
            TrainingError::Training("parameters are not materialized, run forward first".into())
        })
    }

    fn estimated_bytes(&self, batch: &Batch) -> usize {
        let elem = self.dtype.size_in_bytes();
        // parameters, gradients and two optimizer moments
        let static_bytes = self.num_parameters() * (elem * 2 + 8);
        let tokens: usize = batch.size * batch.stream_lengths.iter().sum::<usize>();
        let activation_bytes = tokens * (self.shape.dim * 3 + self.shape.vocab * 3) * 4;
        static_bytes + activation_bytes
    }

    fn token_ids(&self, batch: &Batch) -> Result<Tensor> {
        if let Some(stream) = batch.data.as_ref().and_then(|d| d.last()) {
            return Ok(stream.to_device(&self.device)?.to_dtype(DType::U32)?);
        }
        let len = batch.target_length().max(1);
        let vocab = self.shape.vocab as u32;
        let ids: Vec<u32> = (0..batch.size * len)
            .map(|i| {
                let (row, col) = ((i / len) as u32, (i % len) as u32);
                (row.wrapping_mul(31) + col.wrapping_mul(7) + 1) % vocab
            })
            .collect();
        Ok(Tensor::from_vec(ids, (batch.size, len), &self.device)?)
    }

    fn compute_loss(&self, batch: &Batch) -> Result<Tensor> {
        let params = self.params()?;
        let (embedding, projection) = (params[0].var.as_tensor(), params[1].var.as_tensor());

        let ids = self.token_ids(batch)?;
        let (rows, len) = ids.dims2()?;
        let (inputs, targets) = if len > 1 {
            (ids.narrow(1, 0, len - 1)?, ids.narrow(1, 1, len - 1)?)
        } else {
            (ids.clone(), ids)
        };
        let n = rows * inputs.dim(1)?;

        let hidden = embedding
            .index_select(&inputs.reshape((n,))?, 0)?
            .tanh()?;
        let logits = hidden.matmul(projection)?;
        cross_entropy_sum(&logits, &targets.reshape((n,))?)
    }
}

impl ExecutionUnit for CandleExecutionUnit {
    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn build(&mut self, batch: &Batch) -> Result<()> {
        self.loss = None;
        self.batch = Some(batch.clone());
        Ok(())
    }

    fn fits(&self) -> bool {
        match &self.batch {
            Some(batch) => self.estimated_bytes(batch) <= self.workspace_bytes,
            None => true,
        }
    }

    fn forward(&mut self) -> Result<Option<Tensor>> {
        self.materialize()?;
        let Some(batch) = self.batch.clone() else {
            return Ok(None);
        };

        let loss = self.compute_loss(&batch)?;
        if self.throw_nan {
            let value = loss.to_scalar::<f32>()?;
            if !value.is_finite() {
                return Err(TrainingError::NonFinite("forward pass".to_string()));
            }
        }
        self.loss = Some(loss.clone());
        Ok(Some(loss))
    }

    fn backward(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        let params = self.params()?;
        let mut flat = Vec::with_capacity(params.len());
        for p in params {
            let g = match grads.get(p.var.as_tensor()) {
                Some(g) => g.to_dtype(DType::F32)?.flatten_all()?,
                None => Tensor::zeros((p.shape.0 * p.shape.1,), DType::F32, &self.device)?,
            };
            flat.push(g);
        }
        self.grads = Some(Tensor::cat(&flat, 0)?);
        Ok(())
    }

    fn clear(&mut self) {
        self.batch = None;
        self.loss = None;
        self.grads = None;
    }

    fn throw_nan(&self) -> bool {
        self.throw_nan
    }

    fn set_throw_nan(&mut self, throw: bool) {
        self.throw_nan = throw;
    }

    fn num_parameters(&self) -> usize {
        self.layout().iter().map(|(_, (r, c))| r * c).sum()
    }

    fn is_materialized(&self) -> bool {
        self.params.is_some()
    }

    fn parameters(&self) -> Result<Tensor> {
        let flat = self
            .params()?
            .iter()
            .map(|p| p.var.as_tensor().flatten_all())
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&flat, 0)?)
    }

    fn set_parameters(&mut self, values: &Tensor) -> Result<()> {
        self.materialize()?;
        let expected = self.num_parameters();
        if values.dims() != [expected] {
            return Err(TrainingError::SizeMismatch {
                context: "flat parameter vector".to_string(),
                expected,
                actual: values.elem_count(),
            });
        }
        let values = values.to_device(&self.device)?.to_dtype(self.dtype)?;
        let params = self.params()?;
        let mut offset = 0;
        for p in params {
            let n = p.shape.0 * p.shape.1;
            p.var.set(&values.narrow(0, offset, n)?.reshape(p.shape)?)?;
            offset += n;
        }
        Ok(())
    }

    fn gradients(&self) -> Result<Tensor> {
        self.grads
            .clone()
            .ok_or_else(|| TrainingError::Training("no gradients, run backward first".into()))
    }

    fn load(&mut self, path: &Path, strict: bool) -> Result<()> {
        if !path.exists() {
            return Err(TrainingError::MissingFile(path.to_path_buf()));
        }
        self.materialize()?;
        let tensors = safetensors::load(path, &self.device)?;
        let params = self.params()?;
        for p in params {
            match tensors.get(p.name) {
                Some(t) if t.dims() == [p.shape.0, p.shape.1] => {
                    p.var.set(&t.to_dtype(self.dtype)?)?;
                }
                Some(t) if strict => {
                    return Err(TrainingError::ShapeMismatch {
                        live: vec![p.shape.0, p.shape.1],
                        checkpoint: t.dims().to_vec(),
                    });
                }
                None if strict => {
                    return Err(TrainingError::Checkpoint(format!(
                        "tensor '{}' missing from {}",
                        p.name,
                        path.display()
                    )));
                }
                _ => warn!(tensor = p.name, model = %path.display(), "Skipping tensor not usable for this model"),
            }
        }
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<()> {
        let items = self
            .params()?
            .iter()
            .map(|p| Item::new(p.name, p.var.as_tensor().clone()))
            .collect::<Vec<_>>();
        save_items(&items, path, None)
    }
}

/// One reference unit per configured device, aborting on NaN/Inf when
/// `checks.check_nan` is set.
pub fn init_units(config: &CoordinatorConfig, shape: ModelShape) -> Result<Vec<Box<dyn ExecutionUnit>>> {
    config
        .devices
        .iter()
        .map(|&ordinal| {
            let device = select_device(ordinal)?;
            let mut unit = CandleExecutionUnit::new(
                device,
                config.precision.dtype(),
                shape,
                config.batching.workspace_mb,
            );
            unit.set_throw_nan(config.checks.check_nan);
            Ok(Box::new(unit) as Box<dyn ExecutionUnit>)
        })
        .collect()
}
