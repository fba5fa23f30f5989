#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use replica_trainer::training::unit::{Batch, ExecutionUnit};
use replica_trainer::utils::checkpoint::{load_items, save_items, Item};
use replica_trainer::utils::config::CoordinatorConfig;
use replica_trainer::{Result, TrainingError};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Deterministic unit for coordinator tests.
///
/// The gradient of every parameter is `scaled loss * (i + 1) / n`, so it
/// carries the cost scale through exactly. Fits iff `size * longest stream`
/// stays within `budget` tokens.
pub struct MockUnit {
    device: Device,
    dtype: DType,
    pub params: Option<Tensor>,
    pub n: usize,
    pub budget: usize,
    pub poison: Arc<AtomicBool>,
    batch: Option<Batch>,
    grads: Option<Tensor>,
    throw_nan: bool,
}

impl MockUnit {
    pub fn new(n: usize, budget: usize) -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
            params: None,
            n,
            budget,
            poison: Arc::new(AtomicBool::new(false)),
            batch: None,
            grads: None,
            throw_nan: true,
        }
    }

    pub fn with_poison(mut self, poison: Arc<AtomicBool>) -> Self {
        self.poison = poison;
        self
    }

    /// Hold parameters in `dtype`; gradients stay f32.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn initial_values(&self) -> Result<Vec<f32>> {
        Ok(self.initial()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }

    fn initial(&self) -> Result<Tensor> {
        Ok(Tensor::arange(0u32, self.n as u32, &Device::Cpu)?
            .to_dtype(DType::F32)?
            .affine(0.01, 0.5)?
            .to_dtype(self.dtype)?)
    }
}

impl ExecutionUnit for MockUnit {
    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn build(&mut self, batch: &Batch) -> Result<()> {
        self.batch = Some(batch.clone());
        Ok(())
    }

    fn fits(&self) -> bool {
        match &self.batch {
            Some(b) => b.size * b.stream_lengths.iter().copied().max().unwrap_or(0) <= self.budget,
            None => true,
        }
    }

    fn forward(&mut self) -> Result<Option<Tensor>> {
        if self.params.is_none() {
            self.params = Some(self.initial()?);
        }
        match &self.batch {
            Some(b) => Ok(Some(Tensor::new(b.target_words as f32 * 0.5, &Device::Cpu)?)),
            None => Ok(None),
        }
    }

    fn backward(&mut self, loss: &Tensor) -> Result<()> {
        let value = loss.to_scalar::<f32>()?;
        let weights = Tensor::arange(1u32, self.n as u32 + 1, &Device::Cpu)?
            .to_dtype(DType::F32)?
            .affine(1.0 / self.n as f64, 0.0)?;
        let mut grads = weights.affine(value as f64, 0.0)?;
        if self.poison.load(Ordering::SeqCst) {
            let mut v = grads.to_vec1::<f32>()?;
            v[0] = f32::NAN;
            grads = Tensor::new(v, &Device::Cpu)?;
        }
        self.grads = Some(grads);
        Ok(())
    }

    fn clear(&mut self) {
        self.batch = None;
        self.grads = None;
    }

    fn throw_nan(&self) -> bool {
        self.throw_nan
    }

    fn set_throw_nan(&mut self, throw: bool) {
        self.throw_nan = throw;
    }

    fn num_parameters(&self) -> usize {
        self.n
    }

    fn is_materialized(&self) -> bool {
        self.params.is_some()
    }

    fn parameters(&self) -> Result<Tensor> {
        self.params
            .clone()
            .ok_or_else(|| TrainingError::Training("not materialized".into()))
    }

    fn set_parameters(&mut self, values: &Tensor) -> Result<()> {
        if values.dims() != [self.n] {
            return Err(TrainingError::SizeMismatch {
                context: "mock parameters".into(),
                expected: self.n,
                actual: values.elem_count(),
            });
        }
        self.params = Some(values.to_dtype(self.dtype)?);
        Ok(())
    }

    fn gradients(&self) -> Result<Tensor> {
        self.grads
            .clone()
            .ok_or_else(|| TrainingError::Training("no gradients".into()))
    }

    fn load(&mut self, path: &Path, strict: bool) -> Result<()> {
        let (items, _) = load_items(path, &Device::Cpu)?;
        match items.iter().find(|i| i.name == "weights") {
            Some(item) if item.tensor.dims() == [self.n] => {
                self.params = Some(item.tensor.to_dtype(self.dtype)?);
                Ok(())
            }
            Some(item) if strict => Err(TrainingError::ShapeMismatch {
                live: vec![self.n],
                checkpoint: item.tensor.dims().to_vec(),
            }),
            None if strict => Err(TrainingError::Checkpoint("weights missing".into())),
            _ => Ok(()),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        save_items(&[Item::new("weights", self.parameters()?)], path, None)
    }
}

pub fn mock_units(count: usize, n: usize) -> Vec<Box<dyn ExecutionUnit>> {
    (0..count)
        .map(|_| Box::new(MockUnit::new(n, 4096)) as Box<dyn ExecutionUnit>)
        .collect()
}

pub fn config_in(dir: &Path, devices: usize) -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.model = dir.join("model.safetensors");
    config.devices = (0..devices).collect();
    config.batching.train_sets = vec!["train.src".into(), "train.trg".into()];
    config
}

pub fn batches(count: usize, size: usize, length: usize) -> Vec<Batch> {
    (0..count).map(|_| Batch::fake(vec![length, length], size)).collect()
}
