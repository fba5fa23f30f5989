//! Optimizer shards: per-device optimizer state over one slice of the flat
//! parameter vector.

use crate::distributed::{CollectiveCommunicator, GatherFn, ScatterFn, ShardLayout};
use crate::training::unit::ExecutionUnit;
use crate::utils::checkpoint::{find_item, Item, MASTER_PARAMETERS};
use crate::utils::config::OptimizerConfig;
use crate::utils::error::{Result, TrainingError};
use candle_core::{DType, Device, Tensor};
use std::ops::Range;
use tracing::{debug, warn};

/// Optimizer state owned by one device.
pub trait OptimizerShard: Send {
    /// Names of the per-element states currently held, in save order.
    fn state_names(&self) -> Vec<&'static str>;

    /// One per-element state as a flat f32 vector.
    fn state(&self, name: &str) -> Result<Tensor>;

    fn set_state(&mut self, name: &str, value: Tensor) -> Result<()>;

    /// Every state a checkpoint may carry for this optimizer, including the
    /// ones created lazily.
    fn loadable_states(&self) -> Vec<&'static str> {
        self.state_names()
    }

    /// Bookkeeping shared by all shards (step counts and similar).
    fn scalars(&self) -> Vec<(&'static str, f64)>;

    fn set_scalar(&mut self, name: &str, value: f64);

    /// Apply one step to `params` given summed gradients `grads`. Gradients are
    /// divided by `normalizer` first. Returns the new slice in the dtype of
    /// `params`.
    fn update(&mut self, params: &Tensor, grads: &Tensor, normalizer: f32) -> Result<Tensor>;

    /// Swap the slice `range` of `unit` with the smoothed parameters
    /// (`swap_averaged`) or back to the originals. Repeated calls in the same
    /// direction are no-ops.
    fn swap_with_smoothed(
        &mut self,
        unit: &mut dyn ExecutionUnit,
        range: Range<usize>,
        swap_averaged: bool,
    ) -> Result<()>;
}

/// Serialize the state of all shards into `items`, one item per state.
pub fn save_shard_states(
    shards: &[Box<dyn OptimizerShard>],
    items: &mut Vec<Item>,
    gather: &GatherFn<'_>,
) -> Result<()> {
    let Some(first) = shards.first() else {
        return Ok(());
    };

    for name in first.state_names() {
        let full = gather(&|index: usize| {
            shards
                .get(index)
                .ok_or_else(|| TrainingError::Training(format!("no optimizer shard {}", index)))?
                .state(name)
        })?;
        items.push(Item::new(name, full));
    }

    for (name, value) in first.scalars() {
        items.push(Item::new(name, Tensor::new(&[value], &Device::Cpu)?));
    }
    Ok(())
}

/// Restore shard state from `items`. States not present are left untouched.
pub fn load_shard_states(
    shards: &mut [Box<dyn OptimizerShard>],
    items: &[Item],
    scatter: &ScatterFn<'_>,
) -> Result<()> {
    let names: Vec<&'static str> = shards
        .first()
        .map(|s| s.loadable_states())
        .unwrap_or_default();

    for name in names {
        let Some(item) = find_item(items, name) else {
            debug!(state = name, "Optimizer state not in checkpoint");
            continue;
        };
        let value = item.tensor.to_dtype(DType::F32)?;
        scatter(&value, &mut |index: usize, slice: Tensor| match shards.get_mut(index) {
            Some(shard) => shard.set_state(name, slice),
            None => Err(TrainingError::Training(format!("no optimizer shard {}", index))),
        })?;
    }

    let scalar_names: Vec<&'static str> = shards
        .first()
        .map(|s| s.scalars().into_iter().map(|(n, _)| n).collect())
        .unwrap_or_default();
    for name in scalar_names {
        match find_item(items, name) {
            Some(item) => {
                let value = item.tensor.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
                let value = value.first().copied().unwrap_or_default();
                for shard in shards.iter_mut() {
                    shard.set_scalar(name, value);
                }
            }
            None => warn!(scalar = name, "Optimizer scalar not in checkpoint, keeping current value"),
        }
    }
    Ok(())
}

const ADAM_MT: &str = "adam_mt";
const ADAM_VT: &str = "adam_vt";
const ADAM_STEP: &str = "adam_step";
const EXP_SMOOTHING: &str = "exp_smoothing";

/// Adam over one shard, with optional exponential smoothing of the parameters
/// and an fp32 master copy when the units run in reduced precision.
pub struct AdamShard {
    device: Device,
    len: usize,
    config: OptimizerConfig,
    keep_master: bool,
    step: u64,
    mt: Option<Tensor>,
    vt: Option<Tensor>,
    master: Option<Tensor>,
    smoothed: Option<Tensor>,
    swapped_out: Option<Tensor>,
}

impl AdamShard {
    /// `unit_dtype` decides whether an fp32 master copy is kept.
    pub fn new(device: Device, len: usize, config: OptimizerConfig, unit_dtype: DType) -> Self {
        Self {
            device,
            len,
            config,
            keep_master: unit_dtype != DType::F32,
            step: 0,
            mt: None,
            vt: None,
            master: None,
            smoothed: None,
            swapped_out: None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    fn zeros(&self) -> Result<Tensor> {
        Ok(Tensor::zeros((self.len,), DType::F32, &self.device)?)
    }

    fn check_len(&self, name: &str, value: &Tensor) -> Result<()> {
        if value.dims() != [self.len] {
            warn!(state = name, expected = self.len, "Optimizer state has the wrong size");
            return Err(TrainingError::SizeMismatch {
                context: format!("optimizer state '{}'", name),
                expected: self.len,
                actual: value.elem_count(),
            });
        }
        Ok(())
    }

    fn smoothing(&self) -> f64 {
        self.config.exponential_smoothing
    }
}

impl OptimizerShard for AdamShard {
    fn state_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.mt.is_some() {
            names.push(ADAM_MT);
        }
        if self.vt.is_some() {
            names.push(ADAM_VT);
        }
        if self.smoothing() > 0.0 && self.smoothed.is_some() {
            names.push(EXP_SMOOTHING);
        }
        if self.master.is_some() {
            names.push(MASTER_PARAMETERS);
        }
        names
    }

    fn loadable_states(&self) -> Vec<&'static str> {
        vec![ADAM_MT, ADAM_VT, EXP_SMOOTHING, MASTER_PARAMETERS]
    }

    fn state(&self, name: &str) -> Result<Tensor> {
        let value = match name {
            ADAM_MT => self.mt.clone(),
            ADAM_VT => self.vt.clone(),
            EXP_SMOOTHING => self.smoothed.clone(),
            MASTER_PARAMETERS => self.master.clone(),
            other => {
                return Err(TrainingError::Training(format!("unknown optimizer state '{}'", other)))
            }
        };
        // Moments start at zero; smoothed and master copies have no neutral
        // value before the first update, except on an empty shard.
        match value {
            Some(t) => Ok(t),
            None if self.is_empty() || name == ADAM_MT || name == ADAM_VT => self.zeros(),
            None => Err(TrainingError::Training(format!(
                "optimizer state '{}' requested before the first update",
                name
            ))),
        }
    }

    fn set_state(&mut self, name: &str, value: Tensor) -> Result<()> {
        self.check_len(name, &value)?;
        let value = value.to_device(&self.device)?.to_dtype(DType::F32)?;
        match name {
            ADAM_MT => self.mt = Some(value),
            ADAM_VT => self.vt = Some(value),
            EXP_SMOOTHING => self.smoothed = Some(value),
            MASTER_PARAMETERS => {
                if self.keep_master {
                    self.master = Some(value);
                }
            }
            other => {
                return Err(TrainingError::Training(format!("unknown optimizer state '{}'", other)))
            }
        }
        Ok(())
    }

    fn scalars(&self) -> Vec<(&'static str, f64)> {
        vec![(ADAM_STEP, self.step as f64)]
    }

    fn set_scalar(&mut self, name: &str, value: f64) {
        if name == ADAM_STEP {
            self.step = value.max(0.0) as u64;
        }
    }

    fn update(&mut self, params: &Tensor, grads: &Tensor, normalizer: f32) -> Result<Tensor> {
        let live_dtype = params.dtype();
        let grads = grads.to_device(&self.device)?.to_dtype(DType::F32)?;
        self.check_len("gradient", &grads)?;
        let grads = if normalizer != 1.0 {
            grads.affine(1.0 / normalizer as f64, 0.0)?
        } else {
            grads
        };

        let current = match (&self.master, self.keep_master) {
            (Some(master), true) => master.clone(),
            _ => params.to_device(&self.device)?.to_dtype(DType::F32)?,
        };

        let OptimizerConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            ..
        } = self.config;

        self.step += 1;
        let t = self.step as i32;
        let mt = match &self.mt {
            Some(m) => m.clone(),
            None => self.zeros()?,
        };
        let vt = match &self.vt {
            Some(v) => v.clone(),
            None => self.zeros()?,
        };

        let mt = (mt.affine(beta1, 0.0)? + grads.affine(1.0 - beta1, 0.0)?)?;
        let vt = (vt.affine(beta2, 0.0)? + grads.sqr()?.affine(1.0 - beta2, 0.0)?)?;
        let m_hat = mt.affine(1.0 / (1.0 - beta1.powi(t)), 0.0)?;
        let v_hat = vt.affine(1.0 / (1.0 - beta2.powi(t)), 0.0)?;
        let step = (m_hat / v_hat.sqrt()?.affine(1.0, epsilon)?)?;
        let updated = (current - step.affine(learning_rate, 0.0)?)?;

        self.mt = Some(mt);
        self.vt = Some(vt);

        let decay = self.smoothing();
        if decay > 0.0 {
            self.smoothed = Some(match &self.smoothed {
                Some(avg) => (avg.affine(decay, 0.0)? + updated.affine(1.0 - decay, 0.0)?)?,
                None => updated.clone(),
            });
        }

        if self.keep_master {
            self.master = Some(updated.clone());
        }
        Ok(updated.to_dtype(live_dtype)?)
    }

    fn swap_with_smoothed(
        &mut self,
        unit: &mut dyn ExecutionUnit,
        range: Range<usize>,
        swap_averaged: bool,
    ) -> Result<()> {
        if self.smoothing() <= 0.0 {
            return Ok(());
        }

        if swap_averaged {
            if self.swapped_out.is_some() {
                return Ok(());
            }
            let Some(smoothed) = self.smoothed.clone() else {
                debug!("No smoothed parameters yet, nothing to swap");
                return Ok(());
            };
            let original = unit.parameter_range(range.clone())?;
            unit.set_parameter_range(range, &smoothed)?;
            self.swapped_out = Some(original);
        } else if let Some(original) = self.swapped_out.take() {
            unit.set_parameter_range(range, &original)?;
        }
        Ok(())
    }
}

/// One Adam shard per unit, sized by the unit's local shard range and
/// living on the unit's device.
pub fn init_adam_shards(
    config: &OptimizerConfig,
    units: &[Box<dyn ExecutionUnit>],
    communicator: &dyn CollectiveCommunicator,
) -> Vec<Box<dyn OptimizerShard>> {
    let total = units.first().map(|u| u.num_parameters()).unwrap_or(0);
    let layout = ShardLayout::new(total, units.len(), communicator);
    units
        .iter()
        .enumerate()
        .map(|(index, unit)| {
            let len = layout.local_range(index).len();
            debug!(shard = layout.global_index(index), len, "Created optimizer shard");
            Box::new(AdamShard::new(unit.device().clone(), len, config.clone(), unit.dtype()))
                as Box<dyn OptimizerShard>
        })
        .collect()
}
