//! The training coordinator: one execution unit and one optimizer shard per
//! device, plus the process-wide numerics state.

use crate::distributed::{all_reduce_scalar, CollectiveCommunicator, LocalCommunicator, ShardLayout};
use crate::training::batch_fit::{collect_batch_stats, BatchStats};
use crate::training::cost_scale::CostScaler;
use crate::training::grad_norm::{l2_norm, probe_non_finite, GradientNormRescaler};
use crate::training::persistence::PersistencePhase;
use crate::training::optimizer::OptimizerShard;
use crate::training::scheduler::TrainingScheduler;
use crate::training::unit::{Batch, ExecutionUnit};
use crate::utils::config::CoordinatorConfig;
use crate::utils::error::{Result, TrainingError};
use crate::utils::metrics;
use candle_core::{DType, Device, Tensor};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of one [`Coordinator::update`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateOutcome {
    /// Summed loss over all batches, without cost scaling
    pub loss: f32,
    pub target_words: usize,
    /// Raw L2 norm of the summed gradient, NaN when it was not finite
    pub grad_norm: f32,
    /// Divisor applied to the gradient before the optimizer step
    pub normalizer: f32,
    /// False when the update was skipped because of NaN/Inf gradients
    pub applied: bool,
}

pub struct Coordinator {
    pub(crate) config: CoordinatorConfig,
    pub(crate) units: Vec<Box<dyn ExecutionUnit>>,
    pub(crate) shards: Vec<Box<dyn OptimizerShard>>,
    pub(crate) scheduler: Option<Box<dyn TrainingScheduler>>,
    pub(crate) communicator: Arc<dyn CollectiveCommunicator>,
    pub(crate) cost_scaler: CostScaler,
    rescaler: GradientNormRescaler,
    typical_trg_batch_words: f64,
    finalized: bool,
    pub(crate) phase: PersistencePhase,
}

impl Coordinator {
    /// Fails when the number of devices, units and shards disagree. Every
    /// unit aborts on NaN/Inf iff `checks.check_nan` is set.
    pub fn new(
        config: CoordinatorConfig,
        mut units: Vec<Box<dyn ExecutionUnit>>,
        shards: Vec<Box<dyn OptimizerShard>>,
    ) -> Result<Self> {
        config.validate()?;
        if units.len() != config.devices.len() {
            return Err(TrainingError::DeviceCountMismatch {
                devices: config.devices.len(),
                units: units.len(),
            });
        }
        if units.len() != shards.len() {
            return Err(TrainingError::ShardCountMismatch {
                units: units.len(),
                shards: shards.len(),
            });
        }

        for unit in units.iter_mut() {
            unit.set_throw_nan(config.checks.check_nan);
        }

        info!(
            model = %config.model.display(),
            devices = ?config.devices,
            precision = ?config.precision,
            cost_scaling = config.cost_scaling.enabled,
            dynamic_gradient_scaling = config.dynamic_gradient_scaling.enabled,
            normalize_gradient = config.checks.normalize_gradient,
            check_nan = config.checks.check_nan,
            "Training coordinator initialized"
        );

        Ok(Self {
            cost_scaler: CostScaler::new(&config.cost_scaling),
            rescaler: GradientNormRescaler::new(&config.dynamic_gradient_scaling),
            config,
            units,
            shards,
            scheduler: None,
            communicator: Arc::new(LocalCommunicator::single()),
            typical_trg_batch_words: 0.0,
            finalized: false,
            phase: PersistencePhase::Fresh,
        })
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn TrainingScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Join a multi-process group; rank 0 becomes the only writer.
    pub fn with_communicator(mut self, communicator: Arc<dyn CollectiveCommunicator>) -> Self {
        self.communicator = communicator;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn units(&self) -> &[Box<dyn ExecutionUnit>] {
        &self.units
    }

    pub fn shards(&self) -> &[Box<dyn OptimizerShard>] {
        &self.shards
    }

    pub fn scheduler(&self) -> Option<&dyn TrainingScheduler> {
        self.scheduler.as_deref()
    }

    pub fn cost_scaler(&self) -> &CostScaler {
        &self.cost_scaler
    }

    pub fn phase(&self) -> PersistencePhase {
        self.phase
    }

    pub fn is_main_process(&self) -> bool {
        self.communicator.is_main_process()
    }

    pub fn layout(&self) -> ShardLayout {
        let total = self.units.first().map(|u| u.num_parameters()).unwrap_or(0);
        ShardLayout::new(total, self.units.len(), self.communicator.as_ref())
    }

    pub fn increase_cost_scale_factor(&mut self) {
        self.cost_scaler.increase_factor();
    }

    pub fn decrease_cost_scale_factor(&mut self) {
        self.cost_scaler.decrease_factor();
    }

    /// Probe the gradient slice `[begin, end)` of unit `index`.
    ///
    /// NaN when the slice holds NaN/Inf (checked only with gradient checks or
    /// cost scaling on) or, under dynamic scaling, when its norm is not a
    /// positive finite number. Otherwise the norm, or 0 without dynamic scaling.
    pub fn check_nan_or_norm(&self, index: usize, begin: usize, end: usize) -> Result<f32> {
        let unit = self
            .units
            .get(index)
            .ok_or_else(|| TrainingError::Training(format!("no execution unit {}", index)))?;
        let grads = unit.gradient_range(begin..end)?;
        self.nan_or_norm(&grads)
    }

    fn nan_or_norm(&self, grads: &Tensor) -> Result<f32> {
        Ok(match self.slice_norm(grads)? {
            Some(g_norm) if !self.rescaler.is_enabled() || g_norm > 0.0 => g_norm,
            _ => f32::NAN,
        })
    }

    /// `None` when the slice holds NaN/Inf, otherwise its L2 norm (0 without
    /// dynamic scaling). A zero norm is kept so empty or untouched shards do
    /// not poison an update.
    fn slice_norm(&self, grads: &Tensor) -> Result<Option<f32>> {
        if self.config.checks.check_gradient_nan || self.cost_scaler.is_enabled() {
            let (nan, inf) = probe_non_finite(grads)?;
            if nan > 0 || inf > 0 {
                debug!(nan, inf, "Found NaN or Inf in gradient");
                return Ok(None);
            }
        }

        if self.rescaler.is_enabled() {
            let g_norm = l2_norm(grads)?;
            return Ok(g_norm.is_finite().then_some(g_norm));
        }
        Ok(Some(0.0))
    }

    /// Divisor for the summed gradient of one update.
    ///
    /// 1, times the cost-scale factor when scaling is on, times the update's
    /// target words when gradients are normalized, times the outlier
    /// correction of the norm rescaler when it fires.
    pub fn compute_normalization_factor(&self, g_norm: f32, update_trg_words: usize) -> f32 {
        let mut factor = 1.0f32;
        if self.cost_scaler.is_enabled() {
            factor *= self.cost_scaler.factor();
        }
        if self.config.checks.normalize_gradient {
            factor *= update_trg_words as f32;
        }
        if !g_norm.is_finite() {
            return factor;
        }

        let Some(scheduler) = self.scheduler.as_deref() else {
            return factor;
        };
        if !self.rescaler.is_enabled() {
            return factor;
        }
        let stats = if self.rescaler.use_logs() {
            scheduler.log_gradient_norm_stats()
        } else {
            scheduler.gradient_norm_stats()
        };
        if let Some(correction) = self.rescaler.rescale(
            g_norm,
            self.cost_scaler.factor(),
            update_trg_words as f32,
            stats,
            scheduler.number_of_batches(),
        ) {
            metrics::record_rescaled_update();
            factor *= correction;
        }
        factor
    }

    /// One synchronous update over `batches`, spread round-robin over the units.
    pub fn update(&mut self, batches: &[Batch]) -> Result<UpdateOutcome> {
        if self.finalized {
            return Err(TrainingError::Finalized);
        }
        match self.phase {
            PersistencePhase::Fresh | PersistencePhase::Training => {}
            phase => {
                return Err(TrainingError::InvalidPhase {
                    operation: "update",
                    phase: phase.as_str(),
                })
            }
        }
        self.phase = PersistencePhase::Training;

        let layout = self.layout();
        let cost_scale = self.cost_scaler.factor() as f64;

        let mut loss = 0.0f64;
        let mut size = 0usize;
        let mut words = 0usize;
        let mut grad_sum: Option<Tensor> = None;
        let unit_count = self.units.len();

        for (i, batch) in batches.iter().enumerate() {
            let unit = &mut self.units[i % unit_count];
            unit.build(batch)?;
            let unit_loss = unit.forward()?.ok_or_else(|| {
                TrainingError::Training("forward pass on a built batch produced no loss".into())
            })?;
            loss += unit_loss.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;
            unit.backward(&unit_loss.affine(cost_scale, 0.0)?)?;

            let grads = unit.gradients()?.to_device(&Device::Cpu)?;
            grad_sum = Some(match grad_sum {
                Some(sum) => (sum + grads)?,
                None => grads,
            });
            unit.clear();
            size += batch.size;
            words += batch.target_words;
        }

        let Some(mut grads) = grad_sum else {
            return Err(TrainingError::Training("update called without batches".into()));
        };

        let comm = self.communicator.clone();
        if comm.world_size() > 1 {
            grads = comm.all_reduce(&grads)?;
            loss = all_reduce_scalar(loss, comm.as_ref())?;
            words = all_reduce_scalar(words as f64, comm.as_ref())?.round() as usize;
            size = all_reduce_scalar(size as f64, comm.as_ref())?.round() as usize;
        }

        // Every local shard checks its own slice; one bad slice poisons the
        // update. Shard norms combine into the norm of the whole gradient.
        let mut sane = true;
        let mut squared_norm = 0.0f64;
        for index in 0..unit_count {
            let range = layout.local_range(index);
            match self.slice_norm(&grads.narrow(0, range.start, range.len())?)? {
                Some(norm) => squared_norm += (norm as f64).powi(2),
                None => {
                    debug!(shard = layout.global_index(index), "Gradient shard is not finite");
                    sane = false;
                }
            }
        }
        if comm.world_size() > 1 {
            let insane = all_reduce_scalar(if sane { 0.0 } else { 1.0 }, comm.as_ref())?;
            sane = insane == 0.0;
            squared_norm = all_reduce_scalar(squared_norm, comm.as_ref())?;
        }

        let g_norm = if !sane {
            f32::NAN
        } else if self.rescaler.is_enabled() && squared_norm > 0.0 {
            squared_norm.sqrt() as f32
        } else if self.rescaler.is_enabled() {
            f32::NAN
        } else {
            0.0
        };

        let outcome = if sane {
            let normalizer = self.compute_normalization_factor(g_norm, words);
            for (index, (unit, shard)) in self.units.iter_mut().zip(self.shards.iter_mut()).enumerate() {
                let range = layout.local_range(index);
                if range.is_empty() {
                    continue;
                }
                let params = unit.parameter_range(range.clone())?;
                let slice = grads.narrow(0, range.start, range.len())?;
                let updated = shard.update(&params, &slice, normalizer)?;
                unit.set_parameter_range(range, &updated)?;
            }
            layout.distribute(comm.as_ref(), &mut self.units)?;

            let per_word_norm = if g_norm.is_finite() && g_norm > 0.0 && words > 0 {
                Some(g_norm / self.cost_scaler.factor() / words as f32)
            } else {
                None
            };
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.update(loss as f32, size, words, per_word_norm);
            }
            self.cost_scaler.increase_factor();
            UpdateOutcome {
                loss: loss as f32,
                target_words: words,
                grad_norm: g_norm,
                normalizer,
                applied: true,
            }
        } else {
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.update(loss as f32, size, words, None);
            }
            self.cost_scaler.decrease_factor();
            UpdateOutcome {
                loss: loss as f32,
                target_words: words,
                grad_norm: f32::NAN,
                normalizer: f32::NAN,
                applied: false,
            }
        };

        self.update_average_trg_batch_words(words);
        metrics::record_update(
            outcome.loss as f64,
            words as f64,
            (outcome.grad_norm.is_finite() && outcome.grad_norm > 0.0).then_some(outcome.grad_norm as f64),
            !outcome.applied,
        );
        Ok(outcome)
    }

    /// Fails once training is finalized; otherwise runs the scheduler's
    /// validators.
    pub fn validate(&mut self) -> Result<()> {
        if self.finalized {
            return Err(TrainingError::Finalized);
        }
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.validate(&mut self.units, false)?;
        }
        Ok(())
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn typical_trg_batch_words(&self) -> f64 {
        self.typical_trg_batch_words
    }

    pub fn set_typical_trg_batch_words(&mut self, words: usize) {
        self.typical_trg_batch_words = words as f64;
    }

    /// Exponential average, 0.99 old and 0.01 new.
    pub fn update_average_trg_batch_words(&mut self, words: usize) {
        self.typical_trg_batch_words = 0.99 * self.typical_trg_batch_words + 0.01 * words as f64;
    }

    pub fn mini_batch_round_up(&self) -> bool {
        self.config.batching.mini_batch_round_up
    }

    /// Number of parallel input files the data reader has to open.
    pub fn number_of_input_files(&self) -> usize {
        self.config.batching.number_of_input_files()
    }

    /// Batch-fit search on the first unit; sizes are multiplied by `multiplier`.
    pub fn collect_stats(&mut self, multiplier: f64) -> Result<BatchStats> {
        let unit = self
            .units
            .first_mut()
            .ok_or_else(|| TrainingError::Training("no execution units".into()))?;
        collect_batch_stats(unit.as_mut(), &self.config.batching, multiplier)
    }
}
