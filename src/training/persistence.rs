//! Saving and restoring a consistent training state: model weights on every
//! unit, optimizer shards, and scheduler progress.
//!
//! Every participant runs the same sequence so the collectives inside the
//! gather/scatter/distribute callables line up; only the main process writes.

use crate::distributed::{all_reduce_scalar, CollectiveCommunicator, DistributeFn, GatherFn, ScatterFn};
use crate::training::coordinator::Coordinator;
use crate::training::optimizer::{load_shard_states, save_shard_states, OptimizerShard};
use crate::training::scheduler::TrainingScheduler;
use crate::training::unit::ExecutionUnit;
use crate::utils::checkpoint::{
    checkpoint_path, find_item, load_items, save_items, snapshot_path, Item, MASTER_PARAMETERS,
};
use crate::utils::config::CoordinatorConfig;
use crate::utils::error::{Result, TrainingError};
use crate::utils::metrics;
use candle_core::{DType, Device, Tensor};
use std::ops::Range;
use std::time::Instant;
use tracing::{error, info, warn};

/// Where a run is with respect to persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistencePhase {
    /// Nothing restored yet
    Fresh,
    Restoring,
    Training,
    Saving,
}

impl PersistencePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistencePhase::Fresh => "fresh",
            PersistencePhase::Restoring => "restoring",
            PersistencePhase::Training => "training",
            PersistencePhase::Saving => "saving",
        }
    }
}

/// Units hold smoothed parameters while this is alive; dropping it without
/// [`SmoothedSwap::finish`] swaps the originals back.
pub struct SmoothedSwap<'a> {
    units: &'a mut [Box<dyn ExecutionUnit>],
    shards: &'a mut [Box<dyn OptimizerShard>],
    ranges: Vec<Range<usize>>,
    distribute: &'a DistributeFn<'a>,
    active: bool,
}

impl<'a> SmoothedSwap<'a> {
    pub fn begin(
        units: &'a mut [Box<dyn ExecutionUnit>],
        shards: &'a mut [Box<dyn OptimizerShard>],
        ranges: Vec<Range<usize>>,
        distribute: &'a DistributeFn<'a>,
    ) -> Result<Self> {
        if units.len() != shards.len() || units.len() != ranges.len() {
            return Err(TrainingError::ShardCountMismatch {
                units: units.len(),
                shards: shards.len(),
            });
        }
        let mut swap = Self {
            units,
            shards,
            ranges,
            distribute,
            active: true,
        };
        swap.swap(true)?;
        Ok(swap)
    }

    pub fn units(&mut self) -> &mut [Box<dyn ExecutionUnit>] {
        &mut *self.units
    }

    /// Swap the original parameters back in.
    pub fn finish(mut self) -> Result<()> {
        self.active = false;
        self.swap(false)
    }

    fn swap(&mut self, to_smoothed: bool) -> Result<()> {
        for ((unit, shard), range) in self
            .units
            .iter_mut()
            .zip(self.shards.iter_mut())
            .zip(self.ranges.iter())
        {
            shard.swap_with_smoothed(unit.as_mut(), range.clone(), to_smoothed)?;
        }
        (self.distribute)(&mut *self.units)
    }
}

impl Drop for SmoothedSwap<'_> {
    fn drop(&mut self) {
        if self.active {
            self.active = false;
            if let Err(e) = self.swap(false) {
                error!(error = %e, "Failed to swap original parameters back in");
            }
        }
    }
}

/// Make a step that only some ranks run fail on every rank, so the whole
/// group leaves the save sequence at the same point.
fn agree(communicator: &dyn CollectiveCommunicator, result: Result<()>, step: &str) -> Result<()> {
    let failed = all_reduce_scalar(if result.is_err() { 1.0 } else { 0.0 }, communicator)?;
    match result {
        Ok(()) if failed > 0.0 => Err(TrainingError::Distributed(format!(
            "{} failed on another process",
            step
        ))),
        other => other,
    }
}

/// Write the model file (and a numbered snapshot unless overwriting or final)
/// plus scheduler progress.
fn write_model(
    config: &CoordinatorConfig,
    unit: &dyn ExecutionUnit,
    scheduler: Option<&dyn TrainingScheduler>,
    is_final: bool,
) -> Result<()> {
    let model = &config.model;
    if !config.persistence.overwrite && !is_final {
        let snapshot = match scheduler {
            Some(s) => snapshot_path(model, s.number_of_batches()),
            None => {
                let mut name = model.clone().into_os_string();
                name.push(".iterunknown");
                name.into()
            }
        };
        unit.save(&snapshot)?;
        info!(snapshot = %snapshot.display(), "Saved numbered model snapshot");
    }

    unit.save(model)?;
    if let Some(s) = scheduler {
        s.save(model)?;
    }
    info!(model = %model.display(), is_final, "Saved model");
    Ok(())
}

impl Coordinator {
    fn local_ranges(&self) -> Vec<Range<usize>> {
        let layout = self.layout();
        (0..self.units.len()).map(|i| layout.local_range(i)).collect()
    }

    /// Restore using the standard scatter over this coordinator's shard layout.
    pub fn load(&mut self) -> Result<()> {
        let layout = self.layout();
        let comm = self.communicator.clone();
        let scatter = move |full: &Tensor, set: &mut dyn FnMut(usize, Tensor) -> Result<()>| {
            layout.scatter(comm.as_ref(), full, set)
        };
        self.load_with(&scatter)
    }

    /// Restore weights, optimizer state and progress.
    ///
    /// With reloading enabled and an existing model file, everything is
    /// restored from it and its checkpoint. Otherwise the units are seeded from
    /// the pretrained model when one is configured, or keep their initial
    /// weights.
    pub fn load_with(&mut self, scatter: &ScatterFn<'_>) -> Result<()> {
        if self.phase != PersistencePhase::Fresh {
            return Err(TrainingError::InvalidPhase {
                operation: "load",
                phase: self.phase.as_str(),
            });
        }
        let start = Instant::now();
        let model = self.config.model.clone();

        if !self.config.persistence.no_reload && model.exists() {
            self.phase = PersistencePhase::Restoring;
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.load(&model)?;
            }
            for unit in self.units.iter_mut() {
                unit.load(&model, true)?;
            }
            self.restore_from_checkpoint(scatter)?;
            self.phase = PersistencePhase::Training;
        } else if let Some(pretrained) = self.config.persistence.pretrained_model.clone() {
            if !pretrained.exists() {
                return Err(TrainingError::MissingFile(pretrained));
            }
            info!(
                pretrained = %pretrained.display(),
                "Initializing model weights with pre-trained model"
            );
            for unit in self.units.iter_mut() {
                unit.load(&pretrained, false)?;
            }
        } else {
            info!(model = %model.display(), "No model to reload, starting from initial weights");
            for unit in self.units.iter_mut() {
                unit.clear();
                unit.forward()?;
            }
        }

        metrics::record_checkpoint_load(start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Overwrite the live parameters of every unit with the checkpoint's
    /// master copy and hand the optimizer state to the shards.
    ///
    /// A missing checkpoint, or one without master parameters, keeps the
    /// weights already loaded from the model file.
    pub fn restore_from_checkpoint(&mut self, scatter: &ScatterFn<'_>) -> Result<()> {
        let model = &self.config.model;
        let checkpoint = checkpoint_path(model);
        if !checkpoint.exists() {
            warn!(
                checkpoint = %checkpoint.display(),
                "No checkpoint found, parameters reloaded from last inference model"
            );
            return Ok(());
        }

        let (items, _) = load_items(&checkpoint, &Device::Cpu)?;
        let master = find_item(&items, MASTER_PARAMETERS).cloned();
        if let Some(master) = &master {
            let live = self.units.iter().map(|u| u.num_parameters()).find(|&n| [n] != master.shape());
            if let Some(n) = live {
                return Err(TrainingError::ShapeMismatch {
                    live: vec![n],
                    checkpoint: master.shape().to_vec(),
                });
            }
        }
        load_shard_states(&mut self.shards, &items, scatter)?;

        let Some(mut master) = master else {
            warn!(
                checkpoint = %checkpoint.display(),
                "No master parameters found in checkpoint, parameters reloaded from last inference model"
            );
            return Ok(());
        };

        for unit in self.units.iter_mut() {
            // Parameter storage has to exist before it can be overwritten.
            unit.clear();
            unit.forward()?;
            let live = unit.parameters()?;
            if live.dims() != master.shape() {
                return Err(TrainingError::ShapeMismatch {
                    live: live.dims().to_vec(),
                    checkpoint: master.shape().to_vec(),
                });
            }
            master.convert(live.dtype())?;
            unit.set_parameters(&master.tensor)?;
            unit.clear();
        }

        info!(
            model = %model.display(),
            checkpoint = %checkpoint.display(),
            "Master parameters and optimizers restored from training checkpoint"
        );
        Ok(())
    }

    /// Save with the standard distribute and gather over this coordinator's
    /// shard layout.
    pub fn save(&mut self, is_final: bool) -> Result<()> {
        let layout = self.layout();
        let comm = self.communicator.clone();
        let gather_comm = comm.clone();
        let distribute =
            move |units: &mut [Box<dyn ExecutionUnit>]| layout.distribute(comm.as_ref(), units);
        let gather = move |get: &dyn Fn(usize) -> Result<Tensor>| layout.gather(gather_comm.as_ref(), get);
        self.save_with(is_final, &distribute, &gather)
    }

    /// Swap in smoothed parameters, validate if final, write the model, swap
    /// back, write the checkpoint. All participants run every step; only the
    /// main process writes files.
    ///
    /// A failure of a main-process-only step (validation or a file write) is
    /// shared with the group before anyone returns, so every process swaps
    /// its originals back and leaves with an error together. A collective
    /// that fails on a single process still leaves the others blocked; the
    /// group has to be torn down in that case.
    pub fn save_with(
        &mut self,
        is_final: bool,
        distribute: &DistributeFn<'_>,
        gather: &GatherFn<'_>,
    ) -> Result<()> {
        match self.phase {
            PersistencePhase::Fresh | PersistencePhase::Training => {}
            phase => {
                return Err(TrainingError::InvalidPhase {
                    operation: "save",
                    phase: phase.as_str(),
                })
            }
        }

        let start = Instant::now();
        self.communicator.barrier()?;
        self.phase = PersistencePhase::Saving;
        let result = self.save_phases(is_final, distribute, gather);
        self.phase = PersistencePhase::Training;
        result?;
        self.communicator.barrier()?;

        metrics::record_checkpoint_save(start.elapsed().as_secs_f64());
        Ok(())
    }

    fn save_phases(
        &mut self,
        is_final: bool,
        distribute: &DistributeFn<'_>,
        gather: &GatherFn<'_>,
    ) -> Result<()> {
        let is_main = self.communicator.is_main_process();
        let ranges = self.local_ranges();

        {
            let comm = self.communicator.clone();
            let mut swap = SmoothedSwap::begin(&mut self.units, &mut self.shards, ranges, distribute)?;
            let validated = match self.scheduler.as_mut() {
                Some(scheduler) if is_final && is_main => scheduler.validate(swap.units(), true),
                _ => Ok(()),
            };
            let mut result = agree(comm.as_ref(), validated, "final validation");
            if result.is_ok() {
                comm.barrier()?;
                let written = if is_main {
                    swap.units()
                        .first()
                        .ok_or_else(|| TrainingError::Training("no execution units".into()))
                        .and_then(|unit| {
                            write_model(&self.config, unit.as_ref(), self.scheduler.as_deref(), is_final)
                        })
                } else {
                    Ok(())
                };
                result = agree(comm.as_ref(), written, "writing the model");
            }
            swap.finish()?;
            result?;
        }

        self.communicator.barrier()?;
        self.save_checkpoint(gather)
    }

    /// Write the model file from the first unit as it currently is.
    pub fn save_model(&self, is_final: bool) -> Result<()> {
        if !self.communicator.is_main_process() {
            return Ok(());
        }
        let unit = self
            .units
            .first()
            .ok_or_else(|| TrainingError::Training("no execution units".into()))?;
        write_model(&self.config, unit.as_ref(), self.scheduler.as_deref(), is_final)
    }

    /// Gather optimizer state on every participant and write the checkpoint
    /// from the main process. Without an optimizer-held master copy the first
    /// unit's parameters are stored as `master_parameters`.
    pub fn save_checkpoint(&self, gather: &GatherFn<'_>) -> Result<()> {
        let mut items: Vec<Item> = Vec::new();
        save_shard_states(&self.shards, &mut items, gather)?;

        if find_item(&items, MASTER_PARAMETERS).is_none() {
            let unit = self
                .units
                .first()
                .ok_or_else(|| TrainingError::Training("no execution units".into()))?;
            items.push(Item::new(
                MASTER_PARAMETERS,
                unit.parameters()?.to_device(&Device::Cpu)?.to_dtype(DType::F32)?,
            ));
        }

        let written = if self.communicator.is_main_process() {
            let checkpoint = checkpoint_path(&self.config.model);
            let updates = self.scheduler.as_deref().map(|s| s.number_of_batches());
            info!(
                model = %self.config.model.display(),
                checkpoint = %checkpoint.display(),
                "Saving training checkpoint"
            );
            save_items(&items, &checkpoint, updates)
        } else {
            Ok(())
        };
        agree(self.communicator.as_ref(), written, "writing the checkpoint")
    }
}
