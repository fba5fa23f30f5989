//! Search for the largest batch size per length bucket that fits the memory
//! budget of a device.

use crate::training::unit::{Batch, ExecutionUnit, ThrowNanGuard};
use crate::utils::config::BatchingConfig;
use crate::utils::error::{Result, TrainingError};
use crate::utils::metrics;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Largest batch size seen to fit, keyed by the per-stream lengths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStats {
    map: BTreeMap<Vec<usize>, usize>,
}

impl BatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `batch` fit; the size is scaled by `multiplier` when positive.
    pub fn add(&mut self, batch: &Batch, multiplier: f64) {
        let mut size = batch.size;
        if multiplier > 0.0 {
            size = (size as f64 * multiplier).ceil() as usize;
        }
        let entry = self.map.entry(batch.stream_lengths.clone()).or_insert(0);
        *entry = (*entry).max(size);
    }

    /// Batch size for the smallest recorded bucket covering `lengths`.
    pub fn find_batch_size(&self, lengths: &[usize]) -> Option<usize> {
        self.map
            .range(lengths.to_vec()..)
            .find(|(key, _)| key.iter().zip(lengths).all(|(k, l)| k >= l))
            .map(|(_, size)| *size)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<usize>, &usize)> {
        self.map.iter()
    }
}

/// Longest length tried, `max_length` rounded up to a multiple of `step`.
fn rounded_max_length(config: &BatchingConfig) -> usize {
    let step = config.fit_step.max(1);
    config.max_length.div_ceil(step) * step
}

/// Per-stream caps; `class` streams carry one label.
fn stream_caps(config: &BatchingConfig, streams: usize, max_length: usize) -> Vec<usize> {
    (0..streams)
        .map(|i| match config.input_types.get(i) {
            Some(kind) if kind == "class" => 1,
            _ => max_length,
        })
        .collect()
}

fn capped(length: usize, caps: &[usize]) -> Vec<usize> {
    caps.iter().map(|&cap| length.min(cap)).collect()
}

fn probe(unit: &mut dyn ExecutionUnit, batch: &Batch) -> Result<bool> {
    unit.build(batch)?;
    metrics::record_batch_fit_probe();
    Ok(unit.fits())
}

/// Run the two-phase batch-fit search on `unit`.
///
/// Phase one doubles the batch size at the shortest length until it no
/// longer fits. Phase two binary-searches every length bucket up to the
/// rounded maximum length, each bucket starting from the bound the previous
/// one ended with. NaN/Inf aborts are off for the whole search.
pub fn collect_batch_stats(
    unit: &mut dyn ExecutionUnit,
    config: &BatchingConfig,
    multiplier: f64,
) -> Result<BatchStats> {
    let streams = config.number_of_input_files();
    if streams == 0 {
        return Err(TrainingError::Config(
            "batch fitting needs at least one input stream".to_string(),
        ));
    }
    let step = config.fit_step.max(1);
    let max_length = rounded_max_length(config);
    let caps = stream_caps(config, streams, max_length);

    let mut unit = ThrowNanGuard::new(unit, false);
    let mut stats = BatchStats::new();

    let mut max_batch: usize = 512;
    let lengths = capped(step, &caps);
    while probe(&mut *unit, &Batch::fake(lengths.clone(), max_batch))? {
        if max_batch >= 1 << 20 {
            break;
        }
        max_batch *= 2;
    }
    debug!(max_batch, "Upper bound for batch-fit search");

    let mut length = step;
    while length <= max_length {
        let lengths = capped(length, &caps);
        let mut start = 1usize;
        let mut end = max_batch;

        loop {
            let current = (start + end) / 2;
            if current == 0 {
                break;
            }
            let batch = Batch::fake(lengths.clone(), current);
            let fits = probe(&mut *unit, &batch)?;
            debug!(length, size = current, fits, "Batch-fit probe");

            if fits {
                stats.add(&batch, multiplier);
                start = current + 1;
            } else {
                end = current - 1;
            }
            if end <= start || end - start <= step {
                break;
            }
        }

        max_batch = start;
        length += step;
    }

    unit.clear();
    info!(
        buckets = stats.len(),
        step,
        max_length,
        multiplier,
        "Collected batch-size statistics"
    );
    Ok(stats)
}
