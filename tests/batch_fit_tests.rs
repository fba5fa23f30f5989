mod common;

use common::{config_in, MockUnit};
use replica_trainer::distributed::LocalCommunicator;
use replica_trainer::training::batch_fit::collect_batch_stats;
use replica_trainer::training::optimizer::init_adam_shards;
use replica_trainer::training::reference::{CandleExecutionUnit, ModelShape};
use replica_trainer::training::unit::ExecutionUnit;
use replica_trainer::utils::config::BatchingConfig;
use replica_trainer::{Coordinator, TrainingError};
use candle_core::{DType, Device};
use tempfile::tempdir;

fn batching(step: usize, max_length: usize) -> BatchingConfig {
    BatchingConfig {
        mini_batch_fit: true,
        fit_step: step,
        max_length,
        train_sets: vec!["train.src".into(), "train.trg".into()],
        ..BatchingConfig::default()
    }
}

#[test]
fn test_four_buckets_with_shrinking_sizes() -> anyhow::Result<()> {
    // 256 sentences fit at length 16, 64 at length 64
    let mut unit = MockUnit::new(4, 4096);
    let stats = collect_batch_stats(&mut unit, &batching(16, 64), 1.0)?;

    let entries: Vec<(Vec<usize>, usize)> = stats.iter().map(|(k, v)| (k.clone(), *v)).collect();
    let lengths: Vec<usize> = entries.iter().map(|(k, _)| k[0]).collect();
    assert_eq!(lengths, vec![16, 32, 48, 64]);
    assert_eq!(entries[0].1, 256);

    for window in entries.windows(2) {
        assert!(window[1].1 <= window[0].1);
    }
    for (lengths, size) in &entries {
        assert!(size * lengths[0] <= 4096);
        assert!(*size > 4096 / lengths[0] - 16 - 1);
    }
    Ok(())
}

#[test]
fn test_search_restores_nan_switch() -> anyhow::Result<()> {
    let mut unit = MockUnit::new(4, 4096);
    unit.set_throw_nan(true);
    collect_batch_stats(&mut unit, &batching(16, 32), 1.0)?;
    assert!(unit.throw_nan());
    Ok(())
}

#[test]
fn test_multiplier_scales_sizes() -> anyhow::Result<()> {
    let mut unit = MockUnit::new(4, 4096);
    let plain = collect_batch_stats(&mut unit, &batching(16, 16), 1.0)?;
    let doubled = collect_batch_stats(&mut unit, &batching(16, 16), 2.0)?;
    assert_eq!(plain.find_batch_size(&[16, 16]), Some(256));
    assert_eq!(doubled.find_batch_size(&[16, 16]), Some(512));
    assert_eq!(doubled.find_batch_size(&[10, 12]), Some(512));
    Ok(())
}

#[test]
fn test_class_streams_are_capped() -> anyhow::Result<()> {
    let mut config = batching(10, 20);
    config.input_types = vec!["sequence".into(), "class".into()];
    let mut unit = MockUnit::new(4, 4096);
    let stats = collect_batch_stats(&mut unit, &config, 1.0)?;
    let keys: Vec<Vec<usize>> = stats.iter().map(|(k, _)| k.clone()).collect();
    assert_eq!(keys, vec![vec![10, 1], vec![20, 1]]);
    Ok(())
}

#[test]
fn test_tsv_input_count() -> anyhow::Result<()> {
    let mut config = batching(10, 10);
    config.train_sets.clear();
    config.tsv = true;
    config.tsv_fields = 3;
    config.data_weighting = Some("weights".into());
    let mut unit = MockUnit::new(4, 4096);
    let stats = collect_batch_stats(&mut unit, &config, 1.0)?;
    assert!(stats.iter().all(|(k, _)| k.len() == 2));

    config.tsv_fields = 1;
    assert!(matches!(
        collect_batch_stats(&mut unit, &config, 1.0),
        Err(TrainingError::Config(_))
    ));
    Ok(())
}

#[test]
fn test_reference_unit_through_coordinator() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut config = config_in(dir.path(), 1);
    config.batching = batching(8, 16);
    config.batching.workspace_mb = 1;

    let unit = CandleExecutionUnit::new(Device::Cpu, DType::F32, ModelShape { vocab: 32, dim: 8 }, 1);
    let units: Vec<Box<dyn ExecutionUnit>> = vec![Box::new(unit)];
    let shards = init_adam_shards(&config.optimizer, &units, &LocalCommunicator::single());
    let mut c = Coordinator::new(config, units, shards)?;

    let stats = c.collect_stats(1.0)?;
    assert_eq!(stats.len(), 2);
    let short = stats.find_batch_size(&[8, 8]).unwrap_or(0);
    let long = stats.find_batch_size(&[16, 16]).unwrap_or(0);
    assert!(short >= long && long > 0);
    Ok(())
}
