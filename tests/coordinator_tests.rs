mod common;

use common::{batches, config_in, mock_units, MockUnit};
use replica_trainer::distributed::{CollectiveCommunicator, LocalCommunicator};
use replica_trainer::training::optimizer::init_adam_shards;
use replica_trainer::training::scheduler::{Scheduler, TrainingScheduler};
use replica_trainer::training::unit::{Batch, ExecutionUnit};
use replica_trainer::utils::checkpoint::checkpoint_path;
use replica_trainer::utils::config::CoordinatorConfig;
use replica_trainer::{Coordinator, TrainingError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

fn coordinator(config: CoordinatorConfig, units: Vec<Box<dyn ExecutionUnit>>) -> anyhow::Result<Coordinator> {
    let shards = init_adam_shards(&config.optimizer, &units, &LocalCommunicator::single());
    let window = config.dynamic_gradient_scaling.window;
    Ok(Coordinator::new(config, units, shards)?.with_scheduler(Box::new(Scheduler::new(window))))
}

fn params(c: &Coordinator, index: usize) -> anyhow::Result<Vec<f32>> {
    Ok(c.units()[index].parameters()?.to_vec1::<f32>()?)
}

#[test]
fn test_device_and_shard_counts_must_agree() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = config_in(dir.path(), 2);

    let units = mock_units(1, 8);
    let shards = init_adam_shards(&config.optimizer, &units, &LocalCommunicator::single());
    let err = Coordinator::new(config.clone(), units, shards).err();
    assert!(matches!(err, Some(TrainingError::DeviceCountMismatch { devices: 2, units: 1 })));

    let units = mock_units(2, 8);
    let shards = init_adam_shards(&config.optimizer, &mock_units(1, 8), &LocalCommunicator::single());
    let err = Coordinator::new(config, units, shards).err();
    assert!(matches!(err, Some(TrainingError::ShardCountMismatch { units: 2, shards: 1 })));
    Ok(())
}

#[test]
fn test_update_keeps_replicas_identical() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut c = coordinator(config_in(dir.path(), 2), mock_units(2, 10))?;
    let before = {
        c.update(&batches(2, 4, 8))?;
        params(&c, 0)?
    };
    assert_eq!(params(&c, 0)?, params(&c, 1)?);

    let outcome = c.update(&batches(3, 4, 8))?;
    assert!(outcome.applied);
    assert_eq!(outcome.target_words, 96);
    assert_eq!(params(&c, 0)?, params(&c, 1)?);
    assert_ne!(params(&c, 0)?, before);
    assert_eq!(c.scheduler().map(|s| s.number_of_batches()), Some(2));
    Ok(())
}

#[test]
fn test_normalization_is_invariant_to_cost_scale() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut plain_config = config_in(dir.path(), 2);
    plain_config.checks.normalize_gradient = true;
    plain_config.dynamic_gradient_scaling.enabled = true;

    let mut scaled_config = plain_config.clone();
    scaled_config.cost_scaling.enabled = true;
    scaled_config.cost_scaling.exponent = 3.0;

    let mut plain = coordinator(plain_config, mock_units(2, 10))?;
    let mut scaled = coordinator(scaled_config, mock_units(2, 10))?;
    assert_eq!(scaled.cost_scaler().factor(), 8.0);

    let a = plain.update(&batches(2, 4, 8))?;
    let b = scaled.update(&batches(2, 4, 8))?;

    assert_eq!(a.normalizer, 64.0);
    assert_eq!(b.normalizer, 512.0);
    assert!((b.grad_norm - 8.0 * a.grad_norm).abs() < 1e-3 * b.grad_norm);

    let pa = params(&plain, 0)?;
    let pb = params(&scaled, 0)?;
    for (x, y) in pa.iter().zip(pb.iter()) {
        assert!((x - y).abs() < 1e-6, "{x} vs {y}");
    }

    let sa = plain.scheduler().map(|s| s.gradient_norm_stats().mean);
    let sb = scaled.scheduler().map(|s| s.gradient_norm_stats().mean);
    match (sa, sb) {
        (Some(x), Some(y)) => assert!((x - y).abs() < 1e-5),
        _ => anyhow::bail!("scheduler missing"),
    }
    Ok(())
}

#[test]
fn test_normalization_factor() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut config = config_in(dir.path(), 1);
    config.cost_scaling.enabled = true;
    config.cost_scaling.exponent = 2.0;
    config.checks.normalize_gradient = true;
    config.dynamic_gradient_scaling.enabled = true;
    let c = coordinator(config, mock_units(1, 4))?;

    assert_eq!(c.compute_normalization_factor(f32::NAN, 10), 40.0);
    // Too few batches for the outlier check to fire.
    assert_eq!(c.compute_normalization_factor(1e6, 10), 40.0);
    Ok(())
}

#[test]
fn test_cost_scale_grows_every_frequency_updates() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut config = config_in(dir.path(), 1);
    config.cost_scaling.enabled = true;
    config.cost_scaling.frequency = 4;
    let mut c = coordinator(config, mock_units(1, 6))?;

    for _ in 0..4 {
        c.update(&batches(1, 2, 4))?;
    }
    assert_eq!(c.cost_scaler().factor(), 2.0);

    c.update(&batches(1, 2, 4))?;
    assert_eq!(c.cost_scaler().factor(), 2.0);
    assert_eq!(c.cost_scaler().counters(), (0, 1));
    Ok(())
}

#[test]
fn test_overflowing_updates_shrink_cost_scale() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut config = config_in(dir.path(), 1);
    config.cost_scaling.enabled = true;
    config.cost_scaling.exponent = 3.0;
    config.cost_scaling.nan_range = 10;
    config.cost_scaling.nan_tolerance = 0.29;

    let poison = Arc::new(AtomicBool::new(false));
    let unit = MockUnit::new(6, 4096).with_poison(poison.clone());
    let mut c = coordinator(config, vec![Box::new(unit)])?;

    for _ in 0..7 {
        assert!(c.update(&batches(1, 2, 4))?.applied);
    }
    let clean = params(&c, 0)?;

    poison.store(true, Ordering::SeqCst);
    for _ in 0..2 {
        let outcome = c.update(&batches(1, 2, 4))?;
        assert!(!outcome.applied);
        assert_eq!(c.cost_scaler().factor(), 8.0);
    }
    c.update(&batches(1, 2, 4))?;
    assert_eq!(c.cost_scaler().factor(), 4.0);
    assert_eq!(c.cost_scaler().counters(), (0, 0));
    assert_eq!(params(&c, 0)?, clean);
    assert_eq!(c.scheduler().map(|s| s.number_of_batches()), Some(10));
    Ok(())
}

#[test]
fn test_overflow_share_at_tolerance_keeps_cost_scale() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut config = config_in(dir.path(), 1);
    config.cost_scaling.enabled = true;
    config.cost_scaling.exponent = 3.0;
    config.cost_scaling.nan_range = 10;
    config.cost_scaling.nan_tolerance = 0.3;

    let poison = Arc::new(AtomicBool::new(false));
    let unit = MockUnit::new(6, 4096).with_poison(poison.clone());
    let mut c = coordinator(config, vec![Box::new(unit)])?;

    for _ in 0..7 {
        c.update(&batches(1, 2, 4))?;
    }
    poison.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        assert!(!c.update(&batches(1, 2, 4))?.applied);
    }
    // 3 of 10 is not above a tolerance of 0.3
    assert_eq!(c.cost_scaler().factor(), 8.0);
    assert_eq!(c.cost_scaler().counters(), (3, 7));

    c.update(&batches(1, 2, 4))?;
    assert_eq!(c.cost_scaler().factor(), 4.0);
    Ok(())
}

#[test]
fn test_check_nan_applied_to_units() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut config = config_in(dir.path(), 2);
    config.checks.check_nan = true;
    let mut units = mock_units(2, 4);
    for unit in units.iter_mut() {
        unit.set_throw_nan(false);
    }
    let c = coordinator(config.clone(), units)?;
    assert!(c.units().iter().all(|u| u.throw_nan()));

    config.checks.check_nan = false;
    let c = coordinator(config, mock_units(2, 4))?;
    assert!(c.units().iter().all(|u| !u.throw_nan()));
    Ok(())
}

#[test]
fn test_update_norm_combines_shards() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut config = config_in(dir.path(), 2);
    config.dynamic_gradient_scaling.enabled = true;

    // loss 4, gradient (1, 2, 3, 4) split over two shards
    let mut c = coordinator(config.clone(), mock_units(2, 4))?;
    c.load()?;
    let outcome = c.update(&[Batch::fake(vec![4, 4], 2)])?;
    assert!(outcome.applied);
    assert!((outcome.grad_norm - 30f32.sqrt()).abs() < 1e-5);

    // Without explicit checks a non-finite norm still skips the update.
    let units: Vec<Box<dyn ExecutionUnit>> = (0..2)
        .map(|_| {
            let unit = MockUnit::new(4, 4096);
            unit.poison.store(true, Ordering::SeqCst);
            Box::new(unit) as Box<dyn ExecutionUnit>
        })
        .collect();
    let mut c = coordinator(config, units)?;
    c.load()?;
    let before = params(&c, 0)?;
    let outcome = c.update(&[Batch::fake(vec![4, 4], 2)])?;
    assert!(!outcome.applied);
    assert_eq!(params(&c, 0)?, before);
    Ok(())
}

#[test]
fn test_check_nan_or_norm() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let batch = Batch::fake(vec![4, 4], 2);

    let prepared = |poisoned: bool| -> anyhow::Result<Box<dyn ExecutionUnit>> {
        let mut unit = MockUnit::new(4, 4096);
        unit.poison.store(poisoned, Ordering::SeqCst);
        unit.build(&batch)?;
        let loss = unit.forward()?.ok_or_else(|| anyhow::anyhow!("no loss"))?;
        unit.backward(&loss)?;
        Ok(Box::new(unit))
    };

    let mut config = config_in(dir.path(), 1);
    let c = coordinator(config.clone(), vec![prepared(false)?])?;
    assert_eq!(c.check_nan_or_norm(0, 0, 4)?, 0.0);

    config.dynamic_gradient_scaling.enabled = true;
    let c = coordinator(config.clone(), vec![prepared(false)?])?;
    // loss 4, gradient (1, 2, 3, 4)
    assert!((c.check_nan_or_norm(0, 0, 4)? - 30f32.sqrt()).abs() < 1e-5);
    assert!((c.check_nan_or_norm(0, 2, 4)? - 5.0).abs() < 1e-5);

    // NaN slips through the norm only when nothing probes for it.
    let c = coordinator(config.clone(), vec![prepared(true)?])?;
    assert!(c.check_nan_or_norm(0, 1, 4)?.is_finite());
    assert!(c.check_nan_or_norm(0, 0, 4)?.is_nan());

    config.checks.check_gradient_nan = true;
    config.dynamic_gradient_scaling.enabled = false;
    let c = coordinator(config, vec![prepared(true)?])?;
    assert!(c.check_nan_or_norm(0, 0, 4)?.is_nan());
    assert_eq!(c.check_nan_or_norm(0, 1, 4)?, 0.0);
    Ok(())
}

#[test]
fn test_finalize_blocks_validation() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut c = coordinator(config_in(dir.path(), 1), mock_units(1, 4))?;
    c.validate()?;
    c.finalize();
    assert!(c.is_finalized());
    assert!(matches!(c.validate(), Err(TrainingError::Finalized)));
    assert!(matches!(c.update(&batches(1, 1, 1)), Err(TrainingError::Finalized)));
    Ok(())
}

#[test]
fn test_typical_target_words() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut c = coordinator(config_in(dir.path(), 1), mock_units(1, 4))?;
    assert_eq!(c.typical_trg_batch_words(), 0.0);

    c.set_typical_trg_batch_words(1000);
    c.update_average_trg_batch_words(2000);
    assert!((c.typical_trg_batch_words() - 1010.0).abs() < 1e-9);

    c.update(&batches(1, 2, 5))?;
    assert!((c.typical_trg_batch_words() - (0.99 * 1010.0 + 0.1)).abs() < 1e-9);
    Ok(())
}

#[test]
fn test_input_files_and_round_up() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut config = config_in(dir.path(), 1);
    config.batching.tsv = true;
    config.batching.tsv_fields = 3;
    config.batching.guided_alignment = "file".to_string();
    config.batching.mini_batch_round_up = false;
    let c = coordinator(config, mock_units(1, 4))?;
    assert_eq!(c.number_of_input_files(), 2);
    assert!(!c.mini_batch_round_up());
    Ok(())
}

#[test]
fn test_two_processes_stay_in_sync() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let model = dir.path().join("model.safetensors");
    let group = LocalCommunicator::new_group(2);

    let results: Vec<anyhow::Result<Vec<f32>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                let dir = dir.path().to_path_buf();
                scope.spawn(move || -> anyhow::Result<Vec<f32>> {
                    let comm: Arc<dyn CollectiveCommunicator> = Arc::new(comm);
                    let config = config_in(&dir, 1);
                    let units = mock_units(1, 9);
                    let shards = init_adam_shards(&config.optimizer, &units, comm.as_ref());
                    let mut c = Coordinator::new(config, units, shards)?
                        .with_scheduler(Box::new(Scheduler::new(100)))
                        .with_communicator(comm.clone());
                    c.load()?;

                    let size = 2 + comm.rank();
                    for _ in 0..3 {
                        let outcome = c.update(&batches(1, size, 4))?;
                        assert_eq!(outcome.target_words, 20);
                    }
                    c.save(false)?;
                    Ok(c.units()[0].parameters()?.to_vec1::<f32>()?)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(anyhow::anyhow!("rank panicked"))))
            .collect()
    });

    let mut params = Vec::new();
    for r in results {
        params.push(r?);
    }
    assert_eq!(params[0], params[1]);
    assert!(model.exists());
    assert!(checkpoint_path(&model).exists());
    Ok(())
}
