use anyhow::Context;
use clap::Parser;
use replica_trainer::distributed::{CollectiveCommunicator, LocalCommunicator};
use replica_trainer::training::optimizer::init_adam_shards;
use replica_trainer::training::reference::{init_units, ModelShape};
use replica_trainer::training::scheduler::{LossValidator, Scheduler};
use replica_trainer::training::unit::Batch;
use replica_trainer::utils::logging::{self, LogFormat};
use replica_trainer::{Coordinator, CoordinatorConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "replica-trainer", about = "Train the reference model with a replica coordinator")]
struct Args {
    /// Path to config JSON; defaults plus REPLICA_* overrides when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model file, overrides the config.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Number of updates to run.
    #[arg(long, default_value = "100")]
    updates: usize,

    /// Save model and checkpoint every N updates (0 = only at the end).
    #[arg(long, default_value = "50")]
    save_every: usize,

    /// Batches per update, spread over the devices.
    #[arg(long, default_value = "2")]
    batches_per_update: usize,

    /// Sentences per batch; ignored with --fit.
    #[arg(long, default_value = "16")]
    batch_size: usize,

    /// Length of every stream of the synthetic batches.
    #[arg(long, default_value = "24")]
    length: usize,

    #[arg(long, default_value = "256")]
    vocab: usize,

    #[arg(long, default_value = "32")]
    dim: usize,

    /// Size batches from the memory budget before training.
    #[arg(long)]
    fit: bool,

    /// Log format: pretty, compact or json.
    #[arg(long)]
    log_format: Option<String>,

    /// Expose Prometheus metrics on this port (needs the `metrics-server` feature).
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[cfg(feature = "metrics-server")]
fn spawn_metrics_server(port: u16) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                warn!(error = %e, "Could not start metrics runtime");
                return;
            }
        };
        if let Err(e) = runtime.block_on(replica_trainer::utils::metrics::start_metrics_server(port)) {
            warn!(error = %e, port, "Metrics server stopped");
        }
    });
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.log_format.as_deref() {
        Some(format) => logging::init_logging_with_format(LogFormat::parse(format)),
        None => logging::init_logging_from_env(),
    }

    if let Some(port) = args.metrics_port {
        #[cfg(feature = "metrics-server")]
        spawn_metrics_server(port);
        #[cfg(not(feature = "metrics-server"))]
        warn!(port, "Built without the metrics-server feature, not serving metrics");
    }

    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::from_file_with_env(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CoordinatorConfig::from_env()?,
    };
    if let Some(model) = args.model {
        config.model = model;
    }
    if args.fit {
        config.batching.mini_batch_fit = true;
    }
    if config.batching.number_of_input_files() == 0 {
        config.batching.train_sets = vec![PathBuf::from("source"), PathBuf::from("target")];
    }

    let shape = ModelShape {
        vocab: args.vocab,
        dim: args.dim,
    };
    let communicator: Arc<dyn CollectiveCommunicator> = Arc::new(LocalCommunicator::single());
    let units = init_units(&config, shape)?;
    let shards = init_adam_shards(&config.optimizer, &units, communicator.as_ref());
    let lengths = vec![args.length; config.batching.number_of_input_files()];

    let validation = (0..2)
        .map(|i| Batch::fake(lengths.clone(), 4 + i))
        .collect();
    let scheduler = Scheduler::new(config.dynamic_gradient_scaling.window)
        .with_validator(Box::new(LossValidator::new(validation)));

    let mut coordinator = Coordinator::new(config, units, shards)?
        .with_scheduler(Box::new(scheduler))
        .with_communicator(communicator);
    coordinator.load()?;

    let mut batch_size = args.batch_size;
    if coordinator.config().batching.mini_batch_fit {
        let stats = coordinator.collect_stats(1.0)?;
        match stats.find_batch_size(&lengths) {
            Some(size) => {
                info!(length = args.length, size, "Batch size from memory budget");
                batch_size = size;
            }
            None => warn!(length = args.length, "Length exceeds fitted buckets, keeping batch size"),
        }
    }

    let already = coordinator
        .scheduler()
        .map(|s| s.number_of_batches())
        .unwrap_or(0);
    for step in 0..args.updates {
        let batches: Vec<Batch> = (0..args.batches_per_update.max(1))
            .map(|_| Batch::fake(lengths.clone(), batch_size))
            .collect();
        let outcome = coordinator.update(&batches)?;
        if !outcome.applied {
            warn!(update = already + step + 1, "Skipped update with non-finite gradient");
        } else if (step + 1) % 10 == 0 {
            info!(
                update = already + step + 1,
                loss_per_word = outcome.loss / outcome.target_words.max(1) as f32,
                cost_scale = coordinator.cost_scaler().factor(),
                "Progress"
            );
        }

        if args.save_every > 0 && (step + 1) % args.save_every == 0 && step + 1 < args.updates {
            coordinator.save(false)?;
        }
    }

    coordinator.save(true)?;
    coordinator.finalize();
    info!(model = %coordinator.config().model.display(), "Training finished");
    Ok(())
}
