//! Prometheus metrics for the training coordinator.
//!
//! Exposes the numeric-health signals (cost-scale factor, NaN updates,
//! gradient-norm outliers) and persistence timings.

use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use tracing::warn;

/// Global metrics registry, `None` when registration failed
static REGISTRY: OnceLock<Option<MetricsRegistry>> = OnceLock::new();

/// Collection of all coordinator metrics
pub struct MetricsRegistry {
    pub registry: Registry,

    // Numerics
    pub cost_scale_factor: Gauge,
    pub nan_updates: IntCounter,
    pub clean_updates: IntCounter,
    pub rescaled_updates: IntCounter,
    pub gradient_norm: Histogram,
    pub training_loss: Histogram,
    pub target_words: Counter,

    // Persistence
    pub checkpoint_save_seconds: Histogram,
    pub checkpoint_load_seconds: Histogram,

    // Batch fitting
    pub batch_fit_probes: IntCounter,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let cost_scale_factor = Gauge::with_opts(Opts::new(
            "replica_cost_scale_factor",
            "Current loss scaling factor",
        ))?;
        registry.register(Box::new(cost_scale_factor.clone()))?;

        let nan_updates = IntCounter::with_opts(Opts::new(
            "replica_nan_updates_total",
            "Updates skipped because gradients contained NaN or Inf",
        ))?;
        registry.register(Box::new(nan_updates.clone()))?;

        let clean_updates = IntCounter::with_opts(Opts::new(
            "replica_clean_updates_total",
            "Updates applied with finite gradients",
        ))?;
        registry.register(Box::new(clean_updates.clone()))?;

        let rescaled_updates = IntCounter::with_opts(Opts::new(
            "replica_rescaled_updates_total",
            "Updates whose gradient norm was treated as an outlier",
        ))?;
        registry.register(Box::new(rescaled_updates.clone()))?;

        let gradient_norm = Histogram::with_opts(
            HistogramOpts::new("replica_gradient_norm", "Gradient L2 norm per target word")
                .buckets(vec![0.001, 0.01, 0.1, 1.0, 10.0, 100.0, 1000.0]),
        )?;
        registry.register(Box::new(gradient_norm.clone()))?;

        let training_loss = Histogram::with_opts(
            HistogramOpts::new("replica_training_loss", "Summed training loss per update")
                .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 100.0, 1000.0, 10000.0]),
        )?;
        registry.register(Box::new(training_loss.clone()))?;

        let target_words = Counter::with_opts(Opts::new(
            "replica_target_words_total",
            "Target words processed",
        ))?;
        registry.register(Box::new(target_words.clone()))?;

        let checkpoint_save_seconds = Histogram::with_opts(
            HistogramOpts::new("replica_checkpoint_save_seconds", "Time to save model and checkpoint")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;
        registry.register(Box::new(checkpoint_save_seconds.clone()))?;

        let checkpoint_load_seconds = Histogram::with_opts(
            HistogramOpts::new("replica_checkpoint_load_seconds", "Time to restore training state")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;
        registry.register(Box::new(checkpoint_load_seconds.clone()))?;

        let batch_fit_probes = IntCounter::with_opts(Opts::new(
            "replica_batch_fit_probes_total",
            "Synthetic batches built while searching batch sizes",
        ))?;
        registry.register(Box::new(batch_fit_probes.clone()))?;

        Ok(Self {
            registry,
            cost_scale_factor,
            nan_updates,
            clean_updates,
            rescaled_updates,
            gradient_norm,
            training_loss,
            target_words,
            checkpoint_save_seconds,
            checkpoint_load_seconds,
            batch_fit_probes,
        })
    }

    /// Gather all metrics as Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Get the global metrics registry.
pub fn get_metrics() -> Option<&'static MetricsRegistry> {
    REGISTRY
        .get_or_init(|| match MetricsRegistry::new() {
            Ok(registry) => Some(registry),
            Err(e) => {
                warn!(error = %e, "Metrics disabled, registration failed");
                None
            }
        })
        .as_ref()
}

pub fn record_cost_scale_factor(factor: f32) {
    if let Some(m) = get_metrics() {
        m.cost_scale_factor.set(factor as f64);
    }
}

/// Record the outcome of one update.
pub fn record_update(loss: f64, target_words: f64, grad_norm: Option<f64>, non_finite: bool) {
    let Some(m) = get_metrics() else { return };
    if non_finite {
        m.nan_updates.inc();
        return;
    }
    m.clean_updates.inc();
    m.target_words.inc_by(target_words.max(0.0));
    if loss.is_finite() {
        m.training_loss.observe(loss);
    }
    if let Some(gn) = grad_norm.filter(|g| g.is_finite()) {
        m.gradient_norm.observe(gn);
    }
}

pub fn record_rescaled_update() {
    if let Some(m) = get_metrics() {
        m.rescaled_updates.inc();
    }
}

pub fn record_checkpoint_save(duration_secs: f64) {
    if let Some(m) = get_metrics() {
        m.checkpoint_save_seconds.observe(duration_secs);
    }
}

pub fn record_checkpoint_load(duration_secs: f64) {
    if let Some(m) = get_metrics() {
        m.checkpoint_load_seconds.observe(duration_secs);
    }
}

pub fn record_batch_fit_probe() {
    if let Some(m) = get_metrics() {
        m.batch_fit_probes.inc();
    }
}

/// Start a simple HTTP server to expose metrics on the given port.
#[cfg(feature = "metrics-server")]
pub async fn start_metrics_server(port: u16) -> std::io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tracing::info;

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port = port, "Metrics server started");

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let metrics = get_metrics().map(|m| m.gather()).unwrap_or_default();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics.len(),
                metrics
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}
