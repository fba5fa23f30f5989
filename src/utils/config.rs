//! Configuration loading with JSON file support and environment variable overrides.
//!
//! Pattern: `REPLICA_*` environment variables override config file values.
//! Nested keys use a double underscore: `REPLICA_COST_SCALING__FREQUENCY=1000`.

use crate::utils::error::{Result, TrainingError};
use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Parameter precision of the execution units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "fp32" | "float32" => Some(Precision::Fp32),
            "fp16" | "float16" => Some(Precision::Fp16),
            "bf16" | "bfloat16" => Some(Precision::Bf16),
            _ => None,
        }
    }
}

/// Adaptive loss scaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostScalingConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Initial factor is `2^exponent`
    #[serde(default)]
    pub exponent: f32,

    /// Clean updates between two factor increases
    #[serde(default = "default_cost_scale_freq")]
    pub frequency: usize,

    #[serde(default = "default_cost_scale_multiplier")]
    pub multiplier: f32,

    /// Fraction of NaN/Inf updates tolerated before the factor is decreased
    #[serde(default)]
    pub nan_tolerance: f32,

    /// Minimum number of observed updates before a decrease may happen
    #[serde(default = "default_one")]
    pub nan_range: usize,

    #[serde(default = "default_cost_scale_minimum")]
    pub factor_minimum: f32,
}

impl CostScalingConfig {
    /// Parse the positional form `exponent [freq] [multiplier] [tolerance] [range] [minimum]`.
    ///
    /// An empty list leaves cost scaling disabled.
    pub fn from_positional<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        let mut config = Self::default();
        if values.is_empty() {
            return Ok(config);
        }
        config.enabled = true;

        let field = |index: usize, name: &str| -> Result<Option<String>> {
            match values.get(index).map(|v| v.as_ref().trim()) {
                Some("") => Err(TrainingError::Config(format!(
                    "cost-scaling {} must not be empty",
                    name
                ))),
                other => Ok(other.map(str::to_string)),
            }
        };
        let bad = |name: &str, value: &str| {
            TrainingError::Config(format!("cost-scaling {}: cannot parse '{}'", name, value))
        };

        if let Some(v) = field(0, "exponent")? {
            config.exponent = v.parse().map_err(|_| bad("exponent", &v))?;
        }
        if let Some(v) = field(1, "frequency")? {
            config.frequency = v.parse().map_err(|_| bad("frequency", &v))?;
        }
        if let Some(v) = field(2, "multiplier")? {
            config.multiplier = v.parse().map_err(|_| bad("multiplier", &v))?;
        }
        if let Some(v) = field(3, "nan tolerance")? {
            config.nan_tolerance = v.parse().map_err(|_| bad("nan tolerance", &v))?;
        }
        if let Some(v) = field(4, "nan range")? {
            config.nan_range = v.parse().map_err(|_| bad("nan range", &v))?;
        }
        if let Some(v) = field(5, "factor minimum")? {
            config.factor_minimum = v.parse().map_err(|_| bad("factor minimum", &v))?;
        }
        Ok(config)
    }

    pub fn initial_factor(&self) -> f32 {
        if self.enabled {
            2f32.powf(self.exponent)
        } else {
            1.0
        }
    }
}

/// Outlier rescaling of gradient norms against their running statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicGradientScalingConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Number of standard deviations above the mean that counts as an outlier
    #[serde(default = "default_dgs_factor")]
    pub factor: f32,

    /// Track statistics of log norms instead of plain norms
    #[serde(default)]
    pub use_logs: bool,

    /// Averaging window of the running norm statistics
    #[serde(default = "default_norm_window")]
    pub window: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChecksConfig {
    /// Abort on NaN/Inf produced by a forward pass
    #[serde(default)]
    pub check_nan: bool,

    /// Probe gradients for NaN/Inf before every update
    #[serde(default)]
    pub check_gradient_nan: bool,

    /// Divide the gradient by the number of target words (ce-sum to ce-mean)
    #[serde(default)]
    pub normalize_gradient: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Do not restore from an existing model file
    #[serde(default)]
    pub no_reload: bool,

    /// Weights used to seed a run that does not resume
    #[serde(default)]
    pub pretrained_model: Option<PathBuf>,

    /// Only keep the canonical model file, no numbered snapshots
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Determine batch sizes from the memory budget before training
    #[serde(default)]
    pub mini_batch_fit: bool,

    /// Memory budget per device in MiB
    #[serde(default = "default_workspace_mb")]
    pub workspace_mb: usize,

    /// Granularity of lengths and batch sizes in the fit search
    #[serde(default = "default_fit_step")]
    pub fit_step: usize,

    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Per input stream type tags; `class` streams have length 1
    #[serde(default)]
    pub input_types: Vec<String>,

    #[serde(default)]
    pub train_sets: Vec<PathBuf>,

    /// Training data is a single tab-separated file
    #[serde(default)]
    pub tsv: bool,

    #[serde(default)]
    pub tsv_fields: usize,

    /// Guided alignment source, `none` when disabled
    #[serde(default = "default_none")]
    pub guided_alignment: String,

    #[serde(default)]
    pub data_weighting: Option<String>,

    #[serde(default = "default_true")]
    pub mini_batch_round_up: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    #[serde(default = "default_beta1")]
    pub beta1: f64,

    #[serde(default = "default_beta2")]
    pub beta2: f64,

    #[serde(default = "default_eps")]
    pub epsilon: f64,

    /// Decay of the exponential moving average of parameters, 0 disables smoothing
    #[serde(default)]
    pub exponential_smoothing: f64,
}

/// Complete coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Model file; checkpoint and progress paths are derived from it
    #[serde(default = "default_model_path")]
    pub model: PathBuf,

    #[serde(default = "default_devices")]
    pub devices: Vec<usize>,

    #[serde(default = "default_precision")]
    pub precision: Precision,

    #[serde(default)]
    pub cost_scaling: CostScalingConfig,

    #[serde(default)]
    pub dynamic_gradient_scaling: DynamicGradientScalingConfig,

    #[serde(default)]
    pub checks: ChecksConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub batching: BatchingConfig,

    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

fn default_cost_scale_freq() -> usize { 2000 }
fn default_cost_scale_multiplier() -> f32 { 2.0 }
fn default_cost_scale_minimum() -> f32 { 1.0 }
fn default_one() -> usize { 1 }
fn default_dgs_factor() -> f32 { 2.0 }
fn default_norm_window() -> usize { 100 }
fn default_workspace_mb() -> usize { 2048 }
fn default_fit_step() -> usize { 10 }
fn default_max_length() -> usize { 50 }
fn default_none() -> String { "none".to_string() }
fn default_true() -> bool { true }
fn default_lr() -> f64 { 1e-4 }
fn default_beta1() -> f64 { 0.9 }
fn default_beta2() -> f64 { 0.98 }
fn default_eps() -> f64 { 1e-9 }
fn default_model_path() -> PathBuf { PathBuf::from("model.safetensors") }
fn default_devices() -> Vec<usize> { vec![0] }
fn default_precision() -> Precision { Precision::Fp32 }

impl Default for CostScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            exponent: 0.0,
            frequency: default_cost_scale_freq(),
            multiplier: default_cost_scale_multiplier(),
            nan_tolerance: 0.0,
            nan_range: default_one(),
            factor_minimum: default_cost_scale_minimum(),
        }
    }
}

impl Default for DynamicGradientScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            factor: default_dgs_factor(),
            use_logs: false,
            window: default_norm_window(),
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            mini_batch_fit: false,
            workspace_mb: default_workspace_mb(),
            fit_step: default_fit_step(),
            max_length: default_max_length(),
            input_types: Vec::new(),
            train_sets: Vec::new(),
            tsv: false,
            tsv_fields: 0,
            guided_alignment: default_none(),
            data_weighting: None,
            mini_batch_round_up: true,
        }
    }
}

impl BatchingConfig {
    /// Number of parallel input streams the data reader opens. A TSV file
    /// counts its fields minus the alignment and weighting columns.
    pub fn number_of_input_files(&self) -> usize {
        if self.tsv {
            let mut n = self.tsv_fields;
            if self.guided_alignment != "none" {
                n = n.saturating_sub(1);
            }
            if self.data_weighting.is_some() {
                n = n.saturating_sub(1);
            }
            n
        } else {
            self.train_sets.len()
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_lr(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_eps(),
            exponential_smoothing: 0.0,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            model: default_model_path(),
            devices: default_devices(),
            precision: default_precision(),
            cost_scaling: CostScalingConfig::default(),
            dynamic_gradient_scaling: DynamicGradientScalingConfig::default(),
            checks: ChecksConfig::default(),
            persistence: PersistenceConfig::default(),
            batching: BatchingConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TrainingError::MissingFile(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| TrainingError::Config(format!("Failed to parse config: {}", e)))?;

        info!(config_file = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Load from file, apply `REPLICA_*` overrides and validate.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        for (key, value) in env::vars() {
            let Some(config_key) = key.strip_prefix("REPLICA_") else {
                continue;
            };
            if config_key == "LOG_FORMAT" {
                continue;
            }
            let config_key = config_key.to_lowercase();
            let parts: Vec<&str> = config_key.split("__").collect();

            match parts.as_slice() {
                ["model"] => self.model = PathBuf::from(&value),
                ["devices"] => {
                    self.devices = value
                        .split(',')
                        .map(|d| d.trim().parse::<usize>())
                        .collect::<std::result::Result<_, _>>()
                        .map_err(|e| TrainingError::Config(format!("REPLICA_DEVICES: {}", e)))?;
                }
                ["precision"] => {
                    self.precision = Precision::parse(&value).ok_or_else(|| {
                        TrainingError::Config(format!("unknown precision '{}'", value))
                    })?;
                }
                ["cost_scaling"] => {
                    let values: Vec<&str> = value.split_whitespace().collect();
                    self.cost_scaling = CostScalingConfig::from_positional(&values)?;
                }
                ["cost_scaling", field] => self.apply_cost_scaling_override(field, &value),
                ["dynamic_gradient_scaling", field] => self.apply_dgs_override(field, &value),
                ["checks", field] => self.apply_checks_override(field, &value),
                ["persistence", field] => self.apply_persistence_override(field, &value),
                ["batching", field] => self.apply_batching_override(field, &value),
                ["optimizer", field] => self.apply_optimizer_override(field, &value),
                _ => {
                    debug!(key = %key, "Unknown config key pattern");
                }
            }
        }
        Ok(())
    }

    fn apply_cost_scaling_override(&mut self, field: &str, value: &str) {
        let cs = &mut self.cost_scaling;
        match field {
            "enabled" => cs.enabled = parse_bool(value),
            "exponent" => if let Ok(v) = value.parse() { cs.exponent = v; }
            "frequency" => if let Ok(v) = value.parse() { cs.frequency = v; }
            "multiplier" => if let Ok(v) = value.parse() { cs.multiplier = v; }
            "nan_tolerance" => if let Ok(v) = value.parse() { cs.nan_tolerance = v; }
            "nan_range" => if let Ok(v) = value.parse() { cs.nan_range = v; }
            "factor_minimum" => if let Ok(v) = value.parse() { cs.factor_minimum = v; }
            _ => {}
        }
    }

    fn apply_dgs_override(&mut self, field: &str, value: &str) {
        let dgs = &mut self.dynamic_gradient_scaling;
        match field {
            "enabled" => dgs.enabled = parse_bool(value),
            "factor" => if let Ok(v) = value.parse() { dgs.factor = v; }
            "use_logs" => dgs.use_logs = parse_bool(value) || value == "log",
            "window" => if let Ok(v) = value.parse() { dgs.window = v; }
            _ => {}
        }
    }

    fn apply_checks_override(&mut self, field: &str, value: &str) {
        match field {
            "check_nan" => self.checks.check_nan = parse_bool(value),
            "check_gradient_nan" => self.checks.check_gradient_nan = parse_bool(value),
            "normalize_gradient" => self.checks.normalize_gradient = parse_bool(value),
            _ => {}
        }
    }

    fn apply_persistence_override(&mut self, field: &str, value: &str) {
        match field {
            "no_reload" => self.persistence.no_reload = parse_bool(value),
            "overwrite" => self.persistence.overwrite = parse_bool(value),
            "pretrained_model" => {
                self.persistence.pretrained_model =
                    (!value.is_empty()).then(|| PathBuf::from(value));
            }
            _ => {}
        }
    }

    fn apply_batching_override(&mut self, field: &str, value: &str) {
        let b = &mut self.batching;
        match field {
            "mini_batch_fit" => b.mini_batch_fit = parse_bool(value),
            "workspace_mb" | "workspace" => if let Ok(v) = value.parse() { b.workspace_mb = v; }
            "fit_step" => if let Ok(v) = value.parse() { b.fit_step = v; }
            "max_length" => if let Ok(v) = value.parse() { b.max_length = v; }
            "input_types" => {
                b.input_types = value.split(',').map(|s| s.trim().to_string()).collect();
            }
            "tsv" => b.tsv = parse_bool(value),
            "tsv_fields" => if let Ok(v) = value.parse() { b.tsv_fields = v; }
            "guided_alignment" => b.guided_alignment = value.to_string(),
            "data_weighting" => b.data_weighting = (!value.is_empty()).then(|| value.to_string()),
            "mini_batch_round_up" => b.mini_batch_round_up = parse_bool(value),
            _ => {}
        }
    }

    fn apply_optimizer_override(&mut self, field: &str, value: &str) {
        let o = &mut self.optimizer;
        match field {
            "learning_rate" | "lr" => if let Ok(v) = value.parse() { o.learning_rate = v; }
            "beta1" => if let Ok(v) = value.parse() { o.beta1 = v; }
            "beta2" => if let Ok(v) = value.parse() { o.beta2 = v; }
            "epsilon" => if let Ok(v) = value.parse() { o.epsilon = v; }
            "exponential_smoothing" => if let Ok(v) = value.parse() { o.exponential_smoothing = v; }
            _ => {}
        }
    }

    /// Validate every field once, so components can rely on the values.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.model.as_os_str().is_empty() {
            errors.push("model path must not be empty".to_string());
        }
        if self.devices.is_empty() {
            errors.push("at least one device is required".to_string());
        }

        let cs = &self.cost_scaling;
        if cs.enabled {
            if cs.frequency == 0 {
                errors.push("cost_scaling.frequency must be greater than 0".to_string());
            }
            if cs.multiplier <= 1.0 {
                errors.push(format!("cost_scaling.multiplier must be > 1 (got {})", cs.multiplier));
            }
            if !(0.0..=1.0).contains(&cs.nan_tolerance) {
                errors.push(format!(
                    "cost_scaling.nan_tolerance must be in [0, 1] (got {})",
                    cs.nan_tolerance
                ));
            }
            if cs.nan_range == 0 {
                errors.push("cost_scaling.nan_range must be greater than 0".to_string());
            }
            if cs.factor_minimum <= 0.0 {
                errors.push("cost_scaling.factor_minimum must be positive".to_string());
            }
        }

        let dgs = &self.dynamic_gradient_scaling;
        if dgs.enabled && dgs.factor <= 0.0 {
            errors.push("dynamic_gradient_scaling.factor must be positive".to_string());
        }
        if dgs.window == 0 {
            errors.push("dynamic_gradient_scaling.window must be greater than 0".to_string());
        }

        let b = &self.batching;
        if b.fit_step == 0 {
            errors.push("batching.fit_step must be greater than 0".to_string());
        }
        if b.max_length == 0 {
            errors.push("batching.max_length must be greater than 0".to_string());
        }
        if b.mini_batch_fit && b.workspace_mb == 0 {
            errors.push("batching.workspace_mb must be greater than 0".to_string());
        }

        let o = &self.optimizer;
        if o.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&o.beta1) || !(0.0..1.0).contains(&o.beta2) {
            errors.push("optimizer betas must be in [0, 1)".to_string());
        }
        if !(0.0..1.0).contains(&o.exponential_smoothing) {
            errors.push("optimizer.exponential_smoothing must be in [0, 1)".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::Config(errors.join("; ")))
        }
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| TrainingError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert!(!config.cost_scaling.enabled);
        assert_eq!(config.cost_scaling.frequency, 2000);
        assert_eq!(config.dynamic_gradient_scaling.factor, 2.0);
        assert_eq!(config.devices, vec![0]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_positional_cost_scaling() -> Result<()> {
        let cs = CostScalingConfig::from_positional(&["8", "1000", "2", "0.05", "10", "0.5"])?;
        assert!(cs.enabled);
        assert_eq!(cs.initial_factor(), 256.0);
        assert_eq!(cs.frequency, 1000);
        assert_eq!(cs.nan_tolerance, 0.05);
        assert_eq!(cs.nan_range, 10);
        assert_eq!(cs.factor_minimum, 0.5);

        let partial = CostScalingConfig::from_positional(&["7"])?;
        assert_eq!(partial.frequency, 2000);
        assert_eq!(partial.initial_factor(), 128.0);

        let disabled = CostScalingConfig::from_positional::<&str>(&[])?;
        assert!(!disabled.enabled);
        assert_eq!(disabled.initial_factor(), 1.0);

        assert!(CostScalingConfig::from_positional(&["x"]).is_err());
        Ok(())
    }

    #[test]
    fn test_config_save_load() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");

        let mut config = CoordinatorConfig::default();
        config.batching.fit_step = 16;
        config.save(&path)?;

        let loaded = CoordinatorConfig::from_file(&path)?;
        assert_eq!(loaded.batching.fit_step, 16);
        Ok(())
    }

    #[test]
    fn test_missing_config_file() {
        let err = CoordinatorConfig::from_file("/nonexistent/replica.json").unwrap_err();
        assert!(matches!(err, TrainingError::MissingFile(_)));
    }

    #[test]
    fn test_validation() {
        let mut config = CoordinatorConfig::default();
        config.cost_scaling.enabled = true;
        config.cost_scaling.multiplier = 1.0;
        config.batching.fit_step = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("multiplier"));
        assert!(err.contains("fit_step"));
    }

    #[test]
    fn test_number_of_input_files() {
        let mut b = BatchingConfig {
            train_sets: vec!["train.src".into(), "train.trg".into()],
            ..BatchingConfig::default()
        };
        assert_eq!(b.number_of_input_files(), 2);

        b.tsv = true;
        b.tsv_fields = 4;
        b.guided_alignment = "alignment".to_string();
        b.data_weighting = Some("weights".to_string());
        assert_eq!(b.number_of_input_files(), 2);

        b.tsv_fields = 1;
        assert_eq!(b.number_of_input_files(), 0);
    }
}
