use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Distributed error: {0}")]
    Distributed(String),

    #[error("Number of execution units and optimizer shards has to be equal ({units} != {shards})")]
    ShardCountMismatch { units: usize, shards: usize },

    #[error("Number of configured devices and execution units has to be equal ({devices} != {units})")]
    DeviceCountMismatch { devices: usize, units: usize },

    #[error("Live parameter shape {live:?} and shape {checkpoint:?} in checkpoint do not match")]
    ShapeMismatch {
        live: Vec<usize>,
        checkpoint: Vec<usize>,
    },

    #[error("Size mismatch in {context}: expected {expected} elements, got {actual}")]
    SizeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("Required file does not exist: {0}")]
    MissingFile(PathBuf),

    #[error("Training has already finished")]
    Finalized,

    #[error("NaN or Inf detected in {0}")]
    NonFinite(String),

    #[error("Cannot {operation} while persistence is in phase {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, TrainingError>;
