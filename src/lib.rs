//! Training coordination for data-parallel replicas.
//!
//! The crate sits above a tensor engine (candle) and owns the control logic:
//! adaptive cost scaling, gradient-norm outlier rescaling, consistent
//! checkpointing of weights/optimizer/scheduler state, and the batch-fit
//! search that sizes batches against a memory budget.

pub mod distributed;
pub mod training;
pub mod utils;

pub use training::coordinator::Coordinator;
pub use utils::config::CoordinatorConfig;
pub use utils::error::{Result, TrainingError};
