//! Cross-process plumbing for the coordinator.
//!
//! Everything that crosses a device or process boundary goes through a
//! [`CollectiveCommunicator`] or through the gather/scatter callables built
//! in [`sharding`]; replicas never share mutable state directly.

use candle_core::{Result, Tensor};

/// Trait for collective communications.
///
/// Implementations include:
/// - `LocalCommunicator`: in-process group for tests and single-host runs
pub trait CollectiveCommunicator: Send + Sync {
    /// Get the rank of this process
    fn rank(&self) -> usize;

    /// Get the total number of processes
    fn world_size(&self) -> usize;

    /// Block until every rank has reached this point.
    fn barrier(&self) -> Result<()>;

    /// All-reduce: Sum tensor across all ranks and broadcast result.
    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor>;

    /// All-gather: Gather tensors from all ranks, concatenating along dim 0.
    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Broadcast: Send tensor from root rank to all others.
    fn broadcast(&self, tensor: &Tensor, root_rank: usize) -> Result<Tensor>;

    /// Rank 0 is the designated writer.
    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }
}

pub mod backend;
pub mod sharding;

pub use backend::LocalCommunicator;
pub use sharding::{shard_range, DistributeFn, GatherFn, ScatterFn, ShardLayout};

/// Sum a scalar across all ranks.
pub fn all_reduce_scalar(value: f64, communicator: &dyn CollectiveCommunicator) -> Result<f64> {
    if communicator.world_size() == 1 {
        return Ok(value);
    }

    let tensor = Tensor::new(&[value], &candle_core::Device::Cpu)?;
    let reduced = communicator.all_reduce(&tensor)?;
    Ok(reduced.to_vec1::<f64>()?[0])
}
