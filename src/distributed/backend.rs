use super::CollectiveCommunicator;
use candle_core::{Result, Tensor};
use std::sync::{Arc, Barrier, Mutex, MutexGuard};

struct SharedState {
    buffers: Mutex<Vec<Option<Tensor>>>,
    barrier: Barrier,
}

/// In-process communicator group, one handle per simulated rank.
pub struct LocalCommunicator {
    rank: usize,
    world_size: usize,
    shared: Arc<SharedState>,
}

impl LocalCommunicator {
    pub fn new_group(world_size: usize) -> Vec<Self> {
        let world_size = world_size.max(1);
        let shared = Arc::new(SharedState {
            buffers: Mutex::new((0..world_size).map(|_| None).collect()),
            barrier: Barrier::new(world_size),
        });

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }

    /// Group of one; every collective is the identity.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            shared: Arc::new(SharedState {
                buffers: Mutex::new(vec![None]),
                barrier: Barrier::new(1),
            }),
        }
    }

    fn buffers(&self) -> Result<MutexGuard<'_, Vec<Option<Tensor>>>> {
        self.shared
            .buffers
            .lock()
            .map_err(|_| candle_core::Error::Msg("communicator buffer lock poisoned".to_string()))
    }

    fn slot<'a>(buffers: &'a [Option<Tensor>], rank: usize) -> Result<&'a Tensor> {
        buffers[rank]
            .as_ref()
            .ok_or_else(|| candle_core::Error::Msg(format!("rank {} did not contribute", rank)))
    }

    fn publish(&self, tensor: &Tensor) -> Result<()> {
        let mut buffers = self.buffers()?;
        buffers[self.rank] = Some(tensor.clone());
        Ok(())
    }
}

impl CollectiveCommunicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.world_size == 1 {
            return Ok(tensor.clone());
        }
        self.publish(tensor)?;
        self.shared.barrier.wait();

        let sum = {
            let buffers = self.buffers()?;
            let mut sum = Self::slot(&buffers, 0)?.clone();
            for rank in 1..self.world_size {
                sum = (sum + Self::slot(&buffers, rank)?)?;
            }
            sum
        };

        // Nobody may overwrite a slot before everyone has read it.
        self.shared.barrier.wait();
        Ok(sum)
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.world_size == 1 {
            return Ok(tensor.clone());
        }
        self.publish(tensor)?;
        self.shared.barrier.wait();

        let gathered = {
            let buffers = self.buffers()?;
            let tensors = (0..self.world_size)
                .map(|rank| Self::slot(&buffers, rank))
                .collect::<Result<Vec<&Tensor>>>()?;
            Tensor::cat(&tensors, 0)?
        };

        self.shared.barrier.wait();
        Ok(gathered)
    }

    fn broadcast(&self, tensor: &Tensor, root_rank: usize) -> Result<Tensor> {
        if self.world_size == 1 {
            return Ok(tensor.clone());
        }
        if self.rank == root_rank {
            self.publish(tensor)?;
        }
        self.shared.barrier.wait();

        let result = {
            let buffers = self.buffers()?;
            Self::slot(&buffers, root_rank)?.clone()
        };

        self.shared.barrier.wait();
        Ok(result)
    }
}
