//! Resource management

use crate::error::EnsembleError;

use tokio::sync::{Semaphore, SemaphorePermit};

/// Batch size used when neither a batch size nor a memory budget is configured.
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Each reach is held twice while it is summarised: once as loaded values and once as the
/// per-cell sample buffers.
const COPIES_PER_REACH: usize = 2;

/// Memory permits are counted in KiB so that budgets beyond 4 GiB fit a single acquisition.
const MEMORY_UNIT: usize = 1024;

/// [crate::resource_manager::ResourceManager] provides a simple way to allocate various resources
/// to tasks. Resource management is performed using a Tokio Semaphore for each type of resource.
///
/// A single manager may be shared by several pipelines running in one process.
#[derive(Debug)]
pub struct ResourceManager {
    /// Optional semaphore for observation service connections.
    connections: Option<Semaphore>,

    /// Optional semaphore for memory (KiB).
    memory: Option<Semaphore>,

    /// Optional total memory pool in bytes.
    total_memory: Option<usize>,
}

impl ResourceManager {
    /// Returns a new ResourceManager object.
    pub fn new(connection_limit: Option<usize>, memory_limit: Option<usize>) -> Self {
        Self {
            connections: connection_limit.map(Semaphore::new),
            memory: memory_limit.map(|bytes| Semaphore::new(bytes.div_ceil(MEMORY_UNIT))),
            total_memory: memory_limit,
        }
    }

    /// Acquire an observation service connection resource.
    pub async fn connection(&self) -> Result<Option<SemaphorePermit>, EnsembleError> {
        optional_acquire(&self.connections, 1).await
    }

    /// Acquire memory resource.
    pub async fn memory(&self, bytes: usize) -> Result<Option<SemaphorePermit>, EnsembleError> {
        if let Some(total_memory) = self.total_memory {
            if bytes > total_memory {
                return Err(EnsembleError::InsufficientMemory {
                    requested: bytes,
                    total: total_memory,
                });
            };
        };
        // Acquisitions are limited to u32::MAX permits; anything larger takes the cap.
        let units = bytes.div_ceil(MEMORY_UNIT).min(u32::MAX as usize);
        optional_acquire(&self.memory, units).await
    }

    /// Choose the number of reaches per batch.
    ///
    /// With a memory budget the batch is as large as fits; an explicit batch size caps it.
    /// A batch never exceeds the number of reaches to summarise. Fails if the budget cannot hold
    /// a single reach.
    ///
    /// # Arguments
    ///
    /// * `requested`: Configured batch size, if any
    /// * `bytes_per_reach`: Bytes of one reach's values across all members and time steps
    /// * `reaches`: Number of reaches to summarise
    pub fn batch_size(
        &self,
        requested: Option<usize>,
        bytes_per_reach: usize,
        reaches: usize,
    ) -> Result<usize, EnsembleError> {
        let per_reach = bytes_per_reach.max(1).saturating_mul(COPIES_PER_REACH);
        let fits = match self.total_memory {
            Some(total) if per_reach > total => {
                return Err(EnsembleError::InsufficientMemory {
                    requested: per_reach,
                    total,
                })
            }
            Some(total) => Some(total / per_reach),
            None => None,
        };
        let batch_size = match (requested, fits) {
            (Some(requested), Some(fits)) => requested.min(fits),
            (Some(requested), None) => requested,
            (None, Some(fits)) => fits,
            (None, None) => DEFAULT_BATCH_SIZE,
        };
        Ok(batch_size.min(reaches).max(1))
    }

    /// Bytes reserved for a batch of `batch_size` reaches.
    pub fn batch_bytes(batch_size: usize, bytes_per_reach: usize) -> usize {
        batch_size
            .saturating_mul(bytes_per_reach.max(1))
            .saturating_mul(COPIES_PER_REACH)
    }
}

/// Acquire permits on an optional Semaphore, if present.
async fn optional_acquire(
    sem: &Option<Semaphore>,
    n: usize,
) -> Result<Option<SemaphorePermit>, EnsembleError> {
    let n = n.try_into()?;
    if let Some(sem) = sem {
        sem.acquire_many(n)
            .await
            .map(Some)
            .map_err(|err| err.into())
    } else {
        Ok(None)
    }
}
