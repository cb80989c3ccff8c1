//! Vulkan device buffer mirroring emulated physical memory.
//!
//! This crate provides:
//! - The shared memory buffer and its backing allocation
//! - Usage tracking with minimal buffer memory barriers
//! - Staged uploads of dirty page ranges with coalesced copies
//! - Submission-driven reclaim of staging memory

pub mod backing;
pub mod capabilities;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod memory;
pub mod shared_memory;
pub mod upload_pool;
pub mod usage;

#[cfg(test)]
pub(crate) mod testing;

pub use backing::{select_backing, BackingStrategy, CommittedBacking};
pub use capabilities::DeviceCapabilities;
pub use command::{CommandRecorder, CopyRegion, DeferredCommand, DeferredCommandBuffer};
pub use config::SharedMemoryConfig;
pub use device::{SharedMemoryDevice, VulkanSharedMemoryDevice};
pub use error::{GpuError, Result};
pub use memory::{GpuAllocator, GpuBuffer};
pub use shared_memory::{SharedMemory, UploadSources};
pub use upload_pool::{
    PageAllocator, StagingAllocation, StagingPool, UploadBufferPool, UploadPage, VulkanPageAllocator,
};
pub use usage::{BarrierMasks, BufferBarrier, BufferUsage, UsageTracker};
