//! Backing memory strategies for the shared memory buffer.
//!
//! The buffer is fully backed by one committed allocation. Strategies are
//! objects so that a sparse-residency strategy can be slotted in without
//! touching buffer creation or teardown.

use crate::capabilities::DeviceCapabilities;
use crate::device::SharedMemoryDevice;
use crate::error::{GpuError, Result};
use ash::vk;

/// How the shared memory buffer gets its memory.
pub trait BackingStrategy<D: SharedMemoryDevice> {
    fn name(&self) -> &'static str;

    /// Extra flags for buffer creation.
    fn create_flags(&self) -> vk::BufferCreateFlags;

    /// Back `buffer` with memory of `memory_type`.
    ///
    /// Every allocation is pushed to `allocations` as soon as it exists, so
    /// teardown frees it even when a later step fails.
    fn commit(
        &self,
        device: &mut D,
        buffer: vk::Buffer,
        requirements: &vk::MemoryRequirements,
        memory_type: u32,
        allocations: &mut Vec<vk::DeviceMemory>,
    ) -> Result<()>;
}

/// One allocation covering the whole buffer, bound at offset 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommittedBacking;

impl<D: SharedMemoryDevice> BackingStrategy<D> for CommittedBacking {
    fn name(&self) -> &'static str {
        "committed"
    }

    fn create_flags(&self) -> vk::BufferCreateFlags {
        vk::BufferCreateFlags::empty()
    }

    fn commit(
        &self,
        device: &mut D,
        buffer: vk::Buffer,
        requirements: &vk::MemoryRequirements,
        memory_type: u32,
        allocations: &mut Vec<vk::DeviceMemory>,
    ) -> Result<()> {
        let memory = device
            .allocate_memory(requirements.size, memory_type)
            .map_err(|e| {
                GpuError::ResourceCreation(format!(
                    "failed to allocate {} MB of memory for the shared memory buffer: {e}",
                    requirements.size >> 20
                ))
            })?;
        allocations.push(memory);

        device.bind_buffer_memory(buffer, memory, 0).map_err(|e| {
            GpuError::ResourceCreation(format!(
                "failed to bind memory to the shared memory buffer: {e}"
            ))
        })
    }
}

/// Pick the backing strategy for a device.
pub fn select_backing<D: SharedMemoryDevice>(
    capabilities: &DeviceCapabilities,
) -> Box<dyn BackingStrategy<D>> {
    if capabilities.supports_sparse_buffer() {
        tracing::debug!("sparse buffer residency available, backing shared memory fully");
    }
    Box::new(CommittedBacking)
}
