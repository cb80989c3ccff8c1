//! Host-visible staging memory via gpu-allocator.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    /// Create a buffer and bind freshly allocated memory to it.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let allocator = self
            .allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))?;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::AllocationFailed(e.to_string()));
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        let mut gpu_buffer = GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        };
        if let Err(e) = bound {
            self.free_buffer(&mut gpu_buffer)?;
            return Err(e.into());
        }

        Ok(gpu_buffer)
    }

    /// Free a buffer and its allocation.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.allocator
                .as_mut()
                .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        if buffer.buffer != vk::Buffer::null() {
            unsafe { self.device.destroy_buffer(buffer.buffer, None) };
            buffer.buffer = vk::Buffer::null();
        }

        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    pub fn shutdown(&mut self) {
        drop(self.allocator.take());
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A buffer with its gpu-allocator allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

impl GpuBuffer {
    /// Mapped host memory, if the allocation is host-visible.
    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.allocation.as_mut().and_then(Allocation::mapped_slice_mut)
    }

    /// Whether host writes are visible to the device without flushing.
    pub fn is_host_coherent(&self) -> bool {
        self.allocation.as_ref().map_or(true, |a| {
            a.memory_properties()
                .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        })
    }

    /// Flush host writes in `offset..offset + size` of this buffer.
    ///
    /// The range is widened to `atom_size`, the device's non-coherent atom.
    ///
    /// # Safety
    /// The device must be the one the buffer was allocated from.
    pub unsafe fn flush(
        &self,
        device: &ash::Device,
        offset: u64,
        size: u64,
        atom_size: u64,
    ) -> Result<()> {
        let Some(allocation) = self.allocation.as_ref() else {
            return Err(GpuError::InvalidState("Buffer has no allocation".to_string()));
        };
        if self.is_host_coherent() || size == 0 {
            return Ok(());
        }

        let start = allocation.offset() + offset;
        let aligned_start = start / atom_size * atom_size;
        let aligned_end = (start + size).div_ceil(atom_size) * atom_size;
        let range = vk::MappedMemoryRange::default()
            .memory(unsafe { allocation.memory() })
            .offset(aligned_start)
            .size(aligned_end - aligned_start);
        unsafe { device.flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }
}
