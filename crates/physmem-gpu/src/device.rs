//! Device operations the shared memory buffer needs.
//!
//! [`SharedMemoryDevice`] is the context injected into
//! [`SharedMemory`](crate::SharedMemory); the Vulkan implementation forwards to
//! `ash` and creates staging pages through gpu-allocator.

use crate::capabilities::DeviceCapabilities;
use crate::config::SharedMemoryConfig;
use crate::error::Result;
use crate::memory::GpuAllocator;
use crate::upload_pool::{StagingPool, UploadBufferPool, VulkanPageAllocator};
use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Buffer and memory operations plus staging pool creation.
pub trait SharedMemoryDevice {
    type Pool: StagingPool;

    fn capabilities(&self) -> &DeviceCapabilities;

    fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        flags: vk::BufferCreateFlags,
    ) -> VkResult<vk::Buffer>;

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    fn allocate_memory(
        &mut self,
        size: vk::DeviceSize,
        memory_type: u32,
    ) -> VkResult<vk::DeviceMemory>;

    fn bind_buffer_memory(
        &mut self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;

    fn destroy_buffer(&mut self, buffer: vk::Buffer);

    fn free_memory(&mut self, memory: vk::DeviceMemory);

    /// Create the staging pool used for uploads, with pages of `page_size` bytes.
    fn create_staging_pool(
        &mut self,
        page_size: u64,
        config: &SharedMemoryConfig,
    ) -> Result<Self::Pool>;
}

/// [`SharedMemoryDevice`] over a Vulkan logical device.
pub struct VulkanSharedMemoryDevice {
    device: Arc<ash::Device>,
    allocator: Arc<Mutex<GpuAllocator>>,
    capabilities: DeviceCapabilities,
}

impl VulkanSharedMemoryDevice {
    /// Wrap an existing logical device.
    ///
    /// # Safety
    /// The instance, physical device and device must be valid, and `device`
    /// must have been created from `physical_device` with `enabled_features`.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: Arc<ash::Device>,
        allocator: Arc<Mutex<GpuAllocator>>,
        enabled_features: &vk::PhysicalDeviceFeatures,
    ) -> Self {
        let capabilities =
            unsafe { DeviceCapabilities::query(instance, physical_device, enabled_features) };
        tracing::debug!(
            device = %capabilities.device_name,
            tessellation = capabilities.tessellation_shader,
            sparse = capabilities.supports_sparse_buffer(),
            "shared memory device"
        );
        Self {
            device,
            allocator,
            capabilities,
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }
}

impl SharedMemoryDevice for VulkanSharedMemoryDevice {
    type Pool = UploadBufferPool<VulkanPageAllocator>;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        flags: vk::BufferCreateFlags,
    ) -> VkResult<vk::Buffer> {
        let create_info = vk::BufferCreateInfo::default()
            .flags(flags)
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe { self.device.create_buffer(&create_info, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn allocate_memory(
        &mut self,
        size: vk::DeviceSize,
        memory_type: u32,
    ) -> VkResult<vk::DeviceMemory> {
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type);
        unsafe { self.device.allocate_memory(&allocate_info, None) }
    }

    fn bind_buffer_memory(
        &mut self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn free_memory(&mut self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    fn create_staging_pool(
        &mut self,
        page_size: u64,
        config: &SharedMemoryConfig,
    ) -> Result<Self::Pool> {
        let pages = VulkanPageAllocator::new(
            self.device.clone(),
            self.allocator.clone(),
            config.debug_name.clone(),
            self.capabilities.non_coherent_atom_size,
        );
        Ok(UploadBufferPool::new(pages, page_size, config.max_upload_pages))
    }
}
