//! Device capability queries relevant to the shared memory buffer.

use ash::vk;
use std::ffi::CStr;

/// Capabilities that feed buffer creation and the barrier table.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Device name
    pub device_name: String,
    /// Tessellation shaders enabled, extending draw stage masks
    pub tessellation_shader: bool,
    /// Sparse binding support
    pub sparse_binding: bool,
    /// Sparse residency support for buffers
    pub sparse_residency_buffer: bool,
    /// Bit mask of memory types with `DEVICE_LOCAL`
    pub device_local_memory_types: u32,
    /// Alignment for flushing non-coherent host-visible memory
    pub non_coherent_atom_size: u64,
}

impl DeviceCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// `enabled_features` are the features the logical device was created
    /// with, which may be a subset of what the physical device supports.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        enabled_features: &vk::PhysicalDeviceFeatures,
    ) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        Self {
            device_name,
            tessellation_shader: enabled_features.tessellation_shader == vk::TRUE,
            sparse_binding: enabled_features.sparse_binding == vk::TRUE,
            sparse_residency_buffer: enabled_features.sparse_residency_buffer == vk::TRUE,
            device_local_memory_types: device_local_mask(&memory_properties),
            non_coherent_atom_size: properties.limits.non_coherent_atom_size.max(1),
        }
    }

    /// Whether the buffer could be created with sparse residency.
    pub fn supports_sparse_buffer(&self) -> bool {
        self.sparse_binding && self.sparse_residency_buffer
    }

    /// First memory type allowed by `allowed_types` that is device-local.
    pub fn device_local_memory_type(&self, allowed_types: u32) -> Option<u32> {
        let candidates = allowed_types & self.device_local_memory_types;
        (candidates != 0).then(|| candidates.trailing_zeros())
    }
}

fn device_local_mask(memory_properties: &vk::PhysicalDeviceMemoryProperties) -> u32 {
    memory_properties
        .memory_types
        .iter()
        .take(memory_properties.memory_type_count as usize)
        .enumerate()
        .filter(|(_, ty)| ty.property_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL))
        .fold(0, |mask, (index, _)| mask | (1 << index))
}
