//! GPU error types.

use ash::vk;
use thiserror::Error;

/// Shared memory errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Buffer or memory creation, memory type selection, or binding failed.
    #[error("Resource creation failed: {0}")]
    ResourceCreation(String),

    /// The staging pool could not satisfy an upload request.
    #[error("Staging pool exhausted while requesting {requested} bytes")]
    StagingExhausted { requested: u64 },

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Physical memory access failed.
    #[error(transparent)]
    Memory(#[from] physmem_core::Error),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
