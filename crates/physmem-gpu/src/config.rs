//! Shared memory configuration.

use serde::{Deserialize, Serialize};

/// Tunables for the shared memory buffer and its staging pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedMemoryConfig {
    /// Staging page size in bytes, rounded up to the guest page size.
    pub upload_page_size: u64,
    /// Maximum number of staging pages alive at once.
    pub max_upload_pages: usize,
    /// Label for staging allocations.
    pub debug_name: String,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            upload_page_size: 2 << 20,
            max_upload_pages: 64,
            debug_name: "shared_memory_upload".to_string(),
        }
    }
}

impl SharedMemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the staging page size.
    pub fn upload_page_size(mut self, bytes: u64) -> Self {
        self.upload_page_size = bytes;
        self
    }

    /// Set the staging page cap.
    pub fn max_upload_pages(mut self, pages: usize) -> Self {
        self.max_upload_pages = pages;
        self
    }

    /// Set the staging allocation label.
    pub fn debug_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = name.into();
        self
    }

    /// Staging page size aligned to `1 << page_size_log2`.
    pub fn aligned_upload_page_size(&self, page_size_log2: u32) -> u64 {
        self.upload_page_size
            .max(1)
            .next_multiple_of(1 << page_size_log2)
    }
}
