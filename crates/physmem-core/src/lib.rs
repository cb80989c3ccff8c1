//! Core types for exposing emulated physical memory to a GPU.
//!
//! This crate provides the backend-independent pieces:
//! - Page and byte ranges with clipping
//! - The physical memory and memory-read observer interfaces
//! - Page validity bookkeeping
//! - Common error types

pub mod error;
pub mod memory;
pub mod observer;
pub mod range;
pub mod valid;

pub use error::{Error, Result};
pub use memory::{PhysicalMemory, VecPhysicalMemory};
pub use observer::{MemoryReadObserver, NullObserver, TracingObserver};
pub use range::{ByteRange, PageRange};
pub use valid::ValidPages;

/// Subsystem-wide constants
pub mod constants {
    /// Size of the device buffer backing the whole physical address space (512 MiB).
    pub const BUFFER_SIZE: u32 = 512 << 20;
    /// Default guest page size exponent (4 KiB pages).
    pub const DEFAULT_PAGE_SIZE_LOG2: u32 = 12;
}
