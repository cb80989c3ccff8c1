//! Emulated physical memory interface.
//!
//! The emulator's memory system implements [`PhysicalMemory`]; the shared
//! memory subsystem only ever reads through it to stage uploads.

use crate::error::{Error, Result};

/// Read-only view of the emulated physical address space.
pub trait PhysicalMemory {
    /// Guest page size exponent (page size is `1 << page_size_log2`).
    fn page_size_log2(&self) -> u32;

    /// Total addressable bytes.
    fn size(&self) -> u64;

    /// Translate a physical address into a host slice of `length` bytes for
    /// bulk sequential copy.
    fn translate(&self, address: u32, length: u32) -> Result<&[u8]>;

    /// Page size in bytes.
    fn page_size(&self) -> u32 {
        1 << self.page_size_log2()
    }
}

/// Contiguous heap-backed physical memory.
#[derive(Clone, Debug)]
pub struct VecPhysicalMemory {
    bytes: Vec<u8>,
    page_size_log2: u32,
}

impl VecPhysicalMemory {
    /// Create zero-filled memory of `size` bytes.
    pub fn new(size: usize, page_size_log2: u32) -> Self {
        Self {
            bytes: vec![0; size],
            page_size_log2,
        }
    }

    /// Write bytes at a physical address.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let range = self.checked(address, data.len() as u64)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Fill every byte with a value derived from its address.
    pub fn fill_with(&mut self, f: impl Fn(usize) -> u8) {
        for (address, byte) in self.bytes.iter_mut().enumerate() {
            *byte = f(address);
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn checked(&self, address: u32, length: u64) -> Result<std::ops::Range<usize>> {
        let start = address as usize;
        let out_of_bounds = || Error::OutOfBounds {
            address: u64::from(address),
            length,
        };
        let end = start
            .checked_add(usize::try_from(length).map_err(|_| out_of_bounds())?)
            .ok_or_else(out_of_bounds)?;
        if end > self.bytes.len() {
            return Err(out_of_bounds());
        }
        Ok(start..end)
    }
}

impl PhysicalMemory for VecPhysicalMemory {
    fn page_size_log2(&self) -> u32 {
        self.page_size_log2
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn translate(&self, address: u32, length: u32) -> Result<&[u8]> {
        let range = self.checked(address, u64::from(length))?;
        Ok(&self.bytes[range])
    }
}
