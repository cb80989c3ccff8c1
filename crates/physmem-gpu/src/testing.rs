//! Fakes for exercising the shared memory buffer without a GPU.

use crate::capabilities::DeviceCapabilities;
use crate::config::SharedMemoryConfig;
use crate::device::SharedMemoryDevice;
use crate::error::{GpuError, Result};
use crate::upload_pool::{PageAllocator, UploadBufferPool, UploadPage};
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Heap-backed staging page.
pub struct HeapPage {
    pub buffer: vk::Buffer,
    pub bytes: Vec<u8>,
}

impl UploadPage for HeapPage {
    fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    fn mapped(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Page allocator handing out heap pages with distinct fake buffer handles.
#[derive(Default)]
pub struct HeapPageAllocator {
    allocated: usize,
    freed: Rc<Cell<usize>>,
    flushes: Vec<(vk::Buffer, u64, u64)>,
    fail: bool,
}

impl HeapPageAllocator {
    /// Allocator whose every page creation fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn freed_counter(&self) -> Rc<Cell<usize>> {
        self.freed.clone()
    }

    pub fn flushes(&self) -> &[(vk::Buffer, u64, u64)] {
        &self.flushes
    }
}

impl PageAllocator for HeapPageAllocator {
    type Page = HeapPage;

    fn allocate_page(&mut self, size: u64) -> Result<HeapPage> {
        if self.fail {
            return Err(GpuError::AllocationFailed("heap page".to_string()));
        }
        self.allocated += 1;
        Ok(HeapPage {
            buffer: vk::Buffer::from_raw(0x8000_0000 + self.allocated as u64),
            bytes: vec![0; size as usize],
        })
    }

    fn flush(&mut self, page: &HeapPage, offset: u64, size: u64) -> Result<()> {
        self.flushes.push((page.buffer, offset, size));
        Ok(())
    }

    fn free_page(&mut self, _page: HeapPage) {
        self.freed.set(self.freed.get() + 1);
    }
}

/// Everything the fake device was asked to do.
#[derive(Debug, Default)]
pub struct DeviceLog {
    pub created: Vec<(vk::Buffer, vk::BufferCreateFlags)>,
    pub failed_creates: Vec<vk::BufferCreateFlags>,
    pub destroyed: Vec<vk::Buffer>,
    pub allocated: Vec<(vk::DeviceMemory, u64, u32)>,
    pub freed: Vec<vk::DeviceMemory>,
    pub bound: Vec<(vk::Buffer, vk::DeviceMemory, u64)>,
}

/// Recording [`SharedMemoryDevice`] with injectable failures.
pub struct FakeDevice {
    pub capabilities: DeviceCapabilities,
    pub log: Rc<RefCell<DeviceLog>>,
    /// Buffer creation fails if the flags intersect these.
    pub reject_create_flags: vk::BufferCreateFlags,
    pub fail_create: bool,
    pub memory_type_bits: u32,
    pub fail_allocate: bool,
    pub fail_bind: bool,
    pub next_handle: u64,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                device_name: "fake".to_string(),
                device_local_memory_types: 0b0110,
                non_coherent_atom_size: 64,
                ..Default::default()
            },
            log: Rc::default(),
            reject_create_flags: vk::BufferCreateFlags::empty(),
            fail_create: false,
            memory_type_bits: 0b1100,
            fail_allocate: false,
            fail_bind: false,
            next_handle: 0,
        }
    }
}

impl FakeDevice {
    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

impl SharedMemoryDevice for FakeDevice {
    type Pool = UploadBufferPool<HeapPageAllocator>;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_buffer(
        &mut self,
        _size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        flags: vk::BufferCreateFlags,
    ) -> VkResult<vk::Buffer> {
        if self.fail_create || flags.intersects(self.reject_create_flags) {
            self.log.borrow_mut().failed_creates.push(flags);
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let buffer = vk::Buffer::from_raw(self.allocate_handle());
        self.log.borrow_mut().created.push((buffer, flags));
        Ok(buffer)
    }

    fn buffer_memory_requirements(&self, _buffer: vk::Buffer) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: u64::from(physmem_core::constants::BUFFER_SIZE),
            alignment: 65536,
            memory_type_bits: self.memory_type_bits,
        }
    }

    fn allocate_memory(
        &mut self,
        size: vk::DeviceSize,
        memory_type: u32,
    ) -> VkResult<vk::DeviceMemory> {
        if self.fail_allocate {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let memory = vk::DeviceMemory::from_raw(self.allocate_handle());
        self.log.borrow_mut().allocated.push((memory, size, memory_type));
        Ok(memory)
    }

    fn bind_buffer_memory(
        &mut self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        if self.fail_bind {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        self.log.borrow_mut().bound.push((buffer, memory, offset));
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        self.log.borrow_mut().destroyed.push(buffer);
    }

    fn free_memory(&mut self, memory: vk::DeviceMemory) {
        self.log.borrow_mut().freed.push(memory);
    }

    fn create_staging_pool(
        &mut self,
        page_size: u64,
        config: &SharedMemoryConfig,
    ) -> Result<Self::Pool> {
        Ok(UploadBufferPool::new(
            HeapPageAllocator::default(),
            page_size,
            config.max_upload_pages,
        ))
    }
}
