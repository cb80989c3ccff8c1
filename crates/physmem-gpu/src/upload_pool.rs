//! Pooled host-visible staging memory for uploads.
//!
//! Staging pages are lent out for the duration of one submission. A page the
//! host has stopped writing is only handed out again once the submission it
//! was last written for has completed on the device.

use crate::error::{GpuError, Result};
use crate::memory::{GpuAllocator, GpuBuffer};
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Staging memory borrowed for one submission.
#[derive(Debug)]
pub struct StagingAllocation<'a> {
    /// Buffer the memory belongs to, used as the copy source.
    pub buffer: vk::Buffer,
    /// Offset of `data` within `buffer`.
    pub offset: vk::DeviceSize,
    /// Host-visible bytes to fill.
    pub data: &'a mut [u8],
}

impl StagingAllocation<'_> {
    pub fn size(&self) -> vk::DeviceSize {
        self.data.len() as vk::DeviceSize
    }
}

/// Source of staging memory for uploads.
pub trait StagingPool {
    /// Request up to `size` bytes aligned to `alignment` for `submission`.
    ///
    /// The grant may be smaller than `size` but is never empty. Returns `None`
    /// when no memory can be provided.
    fn request_partial(
        &mut self,
        submission: u64,
        size: u64,
        alignment: u64,
    ) -> Option<StagingAllocation<'_>>;

    /// Allow reuse of memory tagged with submissions up to `completed_submission`.
    fn reclaim(&mut self, completed_submission: u64);

    /// Make host writes visible to the device.
    fn flush_writes(&mut self) -> Result<()>;
}

/// A host-visible page the pool sub-allocates from.
pub trait UploadPage {
    fn buffer(&self) -> vk::Buffer;
    fn mapped(&mut self) -> &mut [u8];
}

/// Creates and destroys staging pages.
pub trait PageAllocator {
    type Page: UploadPage;

    fn allocate_page(&mut self, size: u64) -> Result<Self::Page>;

    /// Flush host writes in `offset..offset + size` of `page`.
    fn flush(&mut self, page: &Self::Page, offset: u64, size: u64) -> Result<()>;

    fn free_page(&mut self, page: Self::Page);
}

struct PageSlot<P> {
    page: P,
    last_submission: u64,
    flush_start: u64,
    flush_end: u64,
}

/// Ring of staging pages with submission-tagged reuse.
pub struct UploadBufferPool<A: PageAllocator> {
    allocator: A,
    page_size: u64,
    max_pages: usize,
    slots: Vec<PageSlot<A::Page>>,
    /// Slot currently written to and its fill level.
    writable: Option<(usize, u64)>,
    /// Full slots waiting for their submission, in submission order.
    submitted: VecDeque<usize>,
    free: Vec<usize>,
}

impl<A: PageAllocator> UploadBufferPool<A> {
    pub fn new(allocator: A, page_size: u64, max_pages: usize) -> Self {
        Self {
            allocator,
            page_size,
            max_pages,
            slots: Vec::new(),
            writable: None,
            submitted: VecDeque::new(),
            free: Vec::new(),
        }
    }

    /// Get the size of each staging page.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Number of pages created so far.
    pub fn page_count(&self) -> usize {
        self.slots.len()
    }

    /// Pages created so far, in creation order.
    pub fn pages(&self) -> impl Iterator<Item = &A::Page> {
        self.slots.iter().map(|slot| &slot.page)
    }

    /// Get the page allocator.
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    fn acquire_slot(&mut self) -> Option<usize> {
        if let Some(slot) = self.free.pop() {
            return Some(slot);
        }
        if self.slots.len() >= self.max_pages {
            tracing::debug!(
                max_pages = self.max_pages,
                waiting = self.submitted.len(),
                "upload pool has no reclaimed pages"
            );
            return None;
        }
        match self.allocator.allocate_page(self.page_size) {
            Ok(page) => {
                self.slots.push(PageSlot {
                    page,
                    last_submission: 0,
                    flush_start: 0,
                    flush_end: 0,
                });
                Some(self.slots.len() - 1)
            }
            Err(e) => {
                tracing::error!("Failed to create a {} KB upload page: {e}", self.page_size >> 10);
                None
            }
        }
    }
}

impl<A: PageAllocator> StagingPool for UploadBufferPool<A> {
    fn request_partial(
        &mut self,
        submission: u64,
        size: u64,
        alignment: u64,
    ) -> Option<StagingAllocation<'_>> {
        if size == 0 || alignment == 0 || alignment > self.page_size {
            return None;
        }

        let mut current = self
            .writable
            .map(|(slot, used)| (slot, used.next_multiple_of(alignment)))
            .filter(|&(_, offset)| offset < self.page_size);
        if current.is_none() {
            if let Some((slot, _)) = self.writable.take() {
                self.submitted.push_back(slot);
            }
            current = Some((self.acquire_slot()?, 0));
        }
        let (slot_index, offset) = current?;

        let granted = size.min(self.page_size - offset);
        if offset + granted < self.page_size {
            self.writable = Some((slot_index, offset + granted));
        } else {
            // Full pages wait for their submission right away
            self.writable = None;
            self.submitted.push_back(slot_index);
        }

        let slot = &mut self.slots[slot_index];
        slot.last_submission = slot.last_submission.max(submission);
        if slot.flush_end == slot.flush_start {
            slot.flush_start = offset;
        }
        slot.flush_start = slot.flush_start.min(offset);
        slot.flush_end = slot.flush_end.max(offset + granted);

        let buffer = slot.page.buffer();
        let data = slot
            .page
            .mapped()
            .get_mut(offset as usize..(offset + granted) as usize)?;
        Some(StagingAllocation {
            buffer,
            offset,
            data,
        })
    }

    fn reclaim(&mut self, completed_submission: u64) {
        while let Some(&slot) = self.submitted.front() {
            if self.slots[slot].last_submission > completed_submission {
                break;
            }
            self.submitted.pop_front();
            self.free.push(slot);
        }
        if let Some((slot, _)) = self.writable {
            if self.submitted.is_empty()
                && self.slots[slot].last_submission <= completed_submission
            {
                self.writable = None;
                self.free.push(slot);
            }
        }
    }

    fn flush_writes(&mut self) -> Result<()> {
        for slot in &mut self.slots {
            if slot.flush_end > slot.flush_start {
                self.allocator.flush(
                    &slot.page,
                    slot.flush_start,
                    slot.flush_end - slot.flush_start,
                )?;
            }
            slot.flush_start = 0;
            slot.flush_end = 0;
        }
        Ok(())
    }
}

impl<A: PageAllocator> Drop for UploadBufferPool<A> {
    fn drop(&mut self) {
        for slot in self.slots.drain(..) {
            self.allocator.free_page(slot.page);
        }
    }
}

impl UploadPage for GpuBuffer {
    fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    fn mapped(&mut self) -> &mut [u8] {
        self.mapped_slice_mut().unwrap_or(&mut [])
    }
}

/// Staging pages as `CpuToGpu` transfer-source buffers from gpu-allocator.
pub struct VulkanPageAllocator {
    device: Arc<ash::Device>,
    allocator: Arc<Mutex<GpuAllocator>>,
    name: String,
    non_coherent_atom_size: u64,
}

impl VulkanPageAllocator {
    pub fn new(
        device: Arc<ash::Device>,
        allocator: Arc<Mutex<GpuAllocator>>,
        name: impl Into<String>,
        non_coherent_atom_size: u64,
    ) -> Self {
        Self {
            device,
            allocator,
            name: name.into(),
            non_coherent_atom_size: non_coherent_atom_size.max(1),
        }
    }
}

impl PageAllocator for VulkanPageAllocator {
    type Page = GpuBuffer;

    fn allocate_page(&mut self, size: u64) -> Result<GpuBuffer> {
        let mut allocator = self.allocator.lock();
        let mut page = allocator.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            &self.name,
        )?;
        if page.mapped_slice_mut().is_none() {
            allocator.free_buffer(&mut page)?;
            return Err(GpuError::AllocationFailed(
                "upload page is not host-visible".to_string(),
            ));
        }
        Ok(page)
    }

    fn flush(&mut self, page: &GpuBuffer, offset: u64, size: u64) -> Result<()> {
        unsafe { page.flush(&self.device, offset, size, self.non_coherent_atom_size) }
    }

    fn free_page(&mut self, mut page: GpuBuffer) {
        if let Err(e) = self.allocator.lock().free_buffer(&mut page) {
            tracing::error!("Failed to free upload page: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HeapPageAllocator;

    const PAGE: u64 = 4096;

    fn pool(max_pages: usize) -> UploadBufferPool<HeapPageAllocator> {
        UploadBufferPool::new(HeapPageAllocator::default(), 4 * PAGE, max_pages)
    }

    #[test]
    fn sub_allocates_sequentially_from_one_page() {
        let mut pool = pool(4);

        let first = pool.request_partial(1, PAGE, PAGE).map(|a| (a.buffer, a.offset, a.size()));
        let second = pool.request_partial(1, 2 * PAGE, PAGE).map(|a| (a.buffer, a.offset, a.size()));

        let (buffer_a, offset_a, size_a) = first.unwrap();
        let (buffer_b, offset_b, size_b) = second.unwrap();
        assert_eq!(buffer_a, buffer_b);
        assert_eq!((offset_a, size_a), (0, PAGE));
        assert_eq!((offset_b, size_b), (PAGE, 2 * PAGE));
        assert_eq!(pool.page_count(), 1);
    }

    #[test]
    fn grant_is_partial_at_page_end() {
        let mut pool = pool(4);
        pool.request_partial(1, 3 * PAGE, PAGE).unwrap();

        let allocation = pool.request_partial(1, 8 * PAGE, PAGE).unwrap();
        assert_eq!(allocation.offset, 3 * PAGE);
        assert_eq!(allocation.size(), PAGE);
    }

    #[test]
    fn unaligned_fill_is_rounded_up() {
        let mut pool = pool(4);
        pool.request_partial(1, 100, 1).unwrap();

        let allocation = pool.request_partial(1, PAGE, PAGE).unwrap();
        assert_eq!(allocation.offset, PAGE);
    }

    #[test]
    fn exhausted_without_reclaim() {
        let mut pool = pool(1);
        pool.request_partial(1, 4 * PAGE, PAGE).unwrap();

        assert!(pool.request_partial(2, PAGE, PAGE).is_none());
        assert_eq!(pool.allocator().allocated(), 1);
    }

    #[test]
    fn pages_reused_only_after_completion() {
        let mut pool = pool(1);
        let first_buffer = pool.request_partial(1, 4 * PAGE, PAGE).unwrap().buffer;
        assert!(pool.request_partial(2, PAGE, PAGE).is_none());

        pool.reclaim(0);
        assert!(pool.request_partial(2, PAGE, PAGE).is_none());

        pool.reclaim(1);
        let reused = pool.request_partial(2, PAGE, PAGE).unwrap();
        assert_eq!(reused.buffer, first_buffer);
        assert_eq!(reused.offset, 0);
    }

    #[test]
    fn full_page_is_reclaimed_without_another_request() {
        let mut pool = UploadBufferPool::new(HeapPageAllocator::default(), PAGE, 1);
        let first_buffer = pool.request_partial(1, PAGE, PAGE).unwrap().buffer;

        pool.reclaim(1);
        let reused = pool.request_partial(2, PAGE, PAGE).unwrap();
        assert_eq!(reused.buffer, first_buffer);
        assert_eq!(reused.offset, 0);
        assert_eq!(pool.page_count(), 1);
    }

    #[test]
    fn partly_filled_page_is_rewound_after_completion() {
        let mut pool = pool(1);
        pool.request_partial(1, PAGE, PAGE).unwrap();

        pool.reclaim(0);
        assert_eq!(pool.request_partial(1, PAGE, PAGE).unwrap().offset, PAGE);

        pool.reclaim(1);
        assert_eq!(pool.request_partial(2, PAGE, PAGE).unwrap().offset, 0);
        assert_eq!(pool.page_count(), 1);
    }

    #[test]
    fn page_tag_follows_latest_submission() {
        let mut pool = pool(1);
        pool.request_partial(1, PAGE, PAGE).unwrap();
        pool.request_partial(3, 3 * PAGE, PAGE).unwrap();
        assert!(pool.request_partial(4, PAGE, PAGE).is_none());

        pool.reclaim(2);
        assert!(pool.request_partial(4, PAGE, PAGE).is_none());
        pool.reclaim(3);
        assert!(pool.request_partial(4, PAGE, PAGE).is_some());
    }

    #[test]
    fn flush_writes_covers_written_span_once() {
        let mut pool = pool(2);
        pool.request_partial(1, PAGE, PAGE).unwrap();
        pool.request_partial(1, PAGE, PAGE).unwrap();

        pool.flush_writes().unwrap();
        pool.flush_writes().unwrap();

        let flushes = pool.allocator().flushes();
        assert_eq!(flushes.len(), 1);
        assert_eq!((flushes[0].1, flushes[0].2), (0, 2 * PAGE));
    }

    #[test]
    fn drop_frees_every_page() {
        let allocator = HeapPageAllocator::default();
        let freed = allocator.freed_counter();
        {
            let mut pool = UploadBufferPool::new(allocator, PAGE, 4);
            pool.request_partial(1, PAGE, PAGE).unwrap();
            pool.request_partial(1, PAGE, PAGE).unwrap();
            assert_eq!(pool.page_count(), 2);
        }
        assert_eq!(freed.get(), 2);
    }

    #[test]
    fn failed_page_creation_is_exhaustion() {
        let mut pool = UploadBufferPool::new(HeapPageAllocator::failing(), PAGE, 4);
        assert!(pool.request_partial(1, PAGE, PAGE).is_none());
    }
}
