//! The device buffer mirroring emulated physical memory.
//!
//! [`SharedMemory`] owns a single [`BUFFER_SIZE`] buffer covering the whole
//! physical address space. Host-side writes reach it through staged uploads
//! of dirty page ranges; every access by the renderer goes through
//! [`SharedMemory::use_buffer`] so that the minimal set of buffer memory
//! barriers is recorded between transfers, compute writes and draws.

use crate::backing::{select_backing, BackingStrategy, CommittedBacking};
use crate::command::{CommandRecorder, CopyRegion};
use crate::config::SharedMemoryConfig;
use crate::device::SharedMemoryDevice;
use crate::error::{GpuError, Result};
use crate::upload_pool::StagingPool;
use crate::usage::{BufferUsage, UsageTracker};
use ash::vk;
use physmem_core::constants::BUFFER_SIZE;
use physmem_core::{ByteRange, MemoryReadObserver, PageRange, PhysicalMemory, ValidPages};

/// Where upload data comes from and which submission it belongs to.
pub struct UploadSources<'a> {
    pub memory: &'a dyn PhysicalMemory,
    pub observer: &'a mut dyn MemoryReadObserver,
    /// Submission the copies are recorded into.
    pub submission: u64,
}

/// Device buffer backing the emulated physical address space.
pub struct SharedMemory<D: SharedMemoryDevice> {
    device: D,
    config: SharedMemoryConfig,
    backing: Box<dyn BackingStrategy<D>>,
    page_size_log2: u32,

    buffer: vk::Buffer,
    buffer_memory: Vec<vk::DeviceMemory>,
    buffer_memory_type: Option<u32>,

    usage: UsageTracker,
    valid_pages: ValidPages,
    upload_pool: Option<D::Pool>,
    upload_regions: Vec<CopyRegion>,
}

const BUFFER_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::INDEX_BUFFER.as_raw(),
);

impl<D: SharedMemoryDevice> SharedMemory<D> {
    /// Create an uninitialized shared memory for guest pages of
    /// `1 << page_size_log2` bytes.
    pub fn new(device: D, config: SharedMemoryConfig, page_size_log2: u32) -> Self {
        let usage = UsageTracker::new(device.capabilities().tessellation_shader);
        let backing = select_backing(device.capabilities());
        Self {
            device,
            config,
            backing,
            page_size_log2,
            buffer: vk::Buffer::null(),
            buffer_memory: Vec::new(),
            buffer_memory_type: None,
            usage,
            valid_pages: ValidPages::new(BUFFER_SIZE, page_size_log2),
            upload_pool: None,
            upload_regions: Vec::new(),
        }
    }

    /// Use a different backing strategy than the one selected for the device.
    #[must_use]
    pub fn with_backing(mut self, backing: Box<dyn BackingStrategy<D>>) -> Self {
        self.backing = backing;
        self
    }

    /// Get the shared memory buffer, null until initialized.
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    /// Check whether the buffer exists.
    pub fn is_initialized(&self) -> bool {
        self.buffer != vk::Buffer::null()
    }

    /// Memory type of the committed backing, once initialized.
    pub fn buffer_memory_type(&self) -> Option<u32> {
        self.buffer_memory_type
    }

    /// Get the name of the backing strategy in use.
    pub fn backing_name(&self) -> &'static str {
        self.backing.name()
    }

    /// Get the guest page size exponent.
    pub fn page_size_log2(&self) -> u32 {
        self.page_size_log2
    }

    /// Get the usage tracker.
    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    /// Get the pages currently valid in the buffer.
    pub fn valid_pages(&self) -> &ValidPages {
        &self.valid_pages
    }

    /// Get the staging pool, once initialized.
    pub fn staging_pool(&self) -> Option<&D::Pool> {
        self.upload_pool.as_ref()
    }

    /// Get the device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Create the buffer, back it with device-local memory and set up the
    /// staging pool.
    ///
    /// On failure everything created so far is torn down again. Fails with
    /// [`GpuError::InvalidState`] if already initialized.
    pub fn initialize(&mut self) -> Result<()> {
        if self.is_initialized() {
            return Err(GpuError::InvalidState(
                "shared memory is already initialized".to_string(),
            ));
        }
        self.initialize_common();
        if let Err(e) = self.create_resources() {
            tracing::error!("Shared memory: {e}");
            self.shutdown();
            return Err(e);
        }

        tracing::debug!(
            size_mb = BUFFER_SIZE >> 20,
            memory_type = self.buffer_memory_type,
            backing = self.backing.name(),
            upload_page_size = self.config.aligned_upload_page_size(self.page_size_log2),
            "shared memory initialized"
        );
        Ok(())
    }

    fn create_resources(&mut self) -> Result<()> {
        let size = vk::DeviceSize::from(BUFFER_SIZE);
        let flags = self.backing.create_flags();
        self.buffer = match self.device.create_buffer(size, BUFFER_USAGE, flags) {
            Ok(buffer) => buffer,
            Err(e) if !flags.is_empty() => {
                tracing::debug!("Shared memory: {flags:?} buffer creation failed ({e}), retrying without");
                self.backing = Box::new(CommittedBacking);
                self.device
                    .create_buffer(size, BUFFER_USAGE, vk::BufferCreateFlags::empty())
                    .map_err(buffer_creation_failed)?
            }
            Err(e) => return Err(buffer_creation_failed(e)),
        };

        let requirements = self.device.buffer_memory_requirements(self.buffer);
        let memory_type = self
            .device
            .capabilities()
            .device_local_memory_type(requirements.memory_type_bits)
            .ok_or_else(|| {
                GpuError::ResourceCreation(
                    "failed to get a device-local memory type for the buffer".to_string(),
                )
            })?;
        self.buffer_memory_type = Some(memory_type);

        self.backing.commit(
            &mut self.device,
            self.buffer,
            &requirements,
            memory_type,
            &mut self.buffer_memory,
        )?;

        let page_size = self.config.aligned_upload_page_size(self.page_size_log2);
        self.upload_pool = Some(self.device.create_staging_pool(page_size, &self.config)?);
        Ok(())
    }

    /// Destroy the buffer, its memory and the staging pool.
    ///
    /// Safe to call repeatedly and after a failed [`initialize`](Self::initialize).
    /// The device must no longer be using the buffer.
    pub fn shutdown(&mut self) {
        self.release_resources();
        self.shutdown_common();
    }

    fn release_resources(&mut self) {
        self.upload_pool = None;
        self.upload_regions.clear();
        self.usage.reset();

        if self.buffer != vk::Buffer::null() {
            self.device.destroy_buffer(self.buffer);
            self.buffer = vk::Buffer::null();
        }
        for memory in self.buffer_memory.drain(..) {
            self.device.free_memory(memory);
        }
        self.buffer_memory_type = None;
    }

    fn initialize_common(&mut self) {
        self.valid_pages.clear();
    }

    fn shutdown_common(&mut self) {
        self.valid_pages.clear();
    }

    /// Let staging memory from submissions up to `completed_submission` be reused.
    pub fn completed_submission_updated(&mut self, completed_submission: u64) {
        if let Some(pool) = self.upload_pool.as_mut() {
            pool.reclaim(completed_submission);
        }
    }

    /// Make staged host writes visible before the submission executes.
    pub fn end_submission(&mut self) -> Result<()> {
        match self.upload_pool.as_mut() {
            Some(pool) => pool.flush_writes(),
            None => Ok(()),
        }
    }

    /// Declare the next access to the buffer, recording a barrier if the
    /// usage changes or a previous write has to be committed.
    ///
    /// # Panics
    /// If `usage` is [`BufferUsage::Read`] and `written_range` is not empty.
    pub fn use_buffer(
        &mut self,
        recorder: &mut impl CommandRecorder,
        usage: BufferUsage,
        written_range: ByteRange,
    ) {
        record_use(recorder, &mut self.usage, self.buffer, usage, written_range);
    }

    /// Upload sorted, disjoint dirty page ranges into the buffer.
    ///
    /// Chunks staged in the same staging buffer are copied with one command.
    /// If staging memory runs out, the rest of the batch is abandoned but the
    /// copies already staged are still recorded.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn upload_ranges(
        &mut self,
        recorder: &mut impl CommandRecorder,
        sources: UploadSources<'_>,
        ranges: &[PageRange],
    ) -> Result<()> {
        if ranges.is_empty() {
            return Ok(());
        }

        let Some(pool) = self.upload_pool.as_mut() else {
            return Err(GpuError::InvalidState(
                "shared memory is not initialized".to_string(),
            ));
        };

        let page_size_log2 = self.page_size_log2;
        // Ranges are sorted, one ordering barrier covers all destinations
        record_use(
            recorder,
            &mut self.usage,
            self.buffer,
            BufferUsage::TransferDestination,
            PageRange::covering_span(ranges, page_size_log2),
        );

        let UploadSources {
            memory,
            observer,
            submission,
        } = sources;
        let alignment = 1u64 << page_size_log2;
        let mut result = Ok(());
        let mut previous_buffer = vk::Buffer::null();
        self.upload_regions.clear();

        'ranges: for range in ranges {
            let bytes = range.to_bytes(page_size_log2);
            observer.notify_memory_read(bytes.offset, bytes.length);

            let mut start = range.start;
            let mut remaining = range.count;
            while remaining != 0 {
                let requested = u64::from(remaining) << page_size_log2;
                let Some(allocation) = pool
                    .request_partial(submission, requested, alignment)
                    .filter(|allocation| allocation.size() >= alignment)
                else {
                    tracing::error!(
                        "Shared memory: Failed to get an upload buffer for {requested} bytes"
                    );
                    result = Err(GpuError::StagingExhausted { requested });
                    break 'ranges;
                };

                let pages = (allocation.size() >> page_size_log2) as u32;
                let address = start << page_size_log2;
                let size = pages << page_size_log2;
                let source = match memory.translate(address, size) {
                    Ok(source) => source,
                    Err(e) => {
                        tracing::error!("Shared memory: Failed to read guest memory: {e}");
                        result = Err(e.into());
                        break 'ranges;
                    }
                };
                // Valid before the copy is in flight, so checks never race it
                self.valid_pages.make_range_valid(address, size);
                allocation.data[..size as usize].copy_from_slice(source);

                if previous_buffer != allocation.buffer && !self.upload_regions.is_empty() {
                    flush_copies(recorder, previous_buffer, self.buffer, &mut self.upload_regions);
                }
                previous_buffer = allocation.buffer;
                self.upload_regions.push(CopyRegion {
                    src_offset: allocation.offset,
                    dst_offset: vk::DeviceSize::from(address),
                    size: vk::DeviceSize::from(size),
                });

                start += pages;
                remaining -= pages;
            }
        }

        if !self.upload_regions.is_empty() {
            flush_copies(recorder, previous_buffer, self.buffer, &mut self.upload_regions);
        }
        result
    }
}

impl<D: SharedMemoryDevice> Drop for SharedMemory<D> {
    fn drop(&mut self) {
        // Common state is dropped with its fields
        self.release_resources();
    }
}

fn buffer_creation_failed(e: vk::Result) -> GpuError {
    GpuError::ResourceCreation(format!(
        "failed to create the {} MB buffer: {e}",
        BUFFER_SIZE >> 20
    ))
}

fn record_use(
    recorder: &mut impl CommandRecorder,
    tracker: &mut UsageTracker,
    buffer: vk::Buffer,
    usage: BufferUsage,
    written_range: ByteRange,
) {
    if let Some(barrier) = tracker.use_buffer(usage, written_range) {
        tracing::trace!(
            ?usage,
            offset = barrier.offset,
            size = barrier.size,
            "shared memory barrier"
        );
        recorder.pipeline_barrier(buffer, &barrier);
    }
}

fn flush_copies(
    recorder: &mut impl CommandRecorder,
    src: vk::Buffer,
    dst: vk::Buffer,
    regions: &mut Vec<CopyRegion>,
) {
    debug_assert_ne!(src, vk::Buffer::null());
    tracing::trace!(regions = regions.len(), "shared memory upload copy");
    recorder.copy_buffer(src, dst, regions);
    regions.clear();
}
