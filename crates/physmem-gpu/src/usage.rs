//! Buffer usage states and the barriers between them.
//!
//! The shared memory buffer is always in one of four usages. Moving between
//! usages, or committing a write performed under the current usage, requires a
//! buffer memory barrier; everything else is free.

use ash::vk;
use physmem_core::constants::BUFFER_SIZE;
use physmem_core::ByteRange;

/// The kind of access about to be performed on the shared memory buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Index fetch, shader reads and transfer reads.
    Read,
    /// Compute shader writes (memexport resolves and the like).
    ComputeWrite,
    /// Destination of staged uploads.
    TransferDestination,
    /// Guest draws that both read and write the buffer.
    GuestDrawReadWrite,
}

/// Pipeline stages and access flags on one side of a barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarrierMasks {
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
}

impl BufferUsage {
    /// Stage and access masks for this usage.
    ///
    /// `ComputeWrite` reports shader *read* access: the mask describes what the
    /// next consumer needs once the compute write commits.
    pub fn barrier_masks(self, tessellation_shader: bool) -> BarrierMasks {
        let draw_stages = || {
            let mut stages = vk::PipelineStageFlags::VERTEX_INPUT
                | vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER;
            if tessellation_shader {
                stages |= vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER;
            }
            stages
        };
        let draw_access = vk::AccessFlags::INDEX_READ | vk::AccessFlags::SHADER_READ;

        match self {
            Self::ComputeWrite => BarrierMasks {
                stages: vk::PipelineStageFlags::COMPUTE_SHADER,
                access: vk::AccessFlags::SHADER_READ,
            },
            Self::TransferDestination => BarrierMasks {
                stages: vk::PipelineStageFlags::TRANSFER,
                access: vk::AccessFlags::TRANSFER_WRITE,
            },
            Self::Read => BarrierMasks {
                stages: draw_stages()
                    | vk::PipelineStageFlags::COMPUTE_SHADER
                    | vk::PipelineStageFlags::TRANSFER,
                access: draw_access | vk::AccessFlags::TRANSFER_READ,
            },
            Self::GuestDrawReadWrite => BarrierMasks {
                stages: draw_stages(),
                access: draw_access | vk::AccessFlags::SHADER_WRITE,
            },
        }
    }
}

/// A buffer memory barrier over part or all of the shared memory buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBarrier {
    pub src: BarrierMasks,
    pub dst: BarrierMasks,
    pub offset: vk::DeviceSize,
    /// `vk::WHOLE_SIZE` for usage transitions.
    pub size: vk::DeviceSize,
}

impl BufferBarrier {
    /// Whether the barrier covers the whole buffer.
    pub fn is_whole_buffer(&self) -> bool {
        self.offset == 0 && self.size == vk::WHOLE_SIZE
    }

    /// Build the Vulkan structure for `buffer`.
    pub fn to_vk(&self, buffer: vk::Buffer) -> vk::BufferMemoryBarrier<'static> {
        vk::BufferMemoryBarrier::default()
            .src_access_mask(self.src.access)
            .dst_access_mask(self.dst.access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer)
            .offset(self.offset)
            .size(self.size)
    }
}

/// Last usage of the buffer and the range written under it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageTracker {
    last_usage: BufferUsage,
    last_written_range: ByteRange,
    tessellation_shader: bool,
}

impl UsageTracker {
    pub fn new(tessellation_shader: bool) -> Self {
        Self {
            last_usage: BufferUsage::TransferDestination,
            last_written_range: ByteRange::EMPTY,
            tessellation_shader,
        }
    }

    /// Get the usage declared last.
    pub fn last_usage(&self) -> BufferUsage {
        self.last_usage
    }

    /// Get the range written under the last usage, clipped to the buffer.
    pub fn last_written_range(&self) -> ByteRange {
        self.last_written_range
    }

    /// Back to the post-initialization state.
    pub fn reset(&mut self) {
        self.last_usage = BufferUsage::TransferDestination;
        self.last_written_range = ByteRange::EMPTY;
    }

    /// Transition to `usage`, recording `written_range` as the range the
    /// caller is about to write.
    ///
    /// Returns the barrier to insert, if any.
    ///
    /// # Panics
    /// If `usage` is [`BufferUsage::Read`] and `written_range` is not empty.
    pub fn use_buffer(
        &mut self,
        usage: BufferUsage,
        written_range: ByteRange,
    ) -> Option<BufferBarrier> {
        let written_range = written_range.clip(BUFFER_SIZE);
        assert!(
            usage != BufferUsage::Read || written_range.is_empty(),
            "read usage of the shared memory buffer cannot write {written_range:?}"
        );

        let mut barrier = None;
        if self.last_usage != usage || !self.last_written_range.is_empty() {
            let src = self.last_usage.barrier_masks(self.tessellation_shader);
            let dst = usage.barrier_masks(self.tessellation_shader);
            barrier = Some(if self.last_usage == usage {
                // Committing the previous write
                BufferBarrier {
                    src,
                    dst,
                    offset: vk::DeviceSize::from(self.last_written_range.offset),
                    size: vk::DeviceSize::from(self.last_written_range.length),
                }
            } else {
                // Preceding writes must be visible to the new stages too
                self.last_usage = usage;
                BufferBarrier {
                    src,
                    dst,
                    offset: 0,
                    size: vk::WHOLE_SIZE,
                }
            });
        }
        self.last_written_range = written_range;
        barrier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_write_exposes_shader_read() {
        let masks = BufferUsage::ComputeWrite.barrier_masks(false);
        assert_eq!(masks.stages, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(masks.access, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn tessellation_extends_draw_stages_only() {
        for usage in [BufferUsage::Read, BufferUsage::GuestDrawReadWrite] {
            let without = usage.barrier_masks(false).stages;
            let with = usage.barrier_masks(true).stages;
            assert!(!without.contains(vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER));
            assert_eq!(
                with,
                without | vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER
            );
        }
        assert_eq!(
            BufferUsage::TransferDestination.barrier_masks(true),
            BufferUsage::TransferDestination.barrier_masks(false)
        );
    }

    #[test]
    fn read_and_draw_masks() {
        let read = BufferUsage::Read.barrier_masks(false);
        assert_eq!(
            read.stages,
            vk::PipelineStageFlags::VERTEX_INPUT
                | vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER
                | vk::PipelineStageFlags::TRANSFER
        );
        assert_eq!(
            read.access,
            vk::AccessFlags::INDEX_READ
                | vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::TRANSFER_READ
        );

        let draw = BufferUsage::GuestDrawReadWrite.barrier_masks(false);
        assert_eq!(
            draw.access,
            vk::AccessFlags::INDEX_READ | vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE
        );
    }

    #[test]
    fn same_usage_without_writes_is_free() {
        let mut tracker = UsageTracker::new(false);
        assert_eq!(
            tracker.use_buffer(BufferUsage::TransferDestination, ByteRange::EMPTY),
            None
        );
        assert!(tracker.use_buffer(BufferUsage::Read, ByteRange::EMPTY).is_some());
        assert_eq!(tracker.use_buffer(BufferUsage::Read, ByteRange::EMPTY), None);
    }

    #[test]
    fn same_usage_commits_previous_write() {
        let mut tracker = UsageTracker::new(false);
        tracker.use_buffer(BufferUsage::TransferDestination, ByteRange::new(4096, 8192));

        let barrier = tracker
            .use_buffer(BufferUsage::TransferDestination, ByteRange::new(0, 16))
            .expect("pending write must be committed");
        assert_eq!(barrier.offset, 4096);
        assert_eq!(barrier.size, 8192);
        assert_eq!(barrier.src, BufferUsage::TransferDestination.barrier_masks(false));
        assert_eq!(barrier.dst, barrier.src);
        assert_eq!(tracker.last_written_range(), ByteRange::new(0, 16));
    }

    #[test]
    fn transition_covers_whole_buffer() {
        let mut tracker = UsageTracker::new(true);
        tracker.use_buffer(BufferUsage::ComputeWrite, ByteRange::new(64, 64));

        let barrier = tracker
            .use_buffer(BufferUsage::Read, ByteRange::EMPTY)
            .expect("usage change needs a barrier");
        assert!(barrier.is_whole_buffer());
        assert_eq!(barrier.src, BufferUsage::ComputeWrite.barrier_masks(true));
        assert_eq!(barrier.dst, BufferUsage::Read.barrier_masks(true));
        assert_eq!(tracker.last_usage(), BufferUsage::Read);
        assert!(tracker.last_written_range().is_empty());
    }

    #[test]
    fn written_range_is_clipped() {
        let mut tracker = UsageTracker::new(false);
        tracker.use_buffer(
            BufferUsage::GuestDrawReadWrite,
            ByteRange::new(BUFFER_SIZE - 16, 64),
        );
        assert_eq!(
            tracker.last_written_range(),
            ByteRange::new(BUFFER_SIZE - 16, 16)
        );
    }

    #[test]
    #[should_panic(expected = "read usage")]
    fn read_with_written_range_is_a_contract_violation() {
        let mut tracker = UsageTracker::new(false);
        tracker.use_buffer(BufferUsage::Read, ByteRange::new(0, 4));
    }

    #[test]
    fn reset_restores_transfer_destination() {
        let mut tracker = UsageTracker::new(false);
        tracker.use_buffer(BufferUsage::ComputeWrite, ByteRange::new(0, 4));
        tracker.reset();
        assert_eq!(tracker.last_usage(), BufferUsage::TransferDestination);
        assert_eq!(tracker.last_written_range(), ByteRange::EMPTY);
    }
}
