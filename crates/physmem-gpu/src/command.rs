//! Deferred command recording.
//!
//! Commands touching the shared memory buffer are recorded as plain values
//! first and replayed onto a real command buffer when the submission is built.

use crate::usage::BufferBarrier;
use ash::vk;

/// Sink for the commands the shared memory buffer emits.
pub trait CommandRecorder {
    /// Insert a single buffer memory barrier on `buffer`.
    fn pipeline_barrier(&mut self, buffer: vk::Buffer, barrier: &BufferBarrier);

    /// Copy `regions` from `src` into `dst` with one command.
    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[CopyRegion]);
}

/// One region of a batched buffer copy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopyRegion {
    pub src_offset: vk::DeviceSize,
    pub dst_offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl From<CopyRegion> for vk::BufferCopy {
    fn from(region: CopyRegion) -> Self {
        Self {
            src_offset: region.src_offset,
            dst_offset: region.dst_offset,
            size: region.size,
        }
    }
}

/// A recorded command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeferredCommand {
    PipelineBarrier {
        buffer: vk::Buffer,
        barrier: BufferBarrier,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<CopyRegion>,
    },
}

/// Command stream recorded in memory.
#[derive(Debug, Default)]
pub struct DeferredCommandBuffer {
    commands: Vec<DeferredCommand>,
}

impl DeferredCommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded commands, in order.
    pub fn commands(&self) -> &[DeferredCommand] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drop all recorded commands.
    pub fn reset(&mut self) {
        self.commands.clear();
    }

    /// Replay the recorded commands onto `cmd`.
    ///
    /// # Safety
    /// The device and command buffer must be valid and `cmd` must be in the
    /// recording state. Every buffer referenced by the commands must be alive.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn execute(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        for command in &self.commands {
            match command {
                DeferredCommand::PipelineBarrier { buffer, barrier } => {
                    device.cmd_pipeline_barrier(
                        cmd,
                        barrier.src.stages,
                        barrier.dst.stages,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[barrier.to_vk(*buffer)],
                        &[],
                    );
                }
                DeferredCommand::CopyBuffer { src, dst, regions } => {
                    let regions: Vec<vk::BufferCopy> =
                        regions.iter().copied().map(vk::BufferCopy::from).collect();
                    device.cmd_copy_buffer(cmd, *src, *dst, &regions);
                }
            }
        }
    }
}

impl CommandRecorder for DeferredCommandBuffer {
    fn pipeline_barrier(&mut self, buffer: vk::Buffer, barrier: &BufferBarrier) {
        self.commands.push(DeferredCommand::PipelineBarrier {
            buffer,
            barrier: *barrier,
        });
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[CopyRegion]) {
        self.commands.push(DeferredCommand::CopyBuffer {
            src,
            dst,
            regions: regions.to_vec(),
        });
    }
}
