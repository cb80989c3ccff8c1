//! Observers notified when guest memory is read for upload.

/// Fire-and-forget notification of physical memory reads, used by trace
/// writers to capture the memory a frame depends on.
pub trait MemoryReadObserver {
    fn notify_memory_read(&mut self, address: u32, length: u32);
}

/// Observer that discards every notification.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullObserver;

impl MemoryReadObserver for NullObserver {
    fn notify_memory_read(&mut self, _address: u32, _length: u32) {}
}

/// Observer that logs reads at trace level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl MemoryReadObserver for TracingObserver {
    fn notify_memory_read(&mut self, address: u32, length: u32) {
        tracing::trace!(address = format_args!("0x{address:08x}"), length, "memory read");
    }
}

/// Observers can be recorded into a vector, which tests use to inspect order.
impl MemoryReadObserver for Vec<(u32, u32)> {
    fn notify_memory_read(&mut self, address: u32, length: u32) {
        self.push((address, length));
    }
}
