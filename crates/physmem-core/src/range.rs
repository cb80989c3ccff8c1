//! Page and byte ranges over the physical address space.

use serde::{Deserialize, Serialize};

/// A contiguous run of guest pages.
///
/// Dirty-page trackers hand these over in ascending, non-overlapping order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRange {
    /// First page index
    pub start: u32,
    /// Number of pages
    pub count: u32,
}

impl PageRange {
    #[inline]
    pub const fn new(start: u32, count: u32) -> Self {
        Self { start, count }
    }

    /// One past the last page.
    #[inline]
    pub const fn end(self) -> u32 {
        self.start + self.count
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.count == 0
    }

    /// Byte range covered by these pages.
    #[inline]
    pub const fn to_bytes(self, page_size_log2: u32) -> ByteRange {
        ByteRange::new(self.start << page_size_log2, self.count << page_size_log2)
    }

    /// Byte span from the first range's start through the last range's end.
    ///
    /// Assumes `ranges` is sorted; returns an empty range for an empty slice.
    pub fn covering_span(ranges: &[Self], page_size_log2: u32) -> ByteRange {
        match (ranges.first(), ranges.last()) {
            (Some(first), Some(last)) => PageRange::new(first.start, last.end() - first.start)
                .to_bytes(page_size_log2),
            _ => ByteRange::EMPTY,
        }
    }
}

/// A byte range `(offset, length)` in the device buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u32,
    pub length: u32,
}

impl ByteRange {
    pub const EMPTY: Self = Self::new(0, 0);

    #[inline]
    pub const fn new(offset: u32, length: u32) -> Self {
        Self { offset, length }
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.length == 0
    }

    /// One past the last byte, widened so it cannot overflow.
    #[inline]
    pub const fn end(self) -> u64 {
        self.offset as u64 + self.length as u64
    }

    /// Clip into `[0, size)`.
    #[must_use]
    pub fn clip(self, size: u32) -> Self {
        let offset = self.offset.min(size);
        Self {
            offset,
            length: self.length.min(size - offset),
        }
    }
}
