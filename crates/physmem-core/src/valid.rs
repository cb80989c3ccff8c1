//! Page validity bookkeeping for the device copy of physical memory.
//!
//! A page is valid when the device buffer holds (or has a copy in flight
//! holding) the current contents of that page.

/// Bitmap with one bit per guest page.
#[derive(Clone, Debug, Default)]
pub struct ValidPages {
    bits: Vec<u64>,
    page_size_log2: u32,
    page_count: u32,
}

impl ValidPages {
    /// Create a bitmap covering `size` bytes with all pages invalid.
    pub fn new(size: u32, page_size_log2: u32) -> Self {
        let page_count = size >> page_size_log2;
        Self {
            bits: vec![0; page_count.div_ceil(64) as usize],
            page_size_log2,
            page_count,
        }
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Mark every page touched by the byte range as valid.
    pub fn make_range_valid(&mut self, offset: u32, length: u32) {
        self.set_range(offset, length, true);
    }

    /// Mark every page touched by the byte range as invalid.
    pub fn invalidate_range(&mut self, offset: u32, length: u32) {
        self.set_range(offset, length, false);
    }

    /// Whether every page touched by the byte range is valid.
    pub fn is_range_valid(&self, offset: u32, length: u32) -> bool {
        self.pages(offset, length)
            .all(|page| self.bits[(page >> 6) as usize] & (1 << (page & 63)) != 0)
    }

    /// Invalidate everything.
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    fn set_range(&mut self, offset: u32, length: u32, valid: bool) {
        for page in self.pages(offset, length) {
            let word = &mut self.bits[(page >> 6) as usize];
            if valid {
                *word |= 1 << (page & 63);
            } else {
                *word &= !(1 << (page & 63));
            }
        }
    }

    fn pages(&self, offset: u32, length: u32) -> std::ops::Range<u32> {
        if length == 0 {
            return 0..0;
        }
        let first = offset >> self.page_size_log2;
        let end = u64::from(offset) + u64::from(length);
        let last = ((end - 1) >> self.page_size_log2) as u32;
        first.min(self.page_count)..(last + 1).min(self.page_count)
    }
}
