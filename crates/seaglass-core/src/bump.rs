//! Linear allocation over a fixed-capacity region.
//!
//! A [`BumpAllocator`] only hands out offsets; the memory itself lives elsewhere
//! (a mapped GPU buffer, a scratch `Vec<u8>`, ...). Allocations are never freed
//! individually. The whole region is rewound with [`BumpAllocator::reset`] once the
//! consumer of the previous window is known to be done with it.

use crate::error::{Error, Result};

/// Round `value` up to the next multiple of `alignment`.
///
/// An alignment of zero or one leaves the value unchanged. Alignments do not need
/// to be powers of two.
#[inline]
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Fixed-capacity linear allocator handing out byte offsets.
#[derive(Debug, Clone)]
pub struct BumpAllocator {
    name: String,
    capacity: u64,
    head: u64,
    high_water: u64,
    allocation_count: u32,
}

impl BumpAllocator {
    /// Create an allocator over `capacity` bytes.
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            head: 0,
            high_water: 0,
            allocation_count: 0,
        }
    }

    /// Reserve `size` bytes aligned to `alignment` and return their offset.
    ///
    /// Fails with [`Error::CapacityExceeded`] instead of growing.
    pub fn alloc(&mut self, size: u64, alignment: u64) -> Result<u64> {
        let offset = align_up(self.head, alignment);
        let end = offset.checked_add(size).ok_or_else(|| self.exceeded(size))?;
        if end > self.capacity {
            return Err(self.exceeded(size));
        }

        self.head = end;
        self.high_water = self.high_water.max(end);
        self.allocation_count += 1;
        Ok(offset)
    }

    fn exceeded(&self, requested: u64) -> Error {
        Error::CapacityExceeded {
            name: self.name.clone(),
            requested,
            available: self.remaining(),
            capacity: self.capacity,
        }
    }

    /// Rewind to the start of the region.
    pub fn reset(&mut self) {
        if self.allocation_count > 0 {
            tracing::trace!(
                name = %self.name,
                used = self.head,
                allocations = self.allocation_count,
                "bump allocator reset"
            );
        }
        self.head = 0;
        self.allocation_count = 0;
    }

    /// Name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total capacity in bytes.
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes consumed since the last reset (including alignment padding).
    pub const fn used(&self) -> u64 {
        self.head
    }

    /// Bytes still available, ignoring alignment of the next request.
    pub const fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.head)
    }

    /// Largest `used()` observed over the allocator's lifetime.
    pub const fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Number of allocations since the last reset.
    pub const fn allocation_count(&self) -> u32 {
        self.allocation_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 12), 24);
        assert_eq!(align_up(5, 0), 5);
    }

    #[test]
    fn allocations_are_disjoint() {
        let mut bump = BumpAllocator::new("test", 1024);
        let requests = [(3, 1), (16, 16), (7, 4), (64, 256), (1, 8), (100, 32)];

        let mut ranges = Vec::new();
        for (size, align) in requests {
            let offset = bump.alloc(size, align).unwrap();
            assert_eq!(offset % align, 0);
            ranges.push(offset..offset + size);
        }

        for (i, a) in ranges.iter().enumerate() {
            for b in ranges.iter().skip(i + 1) {
                assert!(a.end <= b.start || b.end <= a.start, "{a:?} overlaps {b:?}");
            }
        }
        assert_eq!(bump.allocation_count(), requests.len() as u32);
    }

    #[test]
    fn overflow_is_an_error() {
        let mut bump = BumpAllocator::new("tmp", 64);
        bump.alloc(60, 1).unwrap();

        let err = bump.alloc(8, 1).unwrap_err();
        assert_eq!(
            err,
            Error::CapacityExceeded {
                name: "tmp".to_string(),
                requested: 8,
                available: 4,
                capacity: 64,
            }
        );
        // A failed request does not consume space
        assert_eq!(bump.used(), 60);
        assert_eq!(bump.alloc(4, 1).unwrap(), 60);
    }

    #[test]
    fn alignment_padding_counts_against_capacity() {
        let mut bump = BumpAllocator::new("tmp", 32);
        bump.alloc(1, 1).unwrap();
        assert!(bump.alloc(16, 32).is_err());
        assert_eq!(bump.alloc(16, 16).unwrap(), 16);
    }

    #[test]
    fn reset_rewinds_but_keeps_high_water() {
        let mut bump = BumpAllocator::new("tmp", 128);
        bump.alloc(100, 1).unwrap();
        bump.reset();

        assert_eq!(bump.used(), 0);
        assert_eq!(bump.allocation_count(), 0);
        assert_eq!(bump.high_water(), 100);
        assert_eq!(bump.alloc(10, 1).unwrap(), 0);
    }
}
