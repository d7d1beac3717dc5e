//! # Buddy Allocator
//!
//! A binary buddy allocator over an abstract range of offsets `0..size`. It is used to carve
//! coherent DMA buffers out of a fixed memory pool, see
//! [`CoherentPool`](crate::device::sim::dma::CoherentPool).
//!
//! Every block has a power-of-two size and is aligned to its size. Allocations are rounded up to
//! the next block size. When a block is freed and its buddy (the other half of the parent block)
//! is also free, both are merged again.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// Errors of the buddy allocator.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuddyError {
    /// Pool and minimum block sizes must be powers of two.
    #[error("{0:#x} is not a power of two")]
    NotPowerOfTwo(u64),

    /// The minimum block size is larger than the pool.
    #[error("Minimum block size {min_block:#x} exceeds pool size {size:#x}")]
    BlockLargerThanPool {
        /// The pool size.
        size: u64,
        /// The requested minimum block size.
        min_block: u64,
    },

    /// No free block is large enough.
    #[error("Out of memory allocating {0:#x} bytes")]
    OutOfMemory(u64),

    /// The offset passed to [`BuddyAllocator::free`] was not handed out by the allocator.
    #[error("Unknown allocation at {0:#x}")]
    UnknownAllocation(u64),
}

/// The order of the smallest block that holds `size` bytes.
fn order_of(size: u64) -> u32 {
    size.next_power_of_two().trailing_zeros()
}

/// A buddy allocator.
#[derive(Debug, Clone)]
pub struct BuddyAllocator {
    size: u64,
    min_order: u32,
    max_order: u32,

    /// Free blocks by order. A block of order `n` is `1 << n` bytes large.
    free_lists: Vec<BTreeSet<u64>>,

    /// Allocated blocks and their order.
    allocated: BTreeMap<u64, u32>,
}

impl BuddyAllocator {
    /// Create an allocator managing `size` bytes handing out blocks of at least `min_block`
    /// bytes.
    pub fn new(size: u64, min_block: u64) -> Result<Self, BuddyError> {
        if !size.is_power_of_two() {
            return Err(BuddyError::NotPowerOfTwo(size));
        }
        if !min_block.is_power_of_two() {
            return Err(BuddyError::NotPowerOfTwo(min_block));
        }
        if min_block > size {
            return Err(BuddyError::BlockLargerThanPool { size, min_block });
        }

        let max_order = order_of(size);
        let mut free_lists = vec![BTreeSet::new(); max_order as usize + 1];

        // Initially the whole pool is one free block.
        free_lists[max_order as usize].insert(0);

        Ok(Self {
            size,
            min_order: order_of(min_block),
            max_order,
            free_lists,
            allocated: BTreeMap::new(),
        })
    }

    /// The size of the managed range in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// The number of bytes in free blocks.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free_lists
            .iter()
            .enumerate()
            .map(|(order, list)| (list.len() as u64) << order)
            .sum()
    }

    /// The size of the block allocated at `offset`.
    #[must_use]
    pub fn block_size(&self, offset: u64) -> Option<u64> {
        self.allocated.get(&offset).map(|&order| 1 << order)
    }

    /// Allocate a block of at least `size` bytes and return its offset.
    ///
    /// The lowest free block of the smallest sufficient order is used.
    pub fn allocate(&mut self, size: u64) -> Result<u64, BuddyError> {
        if size > self.size {
            return Err(BuddyError::OutOfMemory(size));
        }

        let required = order_of(size).max(self.min_order);

        let (offset, found) = (required..=self.max_order)
            .find_map(|order| {
                self.free_lists[order as usize]
                    .pop_first()
                    .map(|offset| (offset, order))
            })
            .ok_or(BuddyError::OutOfMemory(size))?;

        // Split the block until it has the required size. The upper halves become free.
        for order in (required..found).rev() {
            self.free_lists[order as usize].insert(offset + (1 << order));
        }

        self.allocated.insert(offset, required);
        Ok(offset)
    }

    /// Free the block at `offset`.
    pub fn free(&mut self, offset: u64) -> Result<(), BuddyError> {
        let mut order = self
            .allocated
            .remove(&offset)
            .ok_or(BuddyError::UnknownAllocation(offset))?;
        let mut offset = offset;

        while order < self.max_order {
            let buddy = offset ^ (1 << order);

            if !self.free_lists[order as usize].remove(&buddy) {
                break;
            }

            offset = offset.min(buddy);
            order += 1;
        }

        self.free_lists[order as usize].insert(offset);
        Ok(())
    }
}

/// Renders the pool as `|`-separated block sizes from low to high offsets. Allocated blocks are
/// prefixed with `*`, e.g. `*128|128|256|512`.
impl fmt::Display for BuddyAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut offset = 0;
        let mut first = true;

        while offset < self.size {
            let (order, marker) = if let Some(&order) = self.allocated.get(&offset) {
                (order, "*")
            } else if let Some(order) =
                (0..=self.max_order).find(|&o| self.free_lists[o as usize].contains(&offset))
            {
                (order, "")
            } else {
                // Blocks tile the pool, so this only happens if the bookkeeping is broken.
                return Err(fmt::Error);
            };

            if !first {
                write!(f, "|")?;
            }
            write!(f, "{marker}{}", 1u64 << order)?;

            first = false;
            offset += 1 << order;
        }

        Ok(())
    }
}
