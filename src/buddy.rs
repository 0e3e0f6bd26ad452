//! The binary buddy allocator engine.
//!
//! The arena is a power-of-two address range tiled by power-of-two blocks.
//! Block metadata lives entirely outside the simulated memory, in an ordered
//! map from offset to block, so the buddy of a block at offset `A` and size
//! `s` is simply the entry at `A ^ s`. Allocation is first-fit in ascending
//! address order; freeing coalesces buddies eagerly until a buddy mismatch
//! or the full arena is rebuilt.

use std::collections::BTreeMap;

use crate::{
    metrics, utils, AllocError, Allocator, BlockInfo, HeapSnapshot, Result, MIN_BLOCK_SIZE,
};

#[derive(Debug, Clone, Copy)]
struct Block {
    /// Block capacity: a power of two in `[MIN_BLOCK_SIZE, total_size]`.
    size: usize,
    /// User-requested size while in use, 0 when free.
    allocated: usize,
    free: bool,
}

impl Block {
    fn free(size: usize) -> Self {
        Block {
            size,
            allocated: 0,
            free: true,
        }
    }

    fn waste(&self) -> f64 {
        if self.free {
            0.0
        } else {
            (self.size - self.allocated) as f64 / self.size as f64
        }
    }
}

/// A binary buddy allocator over a simulated power-of-two arena.
///
/// See the [crate documentation](crate) for an example.
#[derive(Debug)]
pub struct BuddyHeap {
    total_size: usize,
    allocated_size: usize,
    /// Offset -> block; the entries tile `[0, total_size)` exactly.
    blocks: BTreeMap<usize, Block>,
}

impl BuddyHeap {
    /// Construct an arena of `capacity` bytes, rounded up to the next power
    /// of two (and to at least [`MIN_BLOCK_SIZE`]).
    pub fn new(capacity: usize) -> Self {
        let total_size = capacity.max(MIN_BLOCK_SIZE).next_power_of_two();
        log::debug!("BuddyHeap::new({capacity}) -> {total_size} byte arena");

        let mut blocks = BTreeMap::new();
        blocks.insert(0, Block::free(total_size));
        BuddyHeap {
            total_size,
            allocated_size: 0,
            blocks,
        }
    }

    /// Block size a request maps to: the next power of two, clamped to at
    /// least [`MIN_BLOCK_SIZE`].
    fn block_size_for(req: usize) -> usize {
        req.next_power_of_two().max(MIN_BLOCK_SIZE)
    }

    /// Halve the block at `offset` until it reaches `want` (or the minimum),
    /// leaving the split-off upper halves free.
    fn split_down(&mut self, offset: usize, mut size: usize, want: usize) -> usize {
        while size > want && size > MIN_BLOCK_SIZE {
            size >>= 1;
            self.blocks.insert(offset + size, Block::free(size));
        }
        size
    }

    fn claim(&mut self, offset: usize, size: usize, req: usize) {
        self.blocks.insert(
            offset,
            Block {
                size,
                allocated: req,
                free: false,
            },
        );
        self.allocated_size += req;
    }

    fn external_fragmentation_below(&self, limit: usize) -> f64 {
        if self.blocks.is_empty() || self.allocated_size == 0 {
            return 0.0;
        }

        let mut hist = metrics::FreeHistogram::new();
        for (_, block) in self.blocks.range(..limit) {
            if block.free {
                hist.record(block.size);
            }
        }
        metrics::unweighted_external(&hist)
    }
}

impl Allocator for BuddyHeap {
    fn alloc(&mut self, req: usize) -> Result<usize> {
        if req == 0 {
            return Ok(0);
        }
        if req > self.total_size {
            return Err(AllocError::OutOfMemory { requested: req });
        }

        let want = Self::block_size_for(req);

        // First fit in ascending address order.
        let mut found = None;
        for (&offset, block) in &self.blocks {
            if block.free && block.size >= want {
                found = Some((offset, block.size));
                break;
            }
        }
        let (offset, size) = found.ok_or(AllocError::OutOfMemory { requested: req })?;

        let size = self.split_down(offset, size, want);
        self.claim(offset, size, req);
        log::trace!("buddy: alloc({req}) -> {offset:#x} (block size {size})");
        Ok(offset)
    }

    fn align_alloc(&mut self, req: usize) -> Result<usize> {
        if req == 0 {
            return Ok(0);
        }
        if req > self.total_size {
            return Err(AllocError::OutOfMemory { requested: req });
        }

        let want = Self::block_size_for(req);

        // First free block that contains an alignment-grid position with
        // room for a `want`-sized block behind it.
        let mut found = None;
        for (&offset, block) in &self.blocks {
            if !block.free || block.size < want {
                continue;
            }
            let grid = utils::round_up(offset, want);
            if grid - offset + want <= block.size {
                found = Some((offset, block.size));
                break;
            }
        }
        let (mut offset, mut size) = found.ok_or(AllocError::OutOfMemory { requested: req })?;

        // Split off free lower halves until the block starts on the grid.
        // (A buddy block's offset is a multiple of its size, so any block of
        // size >= want is already aligned; this guards the general case.)
        while offset % want != 0 && size > MIN_BLOCK_SIZE {
            let half = size >> 1;
            self.blocks.insert(offset, Block::free(half));
            offset += half;
            size = half;
            self.blocks.insert(offset, Block::free(size));
        }
        debug_assert_eq!(offset % want, 0);

        let size = self.split_down(offset, size, want);
        self.claim(offset, size, req);
        log::trace!("buddy: align_alloc({req}) -> {offset:#x} (block size {size})");
        Ok(offset)
    }

    fn dealloc(&mut self, offset: usize) -> Result<()> {
        let block = match self.blocks.get(&offset) {
            Some(block) => *block,
            None => return Err(AllocError::InvalidFree { offset }),
        };
        if block.free {
            return Err(AllocError::DoubleFree { offset });
        }

        self.allocated_size -= block.allocated;
        self.blocks.insert(offset, Block::free(block.size));
        log::trace!("buddy: dealloc({offset:#x}) (block size {})", block.size);

        // Eager coalescing: merge equal-sized free buddies, keeping the
        // lower-addressed block, until a mismatch or the arena is whole.
        let mut offset = offset;
        let mut size = block.size;
        while size < self.total_size {
            let buddy = if offset & size != 0 {
                offset - size
            } else {
                offset + size
            };
            match self.blocks.get(&buddy) {
                Some(other) if other.free && other.size == size => {}
                _ => break,
            }

            let lower = offset.min(buddy);
            self.blocks.remove(&offset.max(buddy));
            size <<= 1;
            self.blocks.insert(lower, Block::free(size));
            offset = lower;
        }

        Ok(())
    }

    fn total_space(&self) -> usize {
        self.total_size
    }

    fn allocated_space(&self) -> usize {
        self.allocated_size
    }

    fn internal_fragmentation(&self) -> f64 {
        let wasted = self
            .blocks
            .values()
            .filter(|block| !block.free)
            .map(|block| block.size - block.allocated)
            .sum();
        metrics::internal_fragmentation(wasted, self.allocated_size)
    }

    fn external_fragmentation(&self) -> f64 {
        self.external_fragmentation_below(self.total_size)
    }

    fn trimmed_external_fragmentation(&self) -> f64 {
        self.external_fragmentation_below(self.find_last_allocated_address())
    }

    fn find_last_allocated_address(&self) -> usize {
        self.blocks
            .iter()
            .filter(|(_, block)| !block.free)
            .map(|(&offset, block)| offset + block.size)
            .max()
            .unwrap_or(0)
    }

    fn snapshot(&self) -> HeapSnapshot {
        HeapSnapshot {
            total_size: self.total_size,
            blocks: self
                .blocks
                .iter()
                .map(|(&offset, block)| BlockInfo {
                    offset,
                    size: block.size,
                    is_free: block.free,
                    waste: block.waste(),
                })
                .collect(),
        }
    }
}
