//! The TLSF (Two-Level Segregated Fit) allocator engine.
//!
//! # Data structure overview
//!
//! The arena is an owned byte buffer. Every block is an inline header
//! followed by its payload; headers carry the payload size, the in-use
//! bookkeeping, a back-link to the physical predecessor, and — while the
//! block is free — doubly-linked free-list siblings. Starting from offset 0
//! and repeatedly advancing by `HEADER_SIZE + size` visits every block and
//! ends exactly at the arena boundary.
//!
//! Free blocks are indexed by a two-level segregated list matrix
//! `free_heads[fl][sl]`: the first level buckets by power of two
//! (`fl = ⌊log2 size⌋ - log2 MIN`), the second subdivides each power of two
//! into [`SL_COUNT`] linear ranges. Two summary bitmaps (`fl_bitmap`,
//! `sl_bitmap[fl]`) mirror list emptiness so that a fit is found with at
//! most two bit scans.
//!
//! Block identity never leaves the crate as a pointer: headers are read and
//! written through bounds-checked accessors over the byte buffer, and the
//! public API deals in plain payload offsets.

use core::fmt;

use crate::{
    metrics, utils, AllocError, Allocator, BlockInfo, HeapSnapshot, Result, MIN_BLOCK_SIZE,
};

/// Size of the inline block header: five 64-bit words.
pub const HEADER_SIZE: usize = 40;

/// First-level index count (powers of two).
const FL_COUNT: usize = 32;
/// Second-level subdivisions per first-level bucket.
const SL_COUNT: usize = 32;

/// Payload sizes are multiples of this.
const GRANULARITY: usize = 8;

const MIN_LOG2: u32 = MIN_BLOCK_SIZE.trailing_zeros();

// Header word offsets. The size word keeps the free flag in bit 0 (payload
// sizes are 8-byte multiples, so the low bits are spare); links store the
// target header offset, with `LINK_NONE` meaning "no link".
const WORD_SIZE: usize = 0;
const WORD_ALLOCATED: usize = 8;
const WORD_PREV_PHYS: usize = 16;
const WORD_NEXT_FREE: usize = 24;
const WORD_PREV_FREE: usize = 32;

const SIZE_FREE: u64 = 1;
const SIZE_MASK: u64 = !(GRANULARITY as u64 - 1);
const LINK_NONE: u64 = u64::MAX;

/// A TLSF allocator over a simulated byte arena.
///
/// See the [crate documentation](crate) for an example.
pub struct TlsfHeap {
    arena: Box<[u8]>,
    total_size: usize,
    allocated_size: usize,
    fl_bitmap: u32,
    sl_bitmap: [u32; FL_COUNT],
    free_heads: [[Option<usize>; SL_COUNT]; FL_COUNT],
}

/// One step of a physical-chain walk.
#[derive(Debug, Clone, Copy)]
struct PhysBlock {
    hdr: usize,
    size: usize,
    free: bool,
    allocated: usize,
}

/// Best-effort iterator over the physical chain; stops silently on any
/// inconsistency instead of erroring.
struct PhysWalk<'a> {
    heap: &'a TlsfHeap,
    at: usize,
}

impl Iterator for PhysWalk<'_> {
    type Item = PhysBlock;

    fn next(&mut self) -> Option<PhysBlock> {
        if self.at + HEADER_SIZE > self.heap.total_size {
            return None;
        }
        let hdr = self.at;
        let size = self.heap.block_size(hdr);
        if size == 0 || size > self.heap.total_size {
            return None;
        }

        let item = PhysBlock {
            hdr,
            size,
            free: self.heap.is_free(hdr),
            allocated: self.heap.allocated(hdr),
        };

        let next = hdr + HEADER_SIZE + size;
        self.at = if next <= hdr || next > self.heap.total_size {
            self.heap.total_size
        } else {
            next
        };
        Some(item)
    }
}

impl TlsfHeap {
    /// Construct an arena of `capacity` bytes (rounded down to the 8-byte
    /// granularity, and up to the smallest workable arena). The arena starts
    /// as one free block of `capacity - HEADER_SIZE` payload bytes.
    pub fn new(capacity: usize) -> Self {
        let total_size =
            utils::round_down(capacity, GRANULARITY).max(HEADER_SIZE + MIN_BLOCK_SIZE);
        log::debug!("TlsfHeap::new({capacity}) -> {total_size} byte arena");

        let mut heap = TlsfHeap {
            arena: vec![0; total_size].into_boxed_slice(),
            total_size,
            allocated_size: 0,
            fl_bitmap: 0,
            sl_bitmap: [0; FL_COUNT],
            free_heads: [[None; SL_COUNT]; FL_COUNT],
        };

        let first_size = total_size - HEADER_SIZE;
        heap.write_free_header(0, first_size, None);
        heap.link_free(0, first_size);
        heap
    }

    /* Header accessors. Internal callers pass offsets that are known to be
     * in bounds; `dealloc` validation uses the checked variants. */

    fn word(&self, at: usize) -> u64 {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(&self.arena[at..at + 8]);
        u64::from_le_bytes(bytes)
    }

    fn set_word(&mut self, at: usize, value: u64) {
        self.arena[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn block_size(&self, hdr: usize) -> usize {
        (self.word(hdr + WORD_SIZE) & SIZE_MASK) as usize
    }

    fn set_block_size(&mut self, hdr: usize, size: usize) {
        debug_assert_eq!(size % GRANULARITY, 0);
        let flags = self.word(hdr + WORD_SIZE) & !SIZE_MASK;
        self.set_word(hdr + WORD_SIZE, size as u64 | flags);
    }

    fn is_free(&self, hdr: usize) -> bool {
        self.word(hdr + WORD_SIZE) & SIZE_FREE != 0
    }

    fn set_free(&mut self, hdr: usize, free: bool) {
        let word = self.word(hdr + WORD_SIZE);
        let word = if free { word | SIZE_FREE } else { word & !SIZE_FREE };
        self.set_word(hdr + WORD_SIZE, word);
    }

    fn allocated(&self, hdr: usize) -> usize {
        self.word(hdr + WORD_ALLOCATED) as usize
    }

    fn set_allocated(&mut self, hdr: usize, allocated: usize) {
        self.set_word(hdr + WORD_ALLOCATED, allocated as u64);
    }

    fn link(&self, at: usize) -> Option<usize> {
        match self.word(at) {
            LINK_NONE => None,
            offset => Some(offset as usize),
        }
    }

    fn set_link(&mut self, at: usize, target: Option<usize>) {
        self.set_word(at, target.map_or(LINK_NONE, |offset| offset as u64));
    }

    fn prev_phys(&self, hdr: usize) -> Option<usize> {
        self.link(hdr + WORD_PREV_PHYS)
    }

    fn set_prev_phys(&mut self, hdr: usize, target: Option<usize>) {
        self.set_link(hdr + WORD_PREV_PHYS, target);
    }

    fn next_free(&self, hdr: usize) -> Option<usize> {
        self.link(hdr + WORD_NEXT_FREE)
    }

    fn set_next_free(&mut self, hdr: usize, target: Option<usize>) {
        self.set_link(hdr + WORD_NEXT_FREE, target);
    }

    fn prev_free(&self, hdr: usize) -> Option<usize> {
        self.link(hdr + WORD_PREV_FREE)
    }

    fn set_prev_free(&mut self, hdr: usize, target: Option<usize>) {
        self.set_link(hdr + WORD_PREV_FREE, target);
    }

    /// Write a complete free-block header at `hdr`, unlinked from any free
    /// list.
    fn write_free_header(&mut self, hdr: usize, size: usize, prev_phys: Option<usize>) {
        debug_assert_eq!(size % GRANULARITY, 0);
        self.set_word(hdr + WORD_SIZE, size as u64 | SIZE_FREE);
        self.set_word(hdr + WORD_ALLOCATED, 0);
        self.set_prev_phys(hdr, prev_phys);
        self.set_next_free(hdr, None);
        self.set_prev_free(hdr, None);
    }

    /// Erase a header absorbed by a merge so stale bytes cannot later pass
    /// `dealloc` validation.
    fn erase_header(&mut self, hdr: usize) {
        self.arena[hdr..hdr + HEADER_SIZE].fill(0);
    }

    /// Physical successor of the block at `hdr` with payload size `size`,
    /// if the chain continues past it.
    fn phys_next(&self, hdr: usize, size: usize) -> Option<usize> {
        let next = hdr + HEADER_SIZE + size;
        if next + HEADER_SIZE <= self.total_size {
            Some(next)
        } else {
            None
        }
    }

    fn phys_blocks(&self) -> PhysWalk<'_> {
        PhysWalk { heap: self, at: 0 }
    }

    /* The two-level free index. */

    /// Map a size to its `(fl, sl)` cell. Saturates to the last cell on
    /// first-level overflow (unreachable for sizes that fit the arena, since
    /// oversized requests are rejected up front).
    fn map_index(size: usize) -> (usize, usize) {
        let size = size.max(MIN_BLOCK_SIZE);
        let fl = (utils::fls(size) - MIN_LOG2) as usize;
        if fl >= FL_COUNT {
            return (FL_COUNT - 1, SL_COUNT - 1);
        }

        let span = 1usize << (fl as u32 + MIN_LOG2);
        let sl = (size & (span - 1)) * SL_COUNT / span;
        (fl, sl)
    }

    /// Push a free block at the head of its size cell and set the summary
    /// bits.
    fn link_free(&mut self, hdr: usize, size: usize) {
        let (fl, sl) = Self::map_index(size);

        let head = self.free_heads[fl][sl];
        self.set_next_free(hdr, head);
        self.set_prev_free(hdr, None);
        if let Some(head) = head {
            self.set_prev_free(head, Some(hdr));
        }
        self.free_heads[fl][sl] = Some(hdr);

        self.fl_bitmap |= 1 << fl;
        self.sl_bitmap[fl] |= 1 << sl;
    }

    /// Unlink a free block from its size cell, clearing the summary bits if
    /// the cell empties.
    fn unlink_free(&mut self, hdr: usize, size: usize) {
        let next = self.next_free(hdr);
        let prev = self.prev_free(hdr);

        if let Some(next) = next {
            self.set_prev_free(next, prev);
        }
        if let Some(prev) = prev {
            self.set_next_free(prev, next);
        } else {
            let (fl, sl) = Self::map_index(size);
            debug_assert_eq!(self.free_heads[fl][sl], Some(hdr));
            self.free_heads[fl][sl] = next;
            if next.is_none() {
                self.sl_bitmap[fl] &= !(1 << sl);
                if self.sl_bitmap[fl] == 0 {
                    self.fl_bitmap &= !(1 << fl);
                }
            }
        }

        self.set_next_free(hdr, None);
        self.set_prev_free(hdr, None);
    }

    /// Find a free block of at least `want` bytes: scan the request's own
    /// second level upward, then the first non-empty higher first level. At
    /// most two bit scans.
    fn find_free(&self, want: usize) -> Option<usize> {
        let (fl, sl) = Self::map_index(want);

        let sl_map = self.sl_bitmap[fl] & (!0u32 << sl);
        if sl_map != 0 {
            let sl = sl_map.trailing_zeros() as usize;
            if let Some(hdr) = self.free_heads[fl][sl] {
                // The request's own cell rounds down, so its head can be a
                // shade too small; higher cells always fit.
                if self.block_size(hdr) >= want {
                    return Some(hdr);
                }
            }
        }

        let mut fl_map = if fl + 1 < FL_COUNT {
            self.fl_bitmap & (!0u32 << (fl + 1))
        } else {
            0
        };
        while fl_map != 0 {
            let fl = fl_map.trailing_zeros() as usize;
            let sl_map = self.sl_bitmap[fl];
            if sl_map != 0 {
                let sl = sl_map.trailing_zeros() as usize;
                if let Some(hdr) = self.free_heads[fl][sl] {
                    if self.block_size(hdr) >= want {
                        return Some(hdr);
                    }
                }
            }
            fl_map &= fl_map - 1;
        }

        None
    }

    /// Carve the tail of an unlinked block down to `want` payload bytes,
    /// returning the residue to the free index. No-op when the residue could
    /// not hold a minimum block and its header.
    fn split(&mut self, hdr: usize, want: usize) {
        let want = utils::round_up(want, GRANULARITY).max(MIN_BLOCK_SIZE);
        let size = self.block_size(hdr);
        if size < want + HEADER_SIZE + MIN_BLOCK_SIZE {
            return;
        }

        let succ = self.phys_next(hdr, size);

        let tail = hdr + HEADER_SIZE + want;
        let tail_size = size - want - HEADER_SIZE;
        self.set_block_size(hdr, want);
        self.write_free_header(tail, tail_size, Some(hdr));
        if let Some(succ) = succ {
            self.set_prev_phys(succ, Some(tail));
        }
        self.link_free(tail, tail_size);
    }

    /// Merge the freed, unlinked block at `hdr` with whichever physical
    /// neighbors are free, then return the result to the free index.
    fn coalesce(&mut self, hdr: usize) {
        // Forward: absorb a free successor, after verifying that its
        // back-link agrees with the chain.
        let size = self.block_size(hdr);
        if let Some(next) = self.phys_next(hdr, size) {
            if self.is_free(next) && self.prev_phys(next) == Some(hdr) {
                let next_size = self.block_size(next);
                let next_next = self.phys_next(next, next_size);
                self.unlink_free(next, next_size);
                self.set_block_size(hdr, size + HEADER_SIZE + next_size);
                self.erase_header(next);
                if let Some(next_next) = next_next {
                    self.set_prev_phys(next_next, Some(hdr));
                }
            }
        }

        // Backward: fold this block into a free predecessor. Adjacency is
        // re-verified arithmetically before trusting the back-link.
        if let Some(prev) = self.prev_phys(hdr) {
            if prev + HEADER_SIZE <= self.total_size {
                let prev_size = self.block_size(prev);
                if self.is_free(prev) && prev + HEADER_SIZE + prev_size == hdr {
                    let size = self.block_size(hdr);
                    let next = self.phys_next(hdr, size);
                    self.unlink_free(prev, prev_size);
                    let merged = prev_size + HEADER_SIZE + size;
                    self.set_block_size(prev, merged);
                    self.erase_header(hdr);
                    if let Some(next) = next {
                        self.set_prev_phys(next, Some(prev));
                    }
                    self.link_free(prev, merged);
                    return;
                }
            }
        }

        let size = self.block_size(hdr);
        self.link_free(hdr, size);
    }

    /// Validate that `offset` names a live allocation and return its header
    /// offset.
    fn validate_for_free(&self, offset: usize) -> Result<usize> {
        let invalid = AllocError::InvalidFree { offset };

        let hdr = offset.checked_sub(HEADER_SIZE).ok_or(invalid)?;
        if hdr % GRANULARITY != 0 || hdr + HEADER_SIZE > self.total_size {
            return Err(invalid);
        }

        let size = self.block_size(hdr);
        if size < MIN_BLOCK_SIZE || size > self.total_size {
            return Err(invalid);
        }
        if hdr + HEADER_SIZE + size > self.total_size {
            return Err(invalid);
        }
        if self.allocated(hdr) > size {
            return Err(invalid);
        }
        if self.is_free(hdr) {
            return Err(AllocError::DoubleFree { offset });
        }
        Ok(hdr)
    }

    fn external_fragmentation_below(&self, limit: usize) -> f64 {
        if self.allocated_size == 0 {
            return 0.0;
        }

        let mut hist = metrics::FreeHistogram::new();
        for block in self.phys_blocks() {
            if block.hdr >= limit {
                break;
            }
            if block.free {
                hist.record(block.size);
            }
        }
        metrics::weighted_external(&hist)
    }
}

impl Allocator for TlsfHeap {
    fn alloc(&mut self, req: usize) -> Result<usize> {
        if req == 0 {
            return Ok(0);
        }
        if req > self.total_size - HEADER_SIZE {
            return Err(AllocError::OutOfMemory { requested: req });
        }

        let want = utils::round_up(req, GRANULARITY).max(MIN_BLOCK_SIZE);
        let hdr = self
            .find_free(want)
            .ok_or(AllocError::OutOfMemory { requested: req })?;

        let size = self.block_size(hdr);
        self.unlink_free(hdr, size);
        self.split(hdr, want);

        self.set_free(hdr, false);
        self.set_allocated(hdr, req);
        self.allocated_size += req;

        let offset = hdr + HEADER_SIZE;
        log::trace!("tlsf: alloc({req}) -> {offset:#x}");
        Ok(offset)
    }

    fn align_alloc(&mut self, req: usize) -> Result<usize> {
        if req == 0 {
            return Ok(0);
        }
        if req > self.total_size - HEADER_SIZE {
            return Err(AllocError::OutOfMemory { requested: req });
        }

        let want = utils::round_up(req, GRANULARITY).max(MIN_BLOCK_SIZE);
        let hdr = self
            .find_free(want)
            .ok_or(AllocError::OutOfMemory { requested: req })?;
        let size = self.block_size(hdr);

        // Aligned payload position inside the candidate: the first grid
        // multiple of `want` whose front gap is either zero or big enough to
        // carve off as a free block.
        let data = hdr + HEADER_SIZE;
        let mut aligned = utils::round_up(data, want);
        while aligned != data && aligned - data < HEADER_SIZE + MIN_BLOCK_SIZE {
            aligned += want;
        }
        let gap = aligned - data;
        if gap + want > size {
            return Err(AllocError::InvalidArgument { requested: req });
        }

        self.unlink_free(hdr, size);

        let hdr = if gap == 0 {
            hdr
        } else {
            // The candidate keeps the front gap as a free block; the chosen
            // block's header relocates to just before the aligned payload
            // and takes the rest of the span.
            let succ = self.phys_next(hdr, size);
            let front_size = gap - HEADER_SIZE;
            self.set_block_size(hdr, front_size);
            self.link_free(hdr, front_size);

            let new_hdr = aligned - HEADER_SIZE;
            self.write_free_header(new_hdr, size - gap, Some(hdr));
            if let Some(succ) = succ {
                self.set_prev_phys(succ, Some(new_hdr));
            }
            new_hdr
        };

        self.split(hdr, want);
        self.set_free(hdr, false);
        self.set_allocated(hdr, req);
        self.allocated_size += req;

        log::trace!("tlsf: align_alloc({req}) -> {aligned:#x}");
        Ok(aligned)
    }

    fn dealloc(&mut self, offset: usize) -> Result<()> {
        if offset == 0 {
            return Ok(());
        }

        let hdr = self.validate_for_free(offset)?;
        self.allocated_size -= self.allocated(hdr);
        self.set_allocated(hdr, 0);
        self.set_free(hdr, true);
        self.set_next_free(hdr, None);
        self.set_prev_free(hdr, None);

        log::trace!("tlsf: dealloc({offset:#x})");
        self.coalesce(hdr);
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
            .phys_blocks()
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
        self.phys_blocks()
            .filter(|block| !block.free)
            .map(|block| block.hdr + HEADER_SIZE + block.size)
            .last()
            .unwrap_or(0)
    }

    fn snapshot(&self) -> HeapSnapshot {
        HeapSnapshot {
            total_size: self.total_size,
            blocks: self
                .phys_blocks()
                .map(|block| BlockInfo {
                    offset: block.hdr,
                    size: block.size,
                    is_free: block.free,
                    waste: if block.free {
                        0.0
                    } else {
                        (block.size - block.allocated) as f64 / block.size as f64
                    },
                })
                .collect(),
        }
    }
}

impl fmt::Debug for TlsfHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsfHeap")
            .field("total_size", &self.total_size)
            .field("allocated_size", &self.allocated_size)
            .field("fl_bitmap", &format_args!("{:#034b}", self.fl_bitmap))
            .field("blocks", &self.phys_blocks().count())
            .finish()
    }
}
