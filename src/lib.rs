//! A memory-allocator laboratory.
//!
//! This crate implements two classical dynamic allocation algorithms over a
//! *simulated* heap and instruments them for fragmentation analysis:
//!
//!  - [`BuddyHeap`], a binary buddy allocator over a power-of-two arena, and
//!  - [`TlsfHeap`], a TLSF (Two-Level Segregated Fit¹) allocator over a byte
//!    arena with inline block headers and physical neighbor links.
//!
//! Both engines implement the same [`Allocator`] contract: allocate,
//! aligned-allocate, free, statistics, and a block-by-block [`HeapSnapshot`]
//! of the arena. Addresses handed out by the engines are plain offsets into
//! the simulated arena — nothing is ever dereferenced, so the engines can be
//! driven with arbitrary workloads and inspected after every operation.
//!
//! On top of the engines sit the laboratory pieces: the [`metrics`] module
//! defines the fragmentation indices, [`stress`] generates randomized
//! workloads, and [`history`] + [`bmp`] record and render a visual timeline
//! of the heap (one pixel row per snapshot).
//!
//! <sub>¹ M. Masmano, I. Ripoll, A. Crespo and J. Real, "TLSF: a new dynamic
//! memory allocator for real-time systems," *Proceedings. 16th Euromicro
//! Conference on Real-Time Systems*, 2004.</sub>
//!
//! # Examples
//!
//! ```rust
//! use fraglab::{Allocator, BuddyHeap};
//!
//! let mut heap = BuddyHeap::new(1024);
//! let a = heap.alloc(100).unwrap();
//! let b = heap.alloc(50).unwrap();
//! assert_eq!(heap.allocated_space(), 150);
//!
//! // Requests are rounded up to power-of-two blocks; the slack is reported
//! // as internal fragmentation.
//! assert!(heap.internal_fragmentation() > 0.0);
//!
//! heap.dealloc(b).unwrap();
//! heap.dealloc(a).unwrap();
//!
//! // Eager coalescing restores the single free block.
//! assert_eq!(heap.snapshot().blocks.len(), 1);
//! ```
//!
//! ```rust
//! use fraglab::{Allocator, TlsfHeap, HEADER_SIZE};
//!
//! let mut heap = TlsfHeap::new(4096);
//! let a = heap.alloc(48).unwrap();
//! assert_eq!(a, HEADER_SIZE); // first payload sits right after its header
//!
//! let b = heap.align_alloc(64).unwrap();
//! assert_eq!(b % 64, 0);
//!
//! heap.dealloc(b).unwrap();
//! heap.dealloc(a).unwrap();
//! assert!(heap.snapshot().blocks.iter().all(|blk| blk.is_free));
//! ```

use thiserror::Error;

pub mod bmp;
pub mod buddy;
pub mod history;
pub mod metrics;
pub mod stress;
pub mod tlsf;
mod utils;

pub use self::buddy::BuddyHeap;
pub use self::history::HeapHistory;
pub use self::metrics::FreeHistogram;
pub use self::stress::{StressConfig, StressReport};
pub use self::tlsf::{TlsfHeap, HEADER_SIZE};

/// Minimum block size, in bytes, for both engines.
///
/// Buddy blocks are powers of two no smaller than this; TLSF payloads are
/// 8-byte multiples no smaller than this.
pub const MIN_BLOCK_SIZE: usize = 16;

/// Errors surfaced by the allocator engines.
///
/// All variants surface synchronously at the failing call; nothing is
/// retried internally. `OutOfMemory` is recoverable — the caller may free
/// memory and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// No free block can satisfy the request.
    #[error("out of memory (requested {requested} bytes)")]
    OutOfMemory { requested: usize },

    /// The offset does not identify a known block, lies outside the arena,
    /// or the block metadata fails validation.
    #[error("invalid free at offset {offset:#x}")]
    InvalidFree { offset: usize },

    /// The identified block is already free.
    #[error("double free at offset {offset:#x}")]
    DoubleFree { offset: usize },

    /// An aligned block cannot be placed within the candidate region.
    #[error("cannot place an aligned block for {requested} bytes")]
    InvalidArgument { requested: usize },
}

/// Crate-local result alias.
pub type Result<T> = core::result::Result<T, AllocError>;

/// One block of a [`HeapSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockInfo {
    /// Offset of the block within the arena. For [`TlsfHeap`] this is the
    /// *header* offset; the payload follows [`HEADER_SIZE`] bytes later.
    pub offset: usize,
    /// Block capacity in bytes (payload capacity for TLSF).
    pub size: usize,
    /// Whether the block is free.
    pub is_free: bool,
    /// Internal waste fraction `(size - allocated) / size`; 0 for free
    /// blocks.
    pub waste: f64,
}

/// A block-by-block picture of the arena at one instant, in ascending offset
/// order.
///
/// Snapshots are best-effort observers: a walk that encounters inconsistent
/// metadata truncates silently rather than erroring.
#[derive(Debug, Clone, Default)]
pub struct HeapSnapshot {
    /// Total arena capacity in bytes.
    pub total_size: usize,
    /// The blocks tiling the arena, in address order.
    pub blocks: Vec<BlockInfo>,
}

/// The contract shared by both allocator engines.
///
/// Offsets identify simulated blocks; they are never dereferenced. The
/// zero-size request is a no-op that returns offset 0.
pub trait Allocator {
    /// Allocate `req` bytes; returns the block's offset.
    fn alloc(&mut self, req: usize) -> Result<usize>;

    /// Allocate `req` bytes at an offset aligned to
    /// `max(roundUp(req), MIN_BLOCK_SIZE)`.
    fn align_alloc(&mut self, req: usize) -> Result<usize>;

    /// Free a previously returned offset.
    fn dealloc(&mut self, offset: usize) -> Result<()>;

    /// Total arena capacity in bytes.
    fn total_space(&self) -> usize;

    /// Sum of user-requested sizes over live allocations.
    fn allocated_space(&self) -> usize;

    /// `total_space() - allocated_space()`.
    fn free_space(&self) -> usize {
        self.total_space() - self.allocated_space()
    }

    /// Wasted payload within allocated blocks, as a fraction of
    /// `allocated_space()`; 0 when nothing is allocated.
    fn internal_fragmentation(&self) -> f64;

    /// The engine's external fragmentation index over the whole arena, in
    /// `[0, 1]`.
    fn external_fragmentation(&self) -> f64;

    /// The external fragmentation index scored only over
    /// `[0, find_last_allocated_address())`, ignoring trailing free space.
    fn trimmed_external_fragmentation(&self) -> f64;

    /// End address of the highest-offset allocated block; 0 when nothing is
    /// allocated.
    fn find_last_allocated_address(&self) -> usize;

    /// Capture the current block layout.
    fn snapshot(&self) -> HeapSnapshot;
}
