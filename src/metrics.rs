//! Fragmentation indices.
//!
//! External fragmentation is scored over a [`FreeHistogram`] of the free
//! blocks, bucketed by power-of-two size class (`MIN_BLOCK_SIZE << class`).
//! Two scoring formulas are provided because the two engines historically
//! diverge:
//!
//!  - [`unweighted_external`] averages the per-class ratios with equal
//!    weight (the buddy engine's index);
//!  - [`weighted_external`] weights each class by its byte size and clamps
//!    the per-class ratio to 1 (the TLSF engine's index), biasing the score
//!    toward the ability to satisfy *large* requests.
//!
//! Both are exposed so the two engines can also be compared under the same
//! formula. Every index lies in `[0, 1]`; a perfectly coalesced heap scores
//! 0.

use crate::{utils, MIN_BLOCK_SIZE};

/// Number of size classes a histogram tracks: `16 << 31` caps the largest
/// class well beyond any simulated arena.
pub const CLASS_COUNT: usize = 32;

/// Number of classes the unweighted index inspects.
const UNWEIGHTED_CLASSES: usize = 28;

const MIN_LOG2: u32 = MIN_BLOCK_SIZE.trailing_zeros();

/// Per-size-class census of the free blocks in (a prefix of) an arena.
#[derive(Debug, Clone, Default)]
pub struct FreeHistogram {
    counts: [u64; CLASS_COUNT],
    total_free: usize,
    largest: usize,
}

/// Size class of a block: `⌊log2(size)⌋ - log2(MIN_BLOCK_SIZE)`, saturated
/// to the last class.
pub fn size_class(size: usize) -> usize {
    let class = (utils::fls(size.max(MIN_BLOCK_SIZE)) - MIN_LOG2) as usize;
    class.min(CLASS_COUNT - 1)
}

impl FreeHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one free block.
    pub fn record(&mut self, size: usize) {
        self.counts[size_class(size)] += 1;
        self.total_free += size;
        self.largest = self.largest.max(size);
    }

    /// Total free bytes recorded.
    pub fn total_free(&self) -> usize {
        self.total_free
    }

    /// Size of the largest recorded block.
    pub fn largest(&self) -> usize {
        self.largest
    }

    /// Number of `class`-sized blocks obtainable from the recorded blocks:
    /// the class's own count plus every larger class subdivided down,
    /// weighted `2^(j - class)`.
    fn obtainable(&self, class: usize) -> u64 {
        let mut n = 0;
        for (j, &count) in self.counts.iter().enumerate().skip(class) {
            n += count << (j - class);
        }
        n
    }
}

/// Wasted payload within allocated blocks as a fraction of the allocated
/// total; 0 when nothing is allocated.
pub fn internal_fragmentation(wasted: usize, allocated: usize) -> f64 {
    if allocated == 0 {
        0.0
    } else {
        wasted as f64 / allocated as f64
    }
}

/// Unweighted mean-ratio external fragmentation index.
///
/// For each class whose block size does not exceed the total free bytes `F`,
/// the ratio of obtainable blocks to `F / class_size` potential blocks is
/// computed; the index is one minus the mean ratio. Returns 0 when no class
/// qualifies.
pub fn unweighted_external(hist: &FreeHistogram) -> f64 {
    let total_free = hist.total_free();
    if total_free == 0 {
        return 0.0;
    }

    let mut sum = 0.0;
    let mut classes = 0u32;
    for class in 0..UNWEIGHTED_CLASSES {
        let class_size = MIN_BLOCK_SIZE << class;
        if class_size > total_free {
            break;
        }
        let potential = (total_free / class_size) as f64;
        sum += hist.obtainable(class) as f64 / potential;
        classes += 1;
    }

    if classes == 0 {
        0.0
    } else {
        1.0 - sum / f64::from(classes)
    }
}

/// Size-weighted external fragmentation index.
///
/// Classes are inspected up to the largest recorded free block; each class
/// contributes `class_size * min(1, obtainable / potential)` against a
/// denominator of `class_size`. Returns 0 when nothing qualifies.
pub fn weighted_external(hist: &FreeHistogram) -> f64 {
    let total_free = hist.total_free();
    if total_free == 0 {
        return 0.0;
    }

    let mut numerator = 0.0;
    let mut denominator = 0usize;
    for class in 0..CLASS_COUNT {
        let class_size = MIN_BLOCK_SIZE << class;
        if class_size > hist.largest() {
            break;
        }
        let potential = (total_free / class_size) as f64;
        let ratio = (hist.obtainable(class) as f64 / potential).min(1.0);
        numerator += class_size as f64 * ratio;
        denominator += class_size;
    }

    if denominator == 0 {
        0.0
    } else {
        1.0 - numerator / denominator as f64
    }
}
