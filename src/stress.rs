//! Randomized allocate/free workload driver.
//!
//! The driver flips a biased coin between allocating a uniformly random
//! size and freeing a uniformly random live block. When the heap reports
//! `OutOfMemory` (or, in aligned mode, `InvalidArgument`), it recovers by
//! forcing deallocations: while a fair coin keeps coming up heads and live
//! blocks remain, one random block is freed. Workloads are reproducible
//! from the seed.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{AllocError, Allocator, Result};

/// Parameters of a stress run.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to drive.
    pub operations: usize,
    /// Inclusive bounds of the uniform request-size distribution.
    pub min_size: usize,
    pub max_size: usize,
    /// Percent chance (0-100) that an operation allocates rather than
    /// frees. A free is forced when nothing is live.
    pub alloc_bias: u32,
    /// Use `align_alloc` instead of `alloc`.
    pub aligned: bool,
    /// RNG seed; equal seeds replay equal workloads.
    pub seed: u64,
    /// How many times the observer is handed the heap over the run.
    pub checkpoints: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        StressConfig {
            operations: 100_000,
            min_size: 1,
            max_size: 1024,
            alloc_bias: 51,
            aligned: false,
            seed: 0,
            checkpoints: 10,
        }
    }
}

/// Tally of a completed stress run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StressReport {
    pub allocations: u64,
    pub deallocations: u64,
    /// Times the heap rejected a request and forced deallocations ran.
    pub oom_events: u64,
}

/// Drive `heap` through a randomized workload, handing it to `observer` at
/// every checkpoint (and once after the final operation).
///
/// `OutOfMemory` and aligned-placement failures are recovered from;
/// anything else (which would indicate a bookkeeping bug in the driver)
/// is propagated.
pub fn run<A: Allocator + ?Sized>(
    heap: &mut A,
    config: &StressConfig,
    mut observer: impl FnMut(&A),
) -> Result<StressReport> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut live: Vec<usize> = Vec::with_capacity(config.operations / 2);
    let mut report = StressReport::default();
    let checkpoint_every = (config.operations / config.checkpoints.max(1)).max(1);

    for op in 0..config.operations {
        if live.is_empty() || rng.gen_range(0..100) < config.alloc_bias {
            let req = rng.gen_range(config.min_size..=config.max_size);
            let outcome = if config.aligned {
                heap.align_alloc(req)
            } else {
                heap.alloc(req)
            };
            match outcome {
                Ok(offset) => {
                    report.allocations += 1;
                    // A zero-size request is a no-op and leaves nothing to
                    // free later.
                    if req != 0 {
                        live.push(offset);
                    }
                }
                Err(AllocError::OutOfMemory { .. }) | Err(AllocError::InvalidArgument { .. }) => {
                    report.oom_events += 1;
                    while !live.is_empty() && rng.gen_range(0..100) < 50 {
                        let victim = live.swap_remove(rng.gen_range(0..live.len()));
                        heap.dealloc(victim)?;
                        report.deallocations += 1;
                    }
                }
                Err(e) => return Err(e),
            }
        } else {
            let victim = live.swap_remove(rng.gen_range(0..live.len()));
            heap.dealloc(victim)?;
            report.deallocations += 1;
        }

        if op % checkpoint_every == 0 {
            log::info!(
                "stress: {}% ({} live, {} / {} bytes)",
                op * 100 / config.operations,
                live.len(),
                heap.allocated_space(),
                heap.total_space()
            );
            observer(heap);
        }
    }

    observer(heap);
    Ok(report)
}
