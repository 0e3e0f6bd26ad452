//! Drive both engines through the randomized workload and record heap
//! timelines, mirroring the laboratory's original four-test run:
//!
//! ```text
//! cargo run --example stress
//! ```
//!
//! Writes `buddy_state.bmp`, `buddy_state_aligned.bmp`, `tlsf_state.bmp`
//! and `tlsf_state_aligned.bmp` into the working directory.

use std::error::Error;

use fraglab::{stress, Allocator, BuddyHeap, HeapHistory, StressConfig, TlsfHeap};

const ARENA_SIZE: usize = 1 << 20; // 1 MiB
const OPERATIONS: usize = 100_000;

fn print_state(name: &str, heap: &impl Allocator) {
    let used = heap.allocated_space();
    let total = heap.total_space();
    println!("{name} state:");
    println!(
        "  memory                  : {used} / {total} ({:.1}% used)",
        used as f64 * 100.0 / total as f64
    );
    println!(
        "  internal frag           : {:.3}",
        heap.internal_fragmentation()
    );
    println!(
        "  external frag (total)   : {:.3}",
        heap.external_fragmentation()
    );
    println!(
        "  external frag (trimmed) : {:.3}",
        heap.trimmed_external_fragmentation()
    );
    println!();
}

fn run_one(
    name: &str,
    heap: &mut impl Allocator,
    aligned: bool,
    image: &str,
) -> Result<(), Box<dyn Error>> {
    let config = StressConfig {
        operations: OPERATIONS,
        aligned,
        seed: 0xf7a6,
        ..StressConfig::default()
    };

    let mut history = HeapHistory::new();
    let report = stress::run(heap, &config, |heap| history.record(heap))?;

    println!(
        "{name}: {} allocations, {} deallocations, {} out-of-memory events",
        report.allocations, report.deallocations, report.oom_events
    );
    print_state(name, heap);

    history.save_bmp_file(image)?;
    println!("wrote {image} ({} states)\n", history.len());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    println!("Running buddy allocator tests:\n");
    run_one(
        "buddy",
        &mut BuddyHeap::new(ARENA_SIZE),
        false,
        "buddy_state.bmp",
    )?;
    run_one(
        "buddy (aligned)",
        &mut BuddyHeap::new(ARENA_SIZE),
        true,
        "buddy_state_aligned.bmp",
    )?;

    println!("Running TLSF allocator tests:\n");
    run_one(
        "tlsf",
        &mut TlsfHeap::new(ARENA_SIZE),
        false,
        "tlsf_state.bmp",
    )?;
    run_one(
        "tlsf (aligned)",
        &mut TlsfHeap::new(ARENA_SIZE),
        true,
        "tlsf_state_aligned.bmp",
    )?;

    Ok(())
}
