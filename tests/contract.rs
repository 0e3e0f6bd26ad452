//! The shared allocator contract, exercised identically against both
//! engines through the `Allocator` trait.

use fraglab::{
    stress, Allocator, AllocError, BuddyHeap, HeapHistory, StressConfig, TlsfHeap,
    MIN_BLOCK_SIZE,
};

fn round_trip_and_double_free(heap: &mut impl Allocator) {
    let offset = heap.alloc(100).unwrap();
    assert!(heap.allocated_space() >= 100);

    heap.dealloc(offset).unwrap();
    assert_eq!(heap.allocated_space(), 0);
    assert_eq!(
        heap.dealloc(offset),
        Err(AllocError::DoubleFree { offset })
    );
}

#[test]
fn round_trips_succeed_and_double_frees_fail() {
    round_trip_and_double_free(&mut BuddyHeap::new(1 << 12));
    round_trip_and_double_free(&mut TlsfHeap::new(1 << 12));
}

fn never_returned_offset_is_invalid(heap: &mut impl Allocator) {
    heap.alloc(100).unwrap();
    let bogus = heap.total_space() * 2;
    assert_eq!(
        heap.dealloc(bogus),
        Err(AllocError::InvalidFree { offset: bogus })
    );
}

#[test]
fn unknown_offsets_are_rejected() {
    never_returned_offset_is_invalid(&mut BuddyHeap::new(1 << 12));
    never_returned_offset_is_invalid(&mut TlsfHeap::new(1 << 12));
}

fn alignment_law(heap: &mut impl Allocator, round: impl Fn(usize) -> usize) {
    for req in [1, 7, 16, 100, 300, 1000] {
        let want = round(req).max(MIN_BLOCK_SIZE);
        match heap.align_alloc(req) {
            Ok(offset) => assert_eq!(offset % want, 0, "align_alloc({req})"),
            Err(AllocError::OutOfMemory { .. }) | Err(AllocError::InvalidArgument { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}

#[test]
fn aligned_offsets_sit_on_their_grid() {
    // Buddy aligns to the power-of-two block size, TLSF to the rounded
    // request.
    alignment_law(&mut BuddyHeap::new(1 << 14), |req| req.next_power_of_two());
    alignment_law(&mut TlsfHeap::new(1 << 14), |req| (req + 7) & !7);
}

fn metrics_stay_in_range(heap: &mut impl Allocator) {
    let config = StressConfig {
        operations: 3000,
        seed: 0xfeed,
        ..StressConfig::default()
    };
    stress::run(heap, &config, |heap| {
        for frag in [
            heap.internal_fragmentation(),
            heap.external_fragmentation(),
            heap.trimmed_external_fragmentation(),
        ] {
            assert!((0.0..=1.0).contains(&frag), "{frag} out of range");
        }
        assert!(heap.allocated_space() <= heap.total_space());
        assert_eq!(
            heap.free_space(),
            heap.total_space() - heap.allocated_space()
        );
    })
    .unwrap();
}

#[test]
fn fragmentation_metrics_stay_in_range_under_stress() {
    metrics_stay_in_range(&mut BuddyHeap::new(1 << 16));
    metrics_stay_in_range(&mut TlsfHeap::new(1 << 16));
}

fn snapshots_cover_the_arena(heap: &mut impl Allocator, header: usize) {
    let config = StressConfig {
        operations: 1000,
        seed: 9,
        ..StressConfig::default()
    };
    stress::run(heap, &config, |heap| {
        let snap = heap.snapshot();
        let mut cursor = 0;
        for block in &snap.blocks {
            assert_eq!(block.offset, cursor);
            cursor += header + block.size;
            assert!((0.0..=1.0).contains(&block.waste));
        }
        assert_eq!(cursor, snap.total_size);
    })
    .unwrap();
}

#[test]
fn snapshots_tile_the_arena_in_address_order() {
    snapshots_cover_the_arena(&mut BuddyHeap::new(1 << 15), 0);
    snapshots_cover_the_arena(&mut TlsfHeap::new(1 << 15), fraglab::HEADER_SIZE);
}

#[test]
fn history_renders_both_engines() {
    let mut buddy = BuddyHeap::new(1 << 14);
    let mut tlsf = TlsfHeap::new(1 << 14);
    let config = StressConfig {
        operations: 500,
        seed: 1,
        ..StressConfig::default()
    };

    for heap in [&mut buddy as &mut dyn Allocator, &mut tlsf] {
        let mut history = HeapHistory::new();
        stress::run(heap, &config, |h| history.record(h)).unwrap();
        assert!(!history.is_empty());

        let mut image = Vec::new();
        history.save_bmp(&mut image).unwrap();
        assert_eq!(&image[0..2], b"BM");
    }
}
