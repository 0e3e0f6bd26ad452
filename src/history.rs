//! Heap state timeline.
//!
//! A [`HeapHistory`] is an explicit, caller-owned recorder: hand it a heap
//! whenever a state is worth keeping and it appends a [`HeapSnapshot`]. The
//! collected timeline renders to a BMP image via the [`bmp`](crate::bmp)
//! writer, one pixel row per recorded state.

use std::io::{self, Write};
use std::path::Path;

use crate::{bmp, Allocator, HeapSnapshot};

/// An ordered sequence of heap snapshots.
#[derive(Debug, Clone, Default)]
pub struct HeapHistory {
    states: Vec<HeapSnapshot>,
}

impl HeapHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the heap's current state.
    pub fn record<A: Allocator + ?Sized>(&mut self, heap: &A) {
        self.states.push(heap.snapshot());
    }

    /// Drop all recorded states.
    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// The recorded states, oldest first.
    pub fn states(&self) -> &[HeapSnapshot] {
        &self.states
    }

    /// Render the timeline as a BMP image.
    pub fn save_bmp<W: Write>(&self, out: W) -> io::Result<()> {
        bmp::write_history(out, &self.states)
    }

    /// Render the timeline to a BMP file.
    pub fn save_bmp_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        bmp::write_history_file(path, &self.states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Allocator, BuddyHeap};

    #[test]
    fn records_and_clears_states() {
        let mut heap = BuddyHeap::new(1024);
        let mut history = HeapHistory::new();
        assert!(history.is_empty());

        history.record(&heap);
        heap.alloc(100).unwrap();
        history.record(&heap);

        assert_eq!(history.len(), 2);
        assert_eq!(history.states()[0].blocks.len(), 1);
        assert!(history.states()[1].blocks.len() > 1);

        history.clear();
        assert!(history.is_empty());
    }

    #[test]
    fn renders_one_row_per_state() {
        let mut heap = BuddyHeap::new(1024);
        let mut history = HeapHistory::new();
        for req in [100, 200, 50] {
            heap.alloc(req).unwrap();
            history.record(&heap);
        }

        let mut out = Vec::new();
        history.save_bmp(&mut out).unwrap();
        let height = i32::from_le_bytes(out[22..26].try_into().unwrap());
        assert_eq!(height, 3);
    }
}
