//! Marking of descriptor arrays shared between maps.
//!
//! Maps in a transition tree share one descriptor array, and each map owns a prefix of it.
//! A map only keeps its own descriptors alive, so the array is not marked as a whole. Its
//! marking state records how many descriptors have been visited (`marked`) and how many
//! more have been requested by maps (`delta`), tagged with the epoch of the marking cycle.

use std::sync::atomic::{AtomicU32, Ordering};

const EPOCH_BITS: u32 = 2;
const MARKED_BITS: u32 = 14;
const DELTA_BITS: u32 = 16;

const EPOCH_MASK: u32 = (1 << EPOCH_BITS) - 1;
const MARKED_SHIFT: u32 = EPOCH_BITS;
const MARKED_MASK: u32 = (1 << MARKED_BITS) - 1;
const DELTA_SHIFT: u32 = EPOCH_BITS + MARKED_BITS;
const DELTA_MASK: u32 = (1 << DELTA_BITS) - 1;

/// The largest number of descriptors an array can have.
pub const MAX_NUMBER_OF_DESCRIPTORS: usize = 1020;

static_assertions::const_assert!(MAX_NUMBER_OF_DESCRIPTORS <= MARKED_MASK as usize);
static_assertions::const_assert_eq!(EPOCH_BITS + MARKED_BITS + DELTA_BITS, 32);

/// The per-array marking state.
pub struct DescriptorArrayMarkingState {
    raw: AtomicU32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct State {
    epoch: u32,
    marked: u32,
    delta: u32,
}

impl State {
    fn decode(raw: u32) -> Self {
        Self {
            epoch: raw & EPOCH_MASK,
            marked: (raw >> MARKED_SHIFT) & MARKED_MASK,
            delta: (raw >> DELTA_SHIFT) & DELTA_MASK,
        }
    }

    fn encode(self) -> u32 {
        debug_assert!(self.marked <= MARKED_MASK);
        debug_assert!(self.delta <= DELTA_MASK);
        self.epoch | (self.marked << MARKED_SHIFT) | (self.delta << DELTA_SHIFT)
    }
}

impl DescriptorArrayMarkingState {
    pub const fn new() -> Self {
        Self {
            raw: AtomicU32::new(0),
        }
    }

    fn current_epoch(gc_epoch: u32) -> u32 {
        gc_epoch & EPOCH_MASK
    }

    fn swap_state(&self, old: u32, new: State) -> bool {
        self.raw
            .compare_exchange(old, new.encode(), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// A map that owns the first `index_to_mark` descriptors asks for them to be marked.
    /// Returns true if this raised the number of descriptors to mark, in which case the
    /// caller must push the array onto the marking worklist.
    pub fn try_update_indices_to_mark(&self, gc_epoch: u32, index_to_mark: usize) -> bool {
        debug_assert!(index_to_mark <= MAX_NUMBER_OF_DESCRIPTORS);
        let epoch = Self::current_epoch(gc_epoch);
        let index_to_mark = index_to_mark as u32;
        loop {
            let raw = self.raw.load(Ordering::Relaxed);
            let state = State::decode(raw);
            if state.epoch != epoch {
                // First request in this cycle.
                let new = State {
                    epoch,
                    marked: 0,
                    delta: index_to_mark,
                };
                if self.swap_state(raw, new) {
                    return true;
                }
                continue;
            }
            if state.marked + state.delta >= index_to_mark {
                return false;
            }
            let new = State {
                epoch,
                marked: state.marked,
                delta: index_to_mark - state.marked,
            };
            if self.swap_state(raw, new) {
                return true;
            }
        }
    }

    /// Claim the range of descriptors to visit. Racing callers get disjoint ranges, and
    /// together they cover every descriptor requested so far. An empty range means there is
    /// nothing to do. An array reached without any request from a map, for example from a
    /// root, gets all of its descriptors.
    pub fn acquire_descriptor_range_to_mark(
        &self,
        gc_epoch: u32,
        number_of_descriptors: usize,
    ) -> (usize, usize) {
        debug_assert!(number_of_descriptors <= MAX_NUMBER_OF_DESCRIPTORS);
        let epoch = Self::current_epoch(gc_epoch);
        loop {
            let raw = self.raw.load(Ordering::Relaxed);
            let state = State::decode(raw);
            if state.epoch != epoch {
                let new = State {
                    epoch,
                    marked: number_of_descriptors as u32,
                    delta: 0,
                };
                if self.swap_state(raw, new) {
                    return (0, number_of_descriptors);
                }
                continue;
            }
            if state.delta == 0 {
                return (state.marked as usize, state.marked as usize);
            }
            let new_marked = state.marked + state.delta;
            let new = State {
                epoch,
                marked: new_marked,
                delta: 0,
            };
            if self.swap_state(raw, new) {
                return (state.marked as usize, new_marked as usize);
            }
        }
    }
}

impl Default for DescriptorArrayMarkingState {
    fn default() -> Self {
        Self::new()
    }
}
