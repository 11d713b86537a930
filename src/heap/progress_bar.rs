use std::sync::atomic::{AtomicUsize, Ordering};

const DISABLED_SENTINEL: usize = usize::MAX;

/// The scan cursor of a large array.
///
/// A large array is visited in chunks, and pushed back onto the marking worklist after each
/// chunk. The cursor records the first slot not yet visited. It only moves forward, and only
/// from a value the caller observed, so no part of the array is visited twice.
pub struct ProgressBar {
    value: AtomicUsize,
}

impl ProgressBar {
    /// A disabled progress bar. The array is visited in one go.
    pub const fn new() -> Self {
        Self {
            value: AtomicUsize::new(DISABLED_SENTINEL),
        }
    }

    pub fn enable(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.value.load(Ordering::Relaxed) != DISABLED_SENTINEL
    }

    /// Restart from the beginning for the next marking cycle.
    pub fn reset_if_enabled(&self) {
        if self.is_enabled() {
            self.value.store(0, Ordering::Relaxed);
        }
    }

    pub fn value(&self) -> usize {
        debug_assert!(self.is_enabled());
        self.value.load(Ordering::Relaxed)
    }

    /// Move the cursor from `old_value` to `new_value`. Fails if another thread moved it first.
    pub fn try_set_new_value(&self, old_value: usize, new_value: usize) -> bool {
        debug_assert!(self.is_enabled());
        debug_assert_ne!(new_value, DISABLED_SENTINEL);
        debug_assert!(new_value >= old_value);
        self.value
            .compare_exchange(old_value, new_value, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for ProgressBar {
    fn default() -> Self {
        Self::new()
    }
}
