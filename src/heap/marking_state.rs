//! Mark bits.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::constants::BITS_IN_WORD;
use crate::vm::ObjectModel;

/// Answers and updates "is this object marked" for one marking cycle.
pub trait MarkingState<O>: Sync {
    /// Set the mark bit of `object`. Returns true if this call set it, and false if the
    /// object was already marked. Exactly one of any number of racing calls returns true.
    fn try_mark(&self, object: O) -> bool;

    fn is_marked(&self, object: O) -> bool;

    fn is_unmarked(&self, object: O) -> bool {
        !self.is_marked(object)
    }
}

/// A side bitmap with one bit per object index.
pub struct AtomicMarkBitmap {
    words: Box<[AtomicUsize]>,
}

impl AtomicMarkBitmap {
    pub fn new(capacity: usize) -> Self {
        let words = capacity.div_ceil(BITS_IN_WORD);
        Self {
            words: (0..words).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.words.len() * BITS_IN_WORD
    }

    fn locate(&self, index: usize) -> (&AtomicUsize, usize) {
        debug_assert!(index < self.capacity(), "bit {} out of bounds", index);
        (&self.words[index / BITS_IN_WORD], 1 << (index % BITS_IN_WORD))
    }

    /// Set bit `index`. Returns whether it was clear before.
    pub fn set(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        // Skip the read-modify-write for the common case of an already marked object.
        if word.load(Ordering::Relaxed) & mask != 0 {
            return false;
        }
        word.fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    pub fn get(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        word.load(Ordering::Acquire) & mask != 0
    }

    /// Clear all bits. Used between marking cycles.
    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

/// Mark bits for the objects of `M`, kept in an [`AtomicMarkBitmap`] indexed by
/// [`ObjectModel::object_index`].
pub struct BitmapMarkingState<'m, M: ObjectModel> {
    model: &'m M,
    bitmap: AtomicMarkBitmap,
}

impl<'m, M: ObjectModel> BitmapMarkingState<'m, M> {
    pub fn new(model: &'m M, capacity: usize) -> Self {
        Self {
            model,
            bitmap: AtomicMarkBitmap::new(capacity),
        }
    }

    pub fn bitmap(&self) -> &AtomicMarkBitmap {
        &self.bitmap
    }
}

impl<M: ObjectModel> MarkingState<M::Object> for BitmapMarkingState<'_, M> {
    fn try_mark(&self, object: M::Object) -> bool {
        self.bitmap.set(self.model.object_index(object))
    }

    fn is_marked(&self, object: M::Object) -> bool {
        self.bitmap.get(self.model.object_index(object))
    }
}
