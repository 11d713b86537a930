//! Segmented worklists shared by marking threads.
//!
//! Each thread pushes into and pops from its own [`Local`] view. Full segments are published
//! to a global [`Injector`], from which any thread may steal them once it runs dry.

use crossbeam::deque::{Injector, Steal};

use crate::vm::{Slot, WrapperSnapshot};

/// The number of entries in a segment.
pub const SEGMENT_CAPACITY: usize = 64;

/// A multi-producer, multi-consumer worklist of `T`.
pub struct Worklist<T> {
    global: Injector<Vec<T>>,
}

impl<T: Send> Worklist<T> {
    pub fn new() -> Self {
        Self {
            global: Injector::new(),
        }
    }

    pub fn local(&self) -> Local<'_, T> {
        Local {
            worklist: self,
            push_segment: Vec::with_capacity(SEGMENT_CAPACITY),
            pop_segment: vec![],
        }
    }

    /// Are all segments published to this worklist consumed? Entries still held in
    /// [`Local`]s are not counted.
    pub fn is_empty(&self) -> bool {
        self.global.is_empty()
    }

    fn publish(&self, segment: Vec<T>) {
        debug_assert!(!segment.is_empty());
        self.global.push(segment);
    }

    fn steal(&self) -> Option<Vec<T>> {
        loop {
            match self.global.steal() {
                Steal::Success(segment) => return Some(segment),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Take every published entry.
    pub fn drain(&self) -> Vec<T> {
        let mut entries = vec![];
        while let Some(mut segment) = self.steal() {
            entries.append(&mut segment);
        }
        entries
    }
}

impl<T: Send> Default for Worklist<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread-local view of a [`Worklist`]. Entries are published when the push segment
/// fills up, on [`Local::publish`], and when the view is dropped.
pub struct Local<'w, T: Send> {
    worklist: &'w Worklist<T>,
    push_segment: Vec<T>,
    pop_segment: Vec<T>,
}

impl<'w, T: Send> Local<'w, T> {
    pub fn push(&mut self, entry: T) {
        if self.push_segment.len() == SEGMENT_CAPACITY {
            let full = std::mem::take(&mut self.push_segment);
            self.push_segment.reserve(SEGMENT_CAPACITY);
            self.worklist.publish(full);
        }
        self.push_segment.push(entry);
    }

    /// Pop a local entry, or steal a segment from the global worklist.
    pub fn pop(&mut self) -> Option<T> {
        if let Some(entry) = self.pop_segment.pop() {
            return Some(entry);
        }
        if !self.push_segment.is_empty() {
            std::mem::swap(&mut self.push_segment, &mut self.pop_segment);
            return self.pop_segment.pop();
        }
        self.pop_segment = self.worklist.steal()?;
        self.pop_segment.pop()
    }

    pub fn is_local_empty(&self) -> bool {
        self.push_segment.is_empty() && self.pop_segment.is_empty()
    }

    pub fn is_global_empty(&self) -> bool {
        self.worklist.is_empty()
    }

    /// Make all local entries visible to other threads.
    pub fn publish(&mut self) {
        if !self.push_segment.is_empty() {
            let segment = std::mem::take(&mut self.push_segment);
            self.worklist.publish(segment);
        }
        if !self.pop_segment.is_empty() {
            let segment = std::mem::take(&mut self.pop_segment);
            self.worklist.publish(segment);
        }
    }
}

impl<T: Send> Drop for Local<'_, T> {
    fn drop(&mut self) {
        self.publish();
    }
}

/// The worklists of objects to visit, and of embedder wrappers to hand to the embedder.
pub struct MarkingWorklists<O> {
    shared: Worklist<O>,
    wrappers: Worklist<WrapperSnapshot>,
    supports_extract_wrapper: bool,
}

impl<O: Send> MarkingWorklists<O> {
    /// `supports_extract_wrapper` tells the visitors whether an embedder consumes
    /// wrapper snapshots.
    pub fn new(supports_extract_wrapper: bool) -> Self {
        Self {
            shared: Worklist::new(),
            wrappers: Worklist::new(),
            supports_extract_wrapper,
        }
    }

    pub fn local(&self) -> MarkingWorklistsLocal<'_, O> {
        MarkingWorklistsLocal {
            shared: self.shared.local(),
            wrappers: self.wrappers.local(),
            supports_extract_wrapper: self.supports_extract_wrapper,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    pub fn wrappers(&self) -> &Worklist<WrapperSnapshot> {
        &self.wrappers
    }
}

pub struct MarkingWorklistsLocal<'w, O: Send> {
    shared: Local<'w, O>,
    wrappers: Local<'w, WrapperSnapshot>,
    supports_extract_wrapper: bool,
}

impl<O: Send> MarkingWorklistsLocal<'_, O> {
    pub fn push(&mut self, object: O) {
        self.shared.push(object)
    }

    pub fn pop(&mut self) -> Option<O> {
        self.shared.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_local_empty() && self.shared.is_global_empty()
    }

    pub fn supports_extract_wrapper(&self) -> bool {
        self.supports_extract_wrapper
    }

    pub fn push_extracted_wrapper(&mut self, snapshot: WrapperSnapshot) {
        self.wrappers.push(snapshot)
    }

    pub fn publish(&mut self) {
        self.shared.publish();
        self.wrappers.publish();
    }
}

/// A key and value of an ephemeron table, both unmarked when discovered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ephemeron<O> {
    pub key: O,
    pub value: O,
}

macro_rules! weak_objects {
    ($($(#[$outer:meta])* $name:ident: $type:ty),* $(,)?) => {
        /// Objects whose weak references are resolved once the transitive closure is known.
        pub struct WeakObjects<O: Send> {
            $($(#[$outer])* pub $name: Worklist<$type>),*
        }

        impl<O: Send> WeakObjects<O> {
            pub fn new() -> Self {
                Self {
                    $($name: Worklist::new()),*
                }
            }

            pub fn local(&self) -> WeakObjectsLocal<'_, O> {
                WeakObjectsLocal {
                    $($name: self.$name.local()),*
                }
            }

            pub fn is_empty(&self) -> bool {
                true $(&& self.$name.is_empty())*
            }
        }

        impl<O: Send> Default for WeakObjects<O> {
            fn default() -> Self {
                Self::new()
            }
        }

        pub struct WeakObjectsLocal<'w, O: Send> {
            $(pub $name: Local<'w, $type>),*
        }

        impl<O: Send> WeakObjectsLocal<'_, O> {
            pub fn publish(&mut self) {
                $(self.$name.publish();)*
            }
        }
    };
}

weak_objects! {
    /// Weak slots whose targets were unmarked when visited.
    weak_references: Slot<O>,
    ephemeron_hash_tables: O,
    /// Ephemerons with an unmarked key and an unmarked value.
    discovered_ephemerons: Ephemeron<O>,
    /// Ephemerons to re-examine in the next round of ephemeron processing.
    next_ephemerons: Ephemeron<O>,
    js_weak_refs: O,
    weak_cells: O,
    transition_arrays: O,
    /// Shared function infos whose bytecode or baseline code is old.
    code_flushing_candidates: O,
    /// Functions whose baseline code is old.
    baseline_flushing_candidates: O,
    /// Functions that still point at code of flushed bytecode.
    flushed_js_functions: O,
}
