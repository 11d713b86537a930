//! The generic marking visitor.
//!
//! [`MarkingVisitor`] is the traversal engine shared by the full-heap and the young
//! generation visitors. It dispatches on [`VisitorId`], walks the fields of each object kind,
//! and classifies every edge. The concrete visitors decide which objects are marked, what
//! happens to weak edges, and how the special object kinds are visited.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::Ordering;

use crate::heap::marking_state::MarkingState;
use crate::heap::worklist::MarkingWorklistsLocal;
use crate::util::constants::BYTES_IN_SLOT;
use crate::vm::layout;
use crate::vm::{MaybeObject, ObjectModel, Slot, VisitorId};

pub trait MarkingVisitor<'a> {
    type Object: Copy + Eq + Hash + Debug + Send + Sync + 'static;
    type Model: ObjectModel<Object = Self::Object> + 'a;
    type State: MarkingState<Self::Object> + 'a;

    /// Maps are never in the young generation, so only the full visitor marks them.
    const SHOULD_VISIT_MAP_POINTER: bool;

    fn model(&self) -> &'a Self::Model;

    fn marking_state(&self) -> &'a Self::State;

    fn marking_worklists(&mut self) -> &mut MarkingWorklistsLocal<'a, Self::Object>;

    /// May this visitor update marking metadata stored in the heap, such as progress bars
    /// and descriptor array marking states? A visitor that may not visits large arrays in
    /// one go and descriptor arrays in full.
    fn can_update_values_in_heap(&self) -> bool;

    fn trace_embedder_fields(&self) -> bool;

    /// The number of slots one progress bar increment visits.
    fn progress_bar_chunk(&self) -> usize;

    /// Does this visitor care about `object` at all?
    fn should_mark_object(&self, object: Self::Object) -> bool;

    /// `slot` refers to `target`, which is marked or about to be.
    fn record_slot(&mut self, slot: Slot<Self::Object>, target: Self::Object);

    fn process_weak_heap_object(&mut self, slot: Slot<Self::Object>, object: Self::Object);

    /// `object` was marked for the first time. `host` is `None` for roots.
    fn on_first_mark(&mut self, _host: Option<Self::Object>, _object: Self::Object) {}

    fn visit_external_pointers(&mut self, _host: Self::Object) {}

    fn mark_array_buffer_extension(&mut self, buffer: Self::Object) {
        self.model().mark_array_buffer_extension(buffer, false);
    }

    fn visit_descriptor_array(&mut self, array: Self::Object) -> usize;
    fn visit_map(&mut self, map: Self::Object) -> usize;
    fn visit_transition_array(&mut self, array: Self::Object) -> usize;
    fn visit_ephemeron_hash_table(&mut self, table: Self::Object) -> usize;
    fn visit_js_weak_ref(&mut self, weak_ref: Self::Object) -> usize;
    fn visit_weak_cell(&mut self, weak_cell: Self::Object) -> usize;
    fn visit_shared_function_info(&mut self, shared: Self::Object) -> usize;
    fn visit_js_function(&mut self, function: Self::Object) -> usize;

    /// Visit a marked object popped from the marking worklist. Returns the number of bytes
    /// visited, which is 0 if there was nothing left to do.
    fn visit(&mut self, object: Self::Object) -> usize {
        let size = match self.model().visitor_id(object) {
            VisitorId::DataObject => {
                self.visit_map_pointer(object);
                self.model().size_of(object)
            }
            VisitorId::JSObject => self.visit_js_object_subclass(object, &[]),
            VisitorId::FixedArray => self.visit_fixed_array(object),
            VisitorId::WeakFixedArray
            | VisitorId::BytecodeArray
            | VisitorId::Code => self.visit_struct(object),
            VisitorId::DescriptorArray => self.visit_descriptor_array(object),
            VisitorId::Map => self.visit_map(object),
            VisitorId::TransitionArray => self.visit_transition_array(object),
            VisitorId::EphemeronHashTable => self.visit_ephemeron_hash_table(object),
            VisitorId::JSWeakRef => self.visit_js_weak_ref(object),
            VisitorId::WeakCell => self.visit_weak_cell(object),
            VisitorId::SharedFunctionInfo => self.visit_shared_function_info(object),
            VisitorId::JSFunction => self.visit_js_function(object),
            VisitorId::JSArrayBuffer => {
                self.mark_array_buffer_extension(object);
                self.visit_embedder_tracing_subclass(object)
            }
            VisitorId::JSApiObject | VisitorId::JSTypedArray | VisitorId::JSDataView => {
                self.visit_embedder_tracing_subclass(object)
            }
        };
        self.visit_external_pointers(object);
        size
    }

    /// Mark an object referenced from outside the heap.
    fn mark_root(&mut self, object: Self::Object) -> bool {
        self.should_mark_object(object) && self.mark_object(None, object)
    }

    /// Mark `object` and push it onto the marking worklist. Returns false if it was
    /// already marked.
    fn mark_object(&mut self, host: Option<Self::Object>, object: Self::Object) -> bool {
        if !self.marking_state().try_mark(object) {
            return false;
        }
        self.marking_worklists().push(object);
        self.on_first_mark(host, object);
        true
    }

    fn process_strong_heap_object(&mut self, slot: Slot<Self::Object>, object: Self::Object) {
        if !self.should_mark_object(object) {
            return;
        }
        self.mark_object(Some(slot.host), object);
        self.record_slot(slot, object);
    }

    /// Visit slots `start..end` of `host`. A weak reference is only treated as weak by
    /// visitors that support weakness, otherwise it keeps its target alive.
    fn visit_pointers(&mut self, host: Self::Object, start: usize, end: usize) {
        let model = self.model();
        for index in start..end {
            // Relaxed: the mutator may be writing the slot. A reference that turns weak
            // concurrently is still seen as strong by the write barrier, so nothing is lost.
            match model.load_field(host, index, Ordering::Relaxed) {
                MaybeObject::Strong(object) => {
                    self.process_strong_heap_object(Slot::new(host, index), object)
                }
                MaybeObject::Weak(object) => {
                    self.process_weak_heap_object(Slot::new(host, index), object)
                }
                MaybeObject::Smi(_) | MaybeObject::Cleared => {}
            }
        }
    }

    fn visit_pointer(&mut self, host: Self::Object, index: usize) {
        self.visit_pointers(host, index, index + 1);
    }

    fn visit_map_pointer(&mut self, host: Self::Object) {
        if Self::SHOULD_VISIT_MAP_POINTER {
            self.visit_pointer(host, layout::MAP);
        }
    }

    /// An object whose fields are all visited the ordinary way.
    fn visit_struct(&mut self, object: Self::Object) -> usize {
        self.visit_map_pointer(object);
        let field_count = self.model().field_count(object);
        self.visit_pointers(object, layout::BODY_START, field_count);
        self.model().size_of(object)
    }

    /// Visit the map and every body slot not in `skip`.
    fn visit_js_object_body(&mut self, object: Self::Object, skip: &[usize]) -> usize {
        self.visit_map_pointer(object);
        let field_count = self.model().field_count(object);
        let mut start = layout::BODY_START;
        for index in layout::BODY_START..=field_count {
            if index == field_count || skip.contains(&index) {
                self.visit_pointers(object, start, index);
                start = index + 1;
            }
        }
        self.model().size_of(object)
    }

    /// Visit a JavaScript object. Slots in `skip` are handled by the caller.
    fn visit_js_object_subclass(&mut self, object: Self::Object, skip: &[usize]) -> usize {
        self.visit_js_object_body(object, skip)
    }

    /// Visit an object that may wrap an embedder object, and hand the wrapper to the
    /// embedder. The snapshot is taken before the fields are visited.
    fn visit_embedder_tracing_subclass(&mut self, object: Self::Object) -> usize {
        let snapshot = if self.trace_embedder_fields()
            && self.marking_worklists().supports_extract_wrapper()
        {
            self.model().extract_wrapper(object)
        } else {
            None
        };
        let size = self.visit_js_object_subclass(object, &[]);
        match snapshot {
            Some(snapshot) if size > 0 => self.marking_worklists().push_extracted_wrapper(snapshot),
            _ => {}
        }
        size
    }

    fn visit_fixed_array(&mut self, array: Self::Object) -> usize {
        if self.can_update_values_in_heap() {
            if let Some(progress_bar) = self.model().progress_bar(array) {
                if progress_bar.is_enabled() {
                    return self.visit_fixed_array_with_progress_bar(array);
                }
            }
        }
        self.visit_struct(array)
    }

    /// Visit the next chunk of a large array, and push the array back if slots remain.
    /// Returns the bytes visited by this increment.
    fn visit_fixed_array_with_progress_bar(&mut self, array: Self::Object) -> usize {
        let model = self.model();
        let Some(progress_bar) = model.progress_bar(array) else {
            return self.visit_struct(array);
        };
        let field_count = model.field_count(array);
        let current = progress_bar.value();
        let mut start = current;
        if start == 0 {
            self.visit_map_pointer(array);
            start = layout::fixed_array::BODY_START;
        }
        let end = field_count.min(start + self.progress_bar_chunk());
        if start >= end {
            return 0;
        }
        self.visit_pointers(array, start, end);
        // Only the visitor that popped the array advances the bar.
        let success = progress_bar.try_set_new_value(current, end);
        assert!(success, "progress bar moved during the visit");
        if end < field_count {
            // The array may only be pushed again once the bar is updated.
            debug_assert!(self.should_mark_object(array));
            self.marking_worklists().push(array);
        }
        (end - start) * BYTES_IN_SLOT
    }

    /// Visit the header and all descriptors of a descriptor array.
    fn visit_descriptor_array_strongly(&mut self, array: Self::Object) -> usize {
        let model = self.model();
        self.visit_map_pointer(array);
        let number_of_descriptors = model.number_of_descriptors(array);
        self.visit_pointers(
            array,
            layout::BODY_START,
            layout::descriptor_array::descriptor_slot(number_of_descriptors),
        );
        model.size_of(array)
    }
}
