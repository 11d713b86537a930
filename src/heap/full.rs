//! The full-heap marking visitor.
//!
//! Marks every object outside read-only space. Weak references, ephemerons, weak refs and
//! weak cells are deferred to the weak object worklists when their referents are not yet
//! known to be live. Descriptor arrays shared between maps are marked incrementally, large
//! arrays are scanned in chunks, and old bytecode and baseline code are left unmarked so
//! they can be flushed.

use std::sync::atomic::Ordering;

use crate::heap::code_flushing::CodeFlushing;
use crate::heap::marking_state::MarkingState;
use crate::heap::retainers::Retainers;
use crate::heap::visitor::MarkingVisitor;
use crate::heap::worklist::{
    Ephemeron, MarkingWorklists, MarkingWorklistsLocal, WeakObjects, WeakObjectsLocal,
};
use crate::sandbox::ExternalPointerSpaces;
use crate::util::options::Options;
use crate::vm::layout;
use crate::vm::{CodeKind, MaybeObject, ObjectModel, Slot, VisitorId};

pub struct FullMarkingVisitor<'a, M: ObjectModel, S> {
    model: &'a M,
    marking_state: &'a S,
    marking_worklists: MarkingWorklistsLocal<'a, M::Object>,
    weak_objects: WeakObjectsLocal<'a, M::Object>,
    external_pointers: ExternalPointerSpaces<'a>,
    track_retaining_path: bool,
    retainers: Option<&'a Retainers<M::Object>>,
    /// Descriptor array marking states of older cycles are stale.
    mark_compact_epoch: u32,
    code_flushing: CodeFlushing,
    can_update_values_in_heap: bool,
    trace_embedder_fields: bool,
    progress_bar_chunk: usize,
    recorded_slots: Vec<Slot<M::Object>>,
}

impl<'a, M: ObjectModel + 'a, S: MarkingState<M::Object> + 'a> FullMarkingVisitor<'a, M, S> {
    pub fn new(
        model: &'a M,
        marking_state: &'a S,
        marking_worklists: &'a MarkingWorklists<M::Object>,
        weak_objects: &'a WeakObjects<M::Object>,
        options: &Options,
        mark_compact_epoch: u32,
    ) -> Self {
        Self {
            model,
            marking_state,
            marking_worklists: marking_worklists.local(),
            weak_objects: weak_objects.local(),
            external_pointers: ExternalPointerSpaces::default(),
            track_retaining_path: options.track_retaining_path,
            retainers: None,
            mark_compact_epoch,
            code_flushing: CodeFlushing::new(options),
            can_update_values_in_heap: true,
            trace_embedder_fields: options.trace_embedder_fields,
            progress_bar_chunk: options.progress_bar_scanning_chunk,
            recorded_slots: vec![],
        }
    }

    /// Mark the external pointer table entries referenced by visited objects.
    pub fn with_external_pointers(self, external_pointers: ExternalPointerSpaces<'a>) -> Self {
        Self {
            external_pointers,
            ..self
        }
    }

    /// Record retainers while `track_retaining_path` is set.
    pub fn with_retainers(self, retainers: &'a Retainers<M::Object>) -> Self {
        let retainers = self.track_retaining_path.then_some(retainers);
        Self { retainers, ..self }
    }

    pub fn with_code_flushing(self, code_flushing: CodeFlushing) -> Self {
        Self {
            code_flushing,
            ..self
        }
    }

    /// A visitor running concurrently with the mutator. It does not update progress bars
    /// or descriptor array marking states.
    pub fn concurrent(self) -> Self {
        Self {
            can_update_values_in_heap: false,
            ..self
        }
    }

    pub fn mark_compact_epoch(&self) -> u32 {
        self.mark_compact_epoch
    }

    pub fn code_flushing(&self) -> &CodeFlushing {
        &self.code_flushing
    }

    pub fn weak_objects(&mut self) -> &mut WeakObjectsLocal<'a, M::Object> {
        &mut self.weak_objects
    }

    /// Slots referring to evacuation candidates, recorded since the last call.
    pub fn take_recorded_slots(&mut self) -> Vec<Slot<M::Object>> {
        std::mem::take(&mut self.recorded_slots)
    }

    /// Make everything this visitor pushed visible to other threads.
    pub fn publish(&mut self) {
        self.marking_worklists.publish();
        self.weak_objects.publish();
    }

    fn is_live_or_immortal(&self, value: MaybeObject<M::Object>) -> bool {
        match value.heap_object() {
            Some(object) => {
                self.model.in_read_only_space(object) || self.marking_state.is_marked(object)
            }
            None => true,
        }
    }

    /// Does the function hold bytecode that this cycle may flush, either directly or
    /// through baseline code?
    fn has_bytecode_array_for_flushing(&self, shared: M::Object) -> bool {
        use layout::code::BYTECODE_OR_INTERPRETER_DATA;
        use layout::shared_function_info::FUNCTION_DATA;

        let mode = self.code_flushing.mode;
        if mode.is_flushing_disabled() || !self.model.allows_bytecode_flushing(shared) {
            return false;
        }
        // The data is read once: the mutator may replace it concurrently.
        let Some(mut data) = self
            .model
            .load_field(shared, FUNCTION_DATA, Ordering::Acquire)
            .strong()
        else {
            return false;
        };
        if self.model.visitor_id(data) == VisitorId::Code {
            debug_assert_eq!(self.model.code_kind(data), CodeKind::Baseline);
            if !mode.flush_baseline {
                return false;
            }
            match self
                .model
                .load_field(data, BYTECODE_OR_INTERPRETER_DATA, Ordering::Acquire)
                .strong()
            {
                Some(bytecode) => data = bytecode,
                None => return false,
            }
        } else if !mode.flush_bytecode {
            return false;
        }
        self.model.visitor_id(data) == VisitorId::BytecodeArray
    }

    fn should_flush_code(&self, shared: M::Object) -> bool {
        let flush = self
            .code_flushing
            .should_flush_code(self.model.shared_function_info_age(shared));
        let age = if flush { "old" } else { "young" };
        trace!("Code of {:?} is {}", shared, age);
        flush
    }

    fn should_flush_baseline_code(&self, function: M::Object) -> bool {
        use layout::js_function::SHARED_FUNCTION_INFO;

        if !self.code_flushing.mode.flush_baseline {
            return false;
        }
        let model = self.model;
        // The shared function info and code may still be under construction.
        let Some(shared) = model
            .load_field(function, SHARED_FUNCTION_INFO, Ordering::Acquire)
            .strong()
        else {
            return false;
        };
        if model.visitor_id(shared) != VisitorId::SharedFunctionInfo {
            return false;
        }
        let Some(code) = model
            .load_field(function, layout::js_function::CODE, Ordering::Acquire)
            .strong()
        else {
            return false;
        };
        let is_code = model.visitor_id(code) == VisitorId::Code;
        if !is_code || model.code_kind(code) != CodeKind::Baseline {
            return false;
        }
        self.has_bytecode_array_for_flushing(shared) && self.should_flush_code(shared)
    }

    /// Mark only the descriptors the map owns. The slot holding the descriptor array is
    /// recorded here, and visiting the map's fields finds the array already marked.
    fn visit_descriptors_for_map(&mut self, map: M::Object) {
        let model = self.model;
        if !self.can_update_values_in_heap || !model.map_can_transition(map) {
            return;
        }
        // A map under deserialization has no descriptors yet.
        let Some(descriptors) = model
            .load_field(map, layout::map::INSTANCE_DESCRIPTORS, Ordering::Acquire)
            .strong()
        else {
            return;
        };
        let strong = model.is_strong_descriptor_array(descriptors);
        if strong || model.in_read_only_space(descriptors) {
            return;
        }
        self.record_slot(
            Slot::new(map, layout::map::INSTANCE_DESCRIPTORS),
            descriptors,
        );
        let number_of_own_descriptors = model.number_of_own_descriptors(map);
        if number_of_own_descriptors == 0 {
            return;
        }
        // The number of own descriptors may be observed out of sync with the array. The
        // write barrier then marks what is missing.
        let descriptors_to_mark =
            number_of_own_descriptors.min(model.number_of_descriptors(descriptors));
        self.marking_state.try_mark(descriptors);
        if model
            .descriptor_array_marking_state(descriptors)
            .try_update_indices_to_mark(self.mark_compact_epoch, descriptors_to_mark)
        {
            self.marking_worklists.push(descriptors);
        }
    }
}

impl<'a, M, S> MarkingVisitor<'a> for FullMarkingVisitor<'a, M, S>
where
    M: ObjectModel + 'a,
    S: MarkingState<M::Object> + 'a,
{
    type Object = M::Object;
    type Model = M;
    type State = S;

    const SHOULD_VISIT_MAP_POINTER: bool = true;

    fn model(&self) -> &'a M {
        self.model
    }

    fn marking_state(&self) -> &'a S {
        self.marking_state
    }

    fn marking_worklists(&mut self) -> &mut MarkingWorklistsLocal<'a, M::Object> {
        &mut self.marking_worklists
    }

    fn can_update_values_in_heap(&self) -> bool {
        self.can_update_values_in_heap
    }

    fn trace_embedder_fields(&self) -> bool {
        self.trace_embedder_fields
    }

    fn progress_bar_chunk(&self) -> usize {
        self.progress_bar_chunk
    }

    fn should_mark_object(&self, object: M::Object) -> bool {
        !self.model.in_read_only_space(object)
    }

    fn record_slot(&mut self, slot: Slot<M::Object>, target: M::Object) {
        if self.model.is_evacuation_candidate(target) {
            self.recorded_slots.push(slot);
        }
    }

    fn process_weak_heap_object(&mut self, slot: Slot<M::Object>, object: M::Object) {
        if !self.should_mark_object(object) {
            return;
        }
        if self.marking_state.is_marked(object) {
            self.record_slot(slot, object);
        } else {
            // Resolved once the liveness of the whole transitive closure is known.
            self.weak_objects.weak_references.push(slot);
        }
    }

    fn on_first_mark(&mut self, host: Option<M::Object>, object: M::Object) {
        if let Some(retainers) = self.retainers {
            retainers.add_retainer(host, object);
        }
    }

    fn visit_external_pointers(&mut self, host: M::Object) {
        let external_pointers = self.external_pointers;
        self.model
            .visit_external_pointer_slots(host, &mut |slot, tag| external_pointers.mark(slot, tag));
    }

    fn visit_descriptor_array(&mut self, array: M::Object) -> usize {
        if !self.can_update_values_in_heap {
            return self.visit_descriptor_array_strongly(array);
        }
        let model = self.model;
        // Every visit claims the descriptors requested since the previous one. Roots, maps
        // and the write barrier all go through this path.
        let (start, end) = model
            .descriptor_array_marking_state(array)
            .acquire_descriptor_range_to_mark(
                self.mark_compact_epoch,
                model.number_of_descriptors(array),
            );
        if start == end {
            return 0;
        }
        debug_assert!(start < end);
        self.visit_pointers(
            array,
            layout::descriptor_array::descriptor_slot(start),
            layout::descriptor_array::descriptor_slot(end),
        );
        if start != 0 {
            return 0;
        }
        // First visit in this cycle: visit the header and account for the whole array.
        self.visit_pointers(
            array,
            layout::BODY_START,
            layout::descriptor_array::FIRST_DESCRIPTOR,
        );
        self.visit_map_pointer(array);
        model.size_of(array)
    }

    fn visit_map(&mut self, map: M::Object) -> usize {
        let size = self.model.size_of(map);
        self.visit_descriptors_for_map(map);
        // A transition array was marked by now if the map has one, so visiting the
        // transitions slot does not push it again.
        self.visit_struct(map);
        size
    }

    fn visit_transition_array(&mut self, array: M::Object) -> usize {
        let size = self.visit_struct(array);
        self.weak_objects.transition_arrays.push(array);
        size
    }

    fn visit_ephemeron_hash_table(&mut self, table: M::Object) -> usize {
        use layout::ephemeron_hash_table::{key_slot, number_of_entries, value_slot};

        let model = self.model;
        self.weak_objects.ephemeron_hash_tables.push(table);
        self.visit_map_pointer(table);
        for entry in 0..number_of_entries(model.field_count(table)) {
            let key = model.load_field(table, key_slot(entry), Ordering::Relaxed);
            let Some(key) = key.heap_object() else {
                // An empty or deleted entry.
                self.visit_pointer(table, value_slot(entry));
                continue;
            };
            self.record_slot(Slot::new(table, key_slot(entry)), key);
            if model.in_read_only_space(key) || self.marking_state.is_marked(key) {
                self.visit_pointer(table, value_slot(entry));
                continue;
            }
            let value = model.load_field(table, value_slot(entry), Ordering::Relaxed);
            if let Some(value) = value.heap_object() {
                self.record_slot(Slot::new(table, value_slot(entry)), value);
                // Revisited once the key's liveness is known.
                if self.should_mark_object(value) && self.marking_state.is_unmarked(value) {
                    self.weak_objects
                        .discovered_ephemerons
                        .push(Ephemeron { key, value });
                }
            }
        }
        model.size_of(table)
    }

    fn visit_js_weak_ref(&mut self, weak_ref: M::Object) -> usize {
        use layout::js_weak_ref::TARGET;

        let size = self.visit_js_object_subclass(weak_ref, &[TARGET]);
        if size == 0 {
            return 0;
        }
        let target = self.model.load_field(weak_ref, TARGET, Ordering::Relaxed);
        if let Some(target) = target.heap_object() {
            if self.is_live_or_immortal(MaybeObject::Strong(target)) {
                // The body visit skipped the target slot.
                self.record_slot(Slot::new(weak_ref, TARGET), target);
            } else {
                self.weak_objects.js_weak_refs.push(weak_ref);
            }
        }
        size
    }

    fn visit_weak_cell(&mut self, weak_cell: M::Object) -> usize {
        use layout::weak_cell::{TARGET, UNREGISTER_TOKEN};

        let size = self.visit_js_object_body(weak_cell, &[TARGET, UNREGISTER_TOKEN]);
        let model = self.model;
        let target = model.load_field(weak_cell, TARGET, Ordering::Relaxed);
        let unregister_token = model.load_field(weak_cell, UNREGISTER_TOKEN, Ordering::Relaxed);
        if self.is_live_or_immortal(target) && self.is_live_or_immortal(unregister_token) {
            if let Some(target) = target.heap_object() {
                self.record_slot(Slot::new(weak_cell, TARGET), target);
            }
            if let Some(unregister_token) = unregister_token.heap_object() {
                self.record_slot(Slot::new(weak_cell, UNREGISTER_TOKEN), unregister_token);
            }
        } else {
            // The target or the token may be dead.
            self.weak_objects.weak_cells.push(weak_cell);
        }
        size
    }

    fn visit_shared_function_info(&mut self, shared: M::Object) -> usize {
        use layout::shared_function_info::FUNCTION_DATA;

        let size = self.visit_js_object_body(shared, &[FUNCTION_DATA]);
        let can_flush_bytecode = self.has_bytecode_array_for_flushing(shared);
        if can_flush_bytecode {
            self.code_flushing
                .make_older(self.model.shared_function_info_age(shared));
        }
        if !can_flush_bytecode || !self.should_flush_code(shared) {
            self.visit_pointer(shared, FUNCTION_DATA);
        } else if !self.code_flushing.mode.flush_bytecode {
            // Only the baseline code may go. Keep the bytecode hanging off it alive.
            debug_assert!(self.code_flushing.mode.flush_baseline);
            if let Some(baseline_code) = self
                .model
                .load_field(shared, FUNCTION_DATA, Ordering::Acquire)
                .strong()
            {
                self.visit_pointer(baseline_code, layout::code::BYTECODE_OR_INTERPRETER_DATA);
            }
            self.weak_objects.code_flushing_candidates.push(shared);
        } else {
            self.weak_objects.code_flushing_candidates.push(shared);
        }
        size
    }

    fn visit_js_function(&mut self, function: M::Object) -> usize {
        use layout::js_function::CODE;

        if self.should_flush_baseline_code(function) {
            // The code is kept alive by the shared function info, if at all.
            self.weak_objects
                .baseline_flushing_candidates
                .push(function);
        } else {
            self.visit_pointer(function, CODE);
            if self.code_flushing.mode.flush_bytecode
                && self.model.needs_reset_due_to_flushed_bytecode(function)
            {
                self.weak_objects.flushed_js_functions.push(function);
            }
        }
        self.visit_js_object_subclass(function, &[CODE])
    }
}
