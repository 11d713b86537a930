//! The young generation marking visitor.
//!
//! Only marks objects in the young generation, and keeps everything it reaches alive:
//! weak references are treated as strong, and ephemeron values are visited regardless of
//! their keys. Ephemeron tables are handed to the caller, which resolves their keys after
//! marking. Surviving objects with an allocation memento feed pretenuring decisions.
//! External pointer table entries are not marked.

use crate::heap::marking_state::MarkingState;
use crate::heap::pretenuring::PretenuringFeedback;
use crate::heap::visitor::MarkingVisitor;
use crate::heap::worklist::{Local, MarkingWorklists, MarkingWorklistsLocal, Worklist};
use crate::util::options::Options;
use crate::vm::layout;
use crate::vm::{ObjectModel, Slot};

pub struct YoungGenerationMarkingVisitor<'a, M: ObjectModel, S> {
    model: &'a M,
    marking_state: &'a S,
    marking_worklists: MarkingWorklistsLocal<'a, M::Object>,
    ephemeron_tables: Local<'a, M::Object>,
    trace_embedder_fields: bool,
    pretenuring_feedback: Option<PretenuringFeedback<M::Object>>,
}

impl<'a, M: ObjectModel + 'a, S: MarkingState<M::Object> + 'a>
    YoungGenerationMarkingVisitor<'a, M, S>
{
    pub fn new(
        model: &'a M,
        marking_state: &'a S,
        marking_worklists: &'a MarkingWorklists<M::Object>,
        ephemeron_tables: &'a Worklist<M::Object>,
        options: &Options,
    ) -> Self {
        Self {
            model,
            marking_state,
            marking_worklists: marking_worklists.local(),
            ephemeron_tables: ephemeron_tables.local(),
            trace_embedder_fields: options.trace_embedder_fields,
            pretenuring_feedback: options
                .allocation_site_pretenuring
                .then(PretenuringFeedback::new),
        }
    }

    /// The mementos found since the last call, to be merged into the
    /// [`crate::heap::pretenuring::PretenuringHandler`].
    pub fn take_pretenuring_feedback(&mut self) -> PretenuringFeedback<M::Object> {
        self.pretenuring_feedback
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub fn publish(&mut self) {
        self.marking_worklists.publish();
        self.ephemeron_tables.publish();
    }

    fn update_allocation_site(&mut self, object: M::Object) {
        let Some(feedback) = self.pretenuring_feedback.as_mut() else {
            return;
        };
        if let Some(site) = self.model.allocation_site(object) {
            *feedback.entry(site).or_default() += 1;
        }
    }
}

impl<'a, M, S> MarkingVisitor<'a> for YoungGenerationMarkingVisitor<'a, M, S>
where
    M: ObjectModel + 'a,
    S: MarkingState<M::Object> + 'a,
{
    type Object = M::Object;
    type Model = M;
    type State = S;

    const SHOULD_VISIT_MAP_POINTER: bool = false;

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
        false
    }

    fn trace_embedder_fields(&self) -> bool {
        self.trace_embedder_fields
    }

    fn progress_bar_chunk(&self) -> usize {
        usize::MAX
    }

    fn should_mark_object(&self, object: M::Object) -> bool {
        self.model.in_young_generation(object)
    }

    fn record_slot(&mut self, _slot: Slot<M::Object>, _target: M::Object) {}

    fn process_weak_heap_object(&mut self, slot: Slot<M::Object>, object: M::Object) {
        self.process_strong_heap_object(slot, object);
    }

    fn mark_array_buffer_extension(&mut self, buffer: M::Object) {
        self.model.mark_array_buffer_extension(buffer, true);
    }

    fn visit_descriptor_array(&mut self, array: M::Object) -> usize {
        self.visit_descriptor_array_strongly(array)
    }

    fn visit_map(&mut self, map: M::Object) -> usize {
        self.visit_struct(map)
    }

    fn visit_transition_array(&mut self, array: M::Object) -> usize {
        self.visit_struct(array)
    }

    fn visit_ephemeron_hash_table(&mut self, table: M::Object) -> usize {
        use layout::ephemeron_hash_table::{number_of_entries, value_slot};

        self.ephemeron_tables.push(table);
        for entry in 0..number_of_entries(self.model.field_count(table)) {
            self.visit_pointer(table, value_slot(entry));
        }
        self.model.size_of(table)
    }

    fn visit_js_weak_ref(&mut self, weak_ref: M::Object) -> usize {
        self.visit_js_object_subclass(weak_ref, &[])
    }

    fn visit_weak_cell(&mut self, weak_cell: M::Object) -> usize {
        self.visit_struct(weak_cell)
    }

    fn visit_shared_function_info(&mut self, shared: M::Object) -> usize {
        self.visit_struct(shared)
    }

    fn visit_js_function(&mut self, function: M::Object) -> usize {
        self.visit_js_object_subclass(function, &[])
    }

    fn visit_js_object_subclass(&mut self, object: M::Object, skip: &[usize]) -> usize {
        let size = self.visit_js_object_body(object, skip);
        self.update_allocation_site(object);
        size
    }

    /// The fields are visited first. The wrapper is only extracted if an embedder
    /// consumes it.
    fn visit_embedder_tracing_subclass(&mut self, object: M::Object) -> usize {
        let size = self.visit_js_object_subclass(object, &[]);
        if size == 0
            || !self.trace_embedder_fields
            || !self.marking_worklists.supports_extract_wrapper()
        {
            return size;
        }
        if let Some(snapshot) = self.model.extract_wrapper(object) {
            self.marking_worklists.push_extracted_wrapper(snapshot);
        }
        size
    }
}
