//! An in-memory object graph for testing the marking visitors.
//!
//! Objects are built once with [`MockHeap::build`], after which the heap is only accessed
//! through shared references. Every field the visitors or the tests may write is atomic, so
//! a `&MockHeap` can be shared by marking threads.

// Not every test uses every builder knob.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};

use crate::heap::descriptor_array::DescriptorArrayMarkingState;
use crate::heap::full::FullMarkingVisitor;
use crate::heap::marking_state::{BitmapMarkingState, MarkingState};
use crate::heap::progress_bar::ProgressBar;
use crate::heap::worklist::{MarkingWorklists, WeakObjects, Worklist};
use crate::heap::young::YoungGenerationMarkingVisitor;
use crate::sandbox::ExternalPointerTag;
use crate::util::constants::BYTES_IN_SLOT;
use crate::util::options::Options;
use crate::vm::layout;
use crate::vm::{CodeKind, MaybeObject, ObjectModel, VisitorId, WrapperSnapshot};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

const TAG_BITS: u32 = 2;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;
const SMI_TAG: u64 = 0;
const STRONG_TAG: u64 = 1;
const CLEARED_TAG: u64 = 2;
const WEAK_TAG: u64 = 3;

fn encode(value: MaybeObject<ObjectId>) -> u64 {
    match value {
        MaybeObject::Smi(smi) => ((smi as i64 as u64) << TAG_BITS) | SMI_TAG,
        MaybeObject::Cleared => CLEARED_TAG,
        MaybeObject::Strong(ObjectId(id)) => ((id as u64) << TAG_BITS) | STRONG_TAG,
        MaybeObject::Weak(ObjectId(id)) => ((id as u64) << TAG_BITS) | WEAK_TAG,
    }
}

fn decode(raw: u64) -> MaybeObject<ObjectId> {
    let id = ObjectId((raw >> TAG_BITS) as u32);
    match raw & TAG_MASK {
        SMI_TAG => MaybeObject::Smi(((raw as i64) >> TAG_BITS) as isize),
        STRONG_TAG => MaybeObject::Strong(id),
        WEAK_TAG => MaybeObject::Weak(id),
        _ => MaybeObject::Cleared,
    }
}

pub struct MockObject {
    kind: VisitorId,
    fields: Box<[AtomicU64]>,
    /// How often each slot was read through [`ObjectModel::load_field`].
    loads: Box<[AtomicU32]>,
    young: bool,
    read_only: bool,
    progress_bar: ProgressBar,
    descriptor_state: DescriptorArrayMarkingState,
    own_descriptors: usize,
    can_transition: bool,
    strong_descriptors: bool,
    age: AtomicU16,
    allows_flushing: bool,
    code_kind: CodeKind,
    needs_reset: bool,
    allocation_site: Option<ObjectId>,
    wrapper: Option<WrapperSnapshot>,
    evacuation_candidate: bool,
    external_pointers: Vec<(AtomicU32, ExternalPointerTag)>,
    extension_marked: AtomicBool,
}

fn default_field_count(kind: VisitorId) -> usize {
    match kind {
        VisitorId::DescriptorArray => layout::descriptor_array::FIRST_DESCRIPTOR,
        VisitorId::Map => layout::map::TRANSITIONS + 1,
        VisitorId::EphemeronHashTable => layout::ephemeron_hash_table::ENTRIES_START,
        VisitorId::JSWeakRef => layout::js_weak_ref::TARGET + 1,
        VisitorId::WeakCell => layout::weak_cell::HOLDINGS + 1,
        VisitorId::SharedFunctionInfo => layout::shared_function_info::FUNCTION_DATA + 1,
        VisitorId::Code => layout::code::BYTECODE_OR_INTERPRETER_DATA + 1,
        VisitorId::JSFunction => layout::js_function::FEEDBACK_CELL + 1,
        _ => 1,
    }
}

/// Builds one object. See [`MockHeap::build`].
pub struct ObjectBuilder<'h> {
    heap: &'h mut MockHeap,
    object: MockObject,
}

impl ObjectBuilder<'_> {
    /// The number of slots, including the map slot. Slots start as `Smi(0)`.
    pub fn fields(mut self, count: usize) -> Self {
        assert!(count >= 1, "every object has a map slot");
        self.object.fields = (0..count).map(|_| AtomicU64::new(0)).collect();
        self.object.loads = (0..count).map(|_| AtomicU32::new(0)).collect();
        self
    }

    /// A descriptor array with room for `count` descriptors.
    pub fn descriptors(self, count: usize) -> Self {
        self.fields(layout::descriptor_array::descriptor_slot(count))
    }

    /// An ephemeron hash table with room for `count` entries.
    pub fn entries(self, count: usize) -> Self {
        self.fields(layout::ephemeron_hash_table::key_slot(count))
    }

    pub fn young(mut self) -> Self {
        self.object.young = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.object.read_only = true;
        self
    }

    pub fn progress_bar(self) -> Self {
        self.object.progress_bar.enable();
        self
    }

    pub fn own_descriptors(mut self, count: usize) -> Self {
        self.object.own_descriptors = count;
        self
    }

    pub fn can_transition(mut self, can_transition: bool) -> Self {
        self.object.can_transition = can_transition;
        self
    }

    pub fn strong_descriptors(mut self) -> Self {
        self.object.strong_descriptors = true;
        self
    }

    pub fn age(self, age: u16) -> Self {
        self.object.age.store(age, Ordering::Relaxed);
        self
    }

    pub fn allows_flushing(mut self, allows: bool) -> Self {
        self.object.allows_flushing = allows;
        self
    }

    pub fn code_kind(mut self, kind: CodeKind) -> Self {
        self.object.code_kind = kind;
        self
    }

    pub fn needs_reset(mut self) -> Self {
        self.object.needs_reset = true;
        self
    }

    pub fn allocation_site(mut self, site: ObjectId) -> Self {
        self.object.allocation_site = Some(site);
        self
    }

    pub fn wrapper(mut self, wrapper: WrapperSnapshot) -> Self {
        self.object.wrapper = Some(wrapper);
        self
    }

    pub fn evacuation_candidate(mut self) -> Self {
        self.object.evacuation_candidate = true;
        self
    }

    /// Add an external pointer field holding `handle`.
    pub fn external_pointer(mut self, handle: u32, tag: ExternalPointerTag) -> Self {
        self.object
            .external_pointers
            .push((AtomicU32::new(handle), tag));
        self
    }

    pub fn finish(self) -> ObjectId {
        let id = ObjectId(self.heap.objects.len() as u32);
        self.heap.objects.push(self.object);
        id
    }
}

#[derive(Default)]
pub struct MockHeap {
    objects: Vec<MockObject>,
}

impl MockHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(&mut self, kind: VisitorId) -> ObjectBuilder<'_> {
        let object = MockObject {
            kind,
            fields: Box::new([]),
            loads: Box::new([]),
            young: false,
            read_only: false,
            progress_bar: ProgressBar::new(),
            descriptor_state: DescriptorArrayMarkingState::new(),
            own_descriptors: 0,
            can_transition: true,
            strong_descriptors: false,
            age: AtomicU16::new(0),
            allows_flushing: true,
            code_kind: CodeKind::Other,
            needs_reset: false,
            allocation_site: None,
            wrapper: None,
            evacuation_candidate: false,
            external_pointers: vec![],
            extension_marked: AtomicBool::new(false),
        };
        ObjectBuilder { heap: self, object }.fields(default_field_count(kind))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn get(&self, object: ObjectId) -> &MockObject {
        &self.objects[object.0 as usize]
    }

    pub fn load(&self, object: ObjectId, index: usize) -> MaybeObject<ObjectId> {
        decode(self.get(object).fields[index].load(Ordering::Relaxed))
    }

    pub fn set(&self, object: ObjectId, index: usize, value: MaybeObject<ObjectId>) {
        let field = &self.get(object).fields[index];
        field.store(encode(value), Ordering::Relaxed);
    }

    pub fn set_strong(&self, object: ObjectId, index: usize, target: ObjectId) {
        self.set(object, index, MaybeObject::Strong(target));
    }

    pub fn set_weak(&self, object: ObjectId, index: usize, target: ObjectId) {
        self.set(object, index, MaybeObject::Weak(target));
    }

    pub fn age(&self, shared: ObjectId) -> u16 {
        self.get(shared).age.load(Ordering::Relaxed)
    }

    pub fn extension_marked(&self, buffer: ObjectId) -> bool {
        self.get(buffer).extension_marked.load(Ordering::Relaxed)
    }

    /// The number of times a visitor read slot `index` of `object`.
    pub fn field_loads(&self, object: ObjectId, index: usize) -> u32 {
        self.get(object).loads[index].load(Ordering::Relaxed)
    }

    /// The `i`th external pointer field of `object`.
    pub fn external_pointer_slot(&self, object: ObjectId, i: usize) -> &AtomicU32 {
        &self.get(object).external_pointers[i].0
    }
}

impl ObjectModel for MockHeap {
    type Object = ObjectId;

    fn visitor_id(&self, object: ObjectId) -> VisitorId {
        self.get(object).kind
    }

    fn size_of(&self, object: ObjectId) -> usize {
        self.field_count(object) * BYTES_IN_SLOT
    }

    fn field_count(&self, object: ObjectId) -> usize {
        self.get(object).fields.len()
    }

    fn load_field(&self, object: ObjectId, index: usize, order: Ordering) -> MaybeObject<ObjectId> {
        let object = self.get(object);
        object.loads[index].fetch_add(1, Ordering::Relaxed);
        decode(object.fields[index].load(order))
    }

    fn store_field(
        &self,
        object: ObjectId,
        index: usize,
        value: MaybeObject<ObjectId>,
        order: Ordering,
    ) {
        self.get(object).fields[index].store(encode(value), order);
    }

    fn in_read_only_space(&self, object: ObjectId) -> bool {
        self.get(object).read_only
    }

    fn in_young_generation(&self, object: ObjectId) -> bool {
        self.get(object).young
    }

    fn object_index(&self, object: ObjectId) -> usize {
        object.0 as usize
    }

    fn progress_bar(&self, array: ObjectId) -> Option<&ProgressBar> {
        Some(&self.get(array).progress_bar)
    }

    fn number_of_descriptors(&self, array: ObjectId) -> usize {
        let field_count = self.field_count(array);
        field_count.saturating_sub(layout::descriptor_array::FIRST_DESCRIPTOR)
            / layout::descriptor_array::ENTRY_SIZE
    }

    fn descriptor_array_marking_state(&self, array: ObjectId) -> &DescriptorArrayMarkingState {
        &self.get(array).descriptor_state
    }

    fn is_strong_descriptor_array(&self, array: ObjectId) -> bool {
        self.get(array).strong_descriptors
    }

    fn number_of_own_descriptors(&self, map: ObjectId) -> usize {
        self.get(map).own_descriptors
    }

    fn map_can_transition(&self, map: ObjectId) -> bool {
        self.get(map).can_transition
    }

    fn shared_function_info_age(&self, shared: ObjectId) -> &AtomicU16 {
        &self.get(shared).age
    }

    fn allows_bytecode_flushing(&self, shared: ObjectId) -> bool {
        self.get(shared).allows_flushing
    }

    fn code_kind(&self, code: ObjectId) -> CodeKind {
        self.get(code).code_kind
    }

    fn needs_reset_due_to_flushed_bytecode(&self, function: ObjectId) -> bool {
        self.get(function).needs_reset
    }

    fn mark_array_buffer_extension(&self, buffer: ObjectId, _young: bool) {
        self.get(buffer)
            .extension_marked
            .store(true, Ordering::Relaxed);
    }

    fn visit_external_pointer_slots(
        &self,
        object: ObjectId,
        visit: &mut dyn FnMut(&AtomicU32, ExternalPointerTag),
    ) {
        for (slot, tag) in self.get(object).external_pointers.iter() {
            visit(slot, *tag);
        }
    }

    fn allocation_site(&self, object: ObjectId) -> Option<ObjectId> {
        self.get(object).allocation_site
    }

    fn extract_wrapper(&self, object: ObjectId) -> Option<WrapperSnapshot> {
        self.get(object).wrapper
    }

    fn is_evacuation_candidate(&self, object: ObjectId) -> bool {
        self.get(object).evacuation_candidate
    }
}

/// The shared state of one marking cycle over a [`MockHeap`].
pub struct MarkingCycle<'h> {
    pub heap: &'h MockHeap,
    pub state: BitmapMarkingState<'h, MockHeap>,
    pub worklists: MarkingWorklists<ObjectId>,
    pub weak_objects: WeakObjects<ObjectId>,
    pub ephemeron_tables: Worklist<ObjectId>,
    pub options: Options,
}

impl<'h> MarkingCycle<'h> {
    pub fn new(heap: &'h MockHeap) -> Self {
        Self::with_options(heap, Options::default())
    }

    pub fn with_options(heap: &'h MockHeap, options: Options) -> Self {
        MarkingCycle {
            heap,
            state: BitmapMarkingState::new(heap, heap.len()),
            worklists: MarkingWorklists::new(true),
            weak_objects: WeakObjects::new(),
            ephemeron_tables: Worklist::new(),
            options,
        }
    }

    pub fn full_visitor(
        &self,
    ) -> FullMarkingVisitor<'_, MockHeap, BitmapMarkingState<'h, MockHeap>> {
        FullMarkingVisitor::new(
            self.heap,
            &self.state,
            &self.worklists,
            &self.weak_objects,
            &self.options,
            1,
        )
    }

    pub fn young_visitor(
        &self,
    ) -> YoungGenerationMarkingVisitor<'_, MockHeap, BitmapMarkingState<'h, MockHeap>> {
        YoungGenerationMarkingVisitor::new(
            self.heap,
            &self.state,
            &self.worklists,
            &self.ephemeron_tables,
            &self.options,
        )
    }

    pub fn is_marked(&self, object: ObjectId) -> bool {
        self.state.is_marked(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_values() {
        for value in [
            MaybeObject::Smi(0),
            MaybeObject::Smi(-5),
            MaybeObject::Smi(1 << 20),
            MaybeObject::Cleared,
            MaybeObject::Strong(ObjectId(7)),
            MaybeObject::Weak(ObjectId(u32::MAX)),
        ] {
            assert_eq!(decode(encode(value)), value);
        }
    }

    #[test]
    fn builder_defaults() {
        let mut heap = MockHeap::new();
        let cell = heap.build(VisitorId::WeakCell).finish();
        let array = heap
            .build(VisitorId::DescriptorArray)
            .descriptors(3)
            .finish();
        assert_eq!(heap.field_count(cell), layout::weak_cell::HOLDINGS + 1);
        assert_eq!(heap.number_of_descriptors(array), 3);
        assert_eq!(heap.load(cell, layout::MAP), MaybeObject::Smi(0));
        assert_eq!(heap.len(), 2);
    }
}
