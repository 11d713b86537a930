use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use strum_macros::{Display, EnumIter, IntoStaticStr};

use crate::heap::descriptor_array::DescriptorArrayMarkingState;
use crate::heap::progress_bar::ProgressBar;
use crate::sandbox::ExternalPointerTag;
use crate::util::Address;

/// The content of a tagged slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MaybeObject<O> {
    /// A small integer. Never a reference.
    Smi(isize),
    /// A weak reference whose target has died.
    Cleared,
    Strong(O),
    Weak(O),
}

impl<O: Copy> MaybeObject<O> {
    pub fn strong(self) -> Option<O> {
        match self {
            MaybeObject::Strong(o) => Some(o),
            _ => None,
        }
    }

    pub fn weak(self) -> Option<O> {
        match self {
            MaybeObject::Weak(o) => Some(o),
            _ => None,
        }
    }

    /// The referenced object, whether the reference is strong or weak.
    pub fn heap_object(self) -> Option<O> {
        match self {
            MaybeObject::Strong(o) | MaybeObject::Weak(o) => Some(o),
            _ => None,
        }
    }
}

/// A tagged slot: field `index` of `host`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Slot<O> {
    pub host: O,
    pub index: usize,
}

impl<O> Slot<O> {
    pub fn new(host: O, index: usize) -> Self {
        Slot { host, index }
    }
}

/// Selects how the marking visitors traverse an object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
pub enum VisitorId {
    /// An object without references, such as a string or a heap number.
    DataObject,
    /// A plain JavaScript object. All fields are strong.
    JSObject,
    /// A strong array, which may be scanned in chunks.
    FixedArray,
    /// An array whose elements may be weak.
    WeakFixedArray,
    /// See [`crate::vm::layout::descriptor_array`].
    DescriptorArray,
    /// See [`crate::vm::layout::map`].
    Map,
    /// A map's transitions. Targets are weak.
    TransitionArray,
    /// See [`crate::vm::layout::ephemeron_hash_table`].
    EphemeronHashTable,
    /// See [`crate::vm::layout::js_weak_ref`].
    JSWeakRef,
    /// See [`crate::vm::layout::weak_cell`].
    WeakCell,
    /// See [`crate::vm::layout::shared_function_info`].
    SharedFunctionInfo,
    /// See [`crate::vm::layout::js_function`].
    JSFunction,
    BytecodeArray,
    /// Compiled code. See [`crate::vm::layout::code`].
    Code,
    /// An object created through the embedder API, possibly wrapping an embedder object.
    JSApiObject,
    JSArrayBuffer,
    JSTypedArray,
    JSDataView,
}

/// The tier of a compiled code object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodeKind {
    /// Non-optimizing compiled code that keeps the bytecode it was compiled from.
    Baseline,
    Optimized,
    Other,
}

/// Identifies an embedder object wrapped by a heap object. Opaque to the collector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct WrapperSnapshot {
    pub type_info: Address,
    pub instance: Address,
}

/// The heap object model: what the marking visitors need to know about objects.
///
/// Field accesses may race with the mutator, so fields are loaded and stored with an
/// explicit ordering. Everything else is expected to stay fixed while an object is visited,
/// apart from the atomics handed out by reference.
pub trait ObjectModel: Sync {
    /// A reference to a heap object.
    type Object: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn visitor_id(&self, object: Self::Object) -> VisitorId;

    /// The size of the object in bytes.
    fn size_of(&self, object: Self::Object) -> usize;

    /// The number of tagged slots, including the map slot.
    fn field_count(&self, object: Self::Object) -> usize;

    fn load_field(
        &self,
        object: Self::Object,
        index: usize,
        order: Ordering,
    ) -> MaybeObject<Self::Object>;

    fn store_field(
        &self,
        object: Self::Object,
        index: usize,
        value: MaybeObject<Self::Object>,
        order: Ordering,
    );

    /// Objects in read-only space are immortal and never marked.
    fn in_read_only_space(&self, object: Self::Object) -> bool;

    fn in_young_generation(&self, object: Self::Object) -> bool;

    /// A dense index for side tables such as mark bitmaps.
    fn object_index(&self, object: Self::Object) -> usize;

    /// The progress bar of a large array, if its page has one enabled.
    fn progress_bar(&self, array: Self::Object) -> Option<&ProgressBar>;

    fn number_of_descriptors(&self, array: Self::Object) -> usize;

    fn descriptor_array_marking_state(&self, array: Self::Object) -> &DescriptorArrayMarkingState;

    /// Strong descriptor arrays are never shared between maps and are visited like
    /// ordinary arrays.
    fn is_strong_descriptor_array(&self, array: Self::Object) -> bool;

    /// The number of descriptors in the map's descriptor array that belong to the map.
    fn number_of_own_descriptors(&self, map: Self::Object) -> usize;

    /// Can the map transition to other maps, sharing its descriptor array with them?
    fn map_can_transition(&self, map: Self::Object) -> bool;

    /// The age counter used to decide whether a function's bytecode is old.
    fn shared_function_info_age(&self, shared: Self::Object) -> &AtomicU16;

    /// Resumable functions and functions that cannot be lazily recompiled never lose
    /// their bytecode.
    fn allows_bytecode_flushing(&self, shared: Self::Object) -> bool;

    fn code_kind(&self, code: Self::Object) -> CodeKind;

    /// Does the function still point at code compiled from bytecode that was flushed?
    fn needs_reset_due_to_flushed_bytecode(&self, function: Self::Object) -> bool;

    /// Keep the array buffer's out-of-heap extension alive.
    fn mark_array_buffer_extension(&self, _buffer: Self::Object, _young: bool) {}

    /// Call `visit` for every external pointer handle field of the object.
    fn visit_external_pointer_slots(
        &self,
        _object: Self::Object,
        _visit: &mut dyn FnMut(&AtomicU32, ExternalPointerTag),
    ) {
    }

    /// The allocation site recorded by the memento behind the object, if there is one.
    fn allocation_site(&self, object: Self::Object) -> Option<Self::Object>;

    /// The embedder object wrapped by an API object, if it has one.
    fn extract_wrapper(&self, object: Self::Object) -> Option<WrapperSnapshot>;

    /// Will the object be moved by the coming compaction? Slots referring to it are
    /// recorded so they can be updated.
    fn is_evacuation_candidate(&self, _object: Self::Object) -> bool {
        false
    }
}
