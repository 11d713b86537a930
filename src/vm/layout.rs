//! Field layouts of the object kinds the marking visitors treat specially.
//!
//! Every object is a sequence of tagged slots. Slot 0 holds the object's map. The
//! remaining slots of an ordinary object are visited as strong references, except where
//! a layout below names a slot that is visited in some other way.

/// The slot holding the map of every object.
pub const MAP: usize = 0;

/// The first slot after the map.
pub const BODY_START: usize = 1;

pub mod fixed_array {
    /// The length, a small integer.
    pub const LENGTH: usize = 1;
    /// Elements start right after the length. Visiting the length is harmless.
    pub const BODY_START: usize = 1;
}

pub mod descriptor_array {
    /// The header: the enum cache.
    pub const ENUM_CACHE: usize = 1;
    pub const FIRST_DESCRIPTOR: usize = 2;
    /// Each descriptor is a key, its property details, and a value that may be weak.
    pub const ENTRY_SIZE: usize = 3;

    /// The first slot of descriptor `index`.
    pub const fn descriptor_slot(index: usize) -> usize {
        FIRST_DESCRIPTOR + index * ENTRY_SIZE
    }

    /// The value slot of descriptor `index`.
    pub const fn value_slot(index: usize) -> usize {
        descriptor_slot(index) + 2
    }
}

pub mod map {
    pub const INSTANCE_DESCRIPTORS: usize = 1;
    pub const PROTOTYPE: usize = 2;
    /// A transition array, or a weak reference to the single transition target.
    pub const TRANSITIONS: usize = 3;
}

pub mod ephemeron_hash_table {
    pub const NUMBER_OF_ELEMENTS: usize = 1;
    pub const CAPACITY: usize = 2;
    pub const ENTRIES_START: usize = 3;
    pub const ENTRY_SIZE: usize = 2;

    pub const fn key_slot(entry: usize) -> usize {
        ENTRIES_START + entry * ENTRY_SIZE
    }

    pub const fn value_slot(entry: usize) -> usize {
        key_slot(entry) + 1
    }

    pub const fn number_of_entries(field_count: usize) -> usize {
        field_count.saturating_sub(ENTRIES_START) / ENTRY_SIZE
    }
}

pub mod js_weak_ref {
    /// Not visited as a strong reference.
    pub const TARGET: usize = 1;
}

pub mod weak_cell {
    pub const FINALIZATION_REGISTRY: usize = 1;
    /// Not visited as a strong reference.
    pub const TARGET: usize = 2;
    /// Not visited as a strong reference.
    pub const UNREGISTER_TOKEN: usize = 3;
    pub const HOLDINGS: usize = 4;
}

pub mod shared_function_info {
    /// Bytecode, baseline code, or other function data. Only visited strongly when the
    /// function's bytecode is not flushed.
    pub const FUNCTION_DATA: usize = 1;
}

pub mod code {
    /// The bytecode hanging off baseline code.
    pub const BYTECODE_OR_INTERPRETER_DATA: usize = 1;
}

pub mod js_function {
    pub const SHARED_FUNCTION_INFO: usize = 1;
    pub const CONTEXT: usize = 2;
    /// Not visited strongly while the function's baseline code may be flushed.
    pub const CODE: usize = 3;
    pub const FEEDBACK_CELL: usize = 4;
}
