//! Sandboxed tables of out-of-heap entities.
//!
//! Managed objects refer to out-of-heap resources through 32-bit indices into a table that
//! lives in its own reserved address range, never through raw pointers.

pub mod entity_table;
pub mod external_pointer_table;
pub mod freelist;
pub mod segment;
pub mod vas;

pub use entity_table::{ExternalEntityTable, Space, TableEntry};
pub use external_pointer_table::{
    ExternalPointerHandle, ExternalPointerSpace, ExternalPointerSpaceRef, ExternalPointerSpaces,
    ExternalPointerTable, ExternalPointerTag,
};
