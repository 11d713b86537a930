//! Thin wrappers over the operating system's virtual memory calls.

pub mod memory;

pub use memory::MmapAnnotation;
pub use memory::MmapProtection;
