//! The interface between the marking subsystem and the heap it marks.
//!
//! The visitors in [`crate::heap`] never look at object memory directly. They go through an
//! [`ObjectModel`], which the embedding heap implements.

pub mod layout;
mod object_model;

pub use self::object_model::*;
