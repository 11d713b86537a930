//! Marking.
//!
//! A marking cycle shares a [`marking_state::MarkingState`], the
//! [`worklist::MarkingWorklists`] and the [`worklist::WeakObjects`] between any number of
//! threads. Each thread marks with its own visitor, [`full::FullMarkingVisitor`] for a
//! full-heap cycle or [`young::YoungGenerationMarkingVisitor`] for a young generation cycle,
//! and the functions in [`marker`] drive the visitors to a fixed point.

pub mod code_flushing;
pub mod descriptor_array;
pub mod full;
pub mod marker;
pub mod marking_state;
pub mod pretenuring;
pub mod progress_bar;
pub mod retainers;
pub mod visitor;
pub mod worklist;
pub mod young;

pub use self::full::FullMarkingVisitor;
pub use self::marking_state::{BitmapMarkingState, MarkingState};
pub use self::visitor::MarkingVisitor;
pub use self::worklist::{MarkingWorklists, WeakObjects, Worklist};
pub use self::young::YoungGenerationMarkingVisitor;
